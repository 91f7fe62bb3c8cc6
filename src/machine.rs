//! The machine driver: the active-state stack, the ticker task, and the
//! transition engine.
//!
//! One task, the *ticker*, owns every mutation of machine state. Each pass
//! walks the stack of active states from the root down, runs each state's
//! `do` behaviour, and lets every composite evaluate the transition function
//! registered for its current child. Transition functions receive a
//! [`Scope`] and carry out transitions through it; the engine serialises the
//! canonical exit → transition actions → entry ordering, cascades entry into
//! freshly entered composites, and keeps the stack in sync.
//!
//! The stack is iterated live, by index: states activated during a pass are
//! visited later in the same pass, so the target of a transition runs its
//! `do` in the tick that fired the transition.

use crate::{
    error::Error,
    event::{yield_now, Event, TickSignal},
    trace::Tracer,
    tree::{Action, CompositeNode, HistoryKind, Kind, MachineBuilder, Node, StateId},
};
use futures::{
    future::{
        abortable, try_join_all, AbortHandle, Aborted, FutureExt, LocalBoxFuture, RemoteHandle,
    },
    task::{LocalSpawn, LocalSpawnExt},
};
use futures_timer::Delay;
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};
use tracing::{debug, trace};

/// A transition function: polls guards and may transition the region it was
/// invoked for.
pub(crate) type TransitionFn = Rc<dyn Fn(Scope) -> LocalBoxFuture<'static, Result<(), Error>>>;

/// One element of the active-state stack: a single state, or the set of
/// states currently active across a concurrent composite's regions.
#[derive(Clone)]
enum StackEntry {
    Single(StateId),
    Frame(Vec<StateId>),
}

/// A read-only snapshot element of the active-state stack, as returned by
/// [`Machine::active_state_names`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveState {
    /// A single active state.
    Single(String),
    /// The active states of a concurrent composite's regions, sorted by
    /// name for stable comparisons.
    Region(Vec<String>),
}

struct Ticker {
    abort: AbortHandle,
    done: RemoteHandle<Result<Result<(), Error>, Aborted>>,
}

pub(crate) struct Core {
    nodes: Vec<Node>,
    root: StateId,
    stack: RefCell<Vec<StackEntry>>,
    tick: Rc<TickSignal>,
    tracer: Rc<Tracer>,
    poll_interval: Duration,
    ticker: RefCell<Option<Ticker>>,
    started: Cell<bool>,
}

impl Core {
    fn node(&self, id: StateId) -> &Node {
        &self.nodes[id.0]
    }

    fn composite(&self, id: StateId) -> Result<&CompositeNode, Error> {
        match &self.node(id).kind {
            Kind::Composite(comp) => Ok(comp),
            _ => Err(Error::NotAComposite { state: self.node(id).name.clone() }),
        }
    }

    fn at_final(&self, id: StateId) -> bool {
        match &self.node(id).kind {
            Kind::Composite(comp) => comp.current.borrow().iter().all(|c| *c == comp.final_),
            _ => false,
        }
    }

    /// Whether the parent of `id` runs orthogonal regions, which decides
    /// between single-entry and frame activation.
    fn parent_is_concurrent(&self, id: StateId) -> Result<bool, Error> {
        let parent = self.node(id).parent.ok_or_else(|| Error::ParentMissing {
            state: self.node(id).name.clone(),
        })?;
        Ok(self.composite(parent)?.regions > 1)
    }

    fn activate(&self, id: StateId) -> Result<(), Error> {
        let concurrent = self.parent_is_concurrent(id)?;
        {
            let mut stack = self.stack.borrow_mut();
            if concurrent {
                if let Some(StackEntry::Frame(members)) = stack.last_mut() {
                    members.push(id);
                } else {
                    stack.push(StackEntry::Frame(vec![id]));
                }
            } else {
                stack.push(StackEntry::Single(id));
            }
        }
        debug!(state = %self.node(id).name, stack = ?self.active_names(), "activated");
        Ok(())
    }

    fn deactivate(&self, id: StateId) -> Result<(), Error> {
        let concurrent = self.parent_is_concurrent(id)?;
        let out_of_sync = || Error::StackOutOfSync { state: self.node(id).name.clone() };
        {
            let mut stack = self.stack.borrow_mut();
            if concurrent {
                match stack.last_mut() {
                    Some(StackEntry::Frame(members)) if members.contains(&id) => {
                        members.retain(|m| *m != id);
                        if members.is_empty() {
                            stack.pop();
                        }
                    }
                    _ => return Err(out_of_sync()),
                }
            } else {
                match stack.last() {
                    Some(StackEntry::Single(top)) if *top == id => {
                        stack.pop();
                    }
                    _ => return Err(out_of_sync()),
                }
            }
        }
        debug!(state = %self.node(id).name, stack = ?self.active_names(), "deactivated");
        Ok(())
    }

    /// Stack snapshot as names, root included.
    fn active_names(&self) -> Vec<ActiveState> {
        self.stack
            .borrow()
            .iter()
            .map(|entry| match entry {
                StackEntry::Single(id) => ActiveState::Single(self.node(*id).name.clone()),
                StackEntry::Frame(members) => {
                    let mut names: Vec<String> =
                        members.iter().map(|id| self.node(*id).name.clone()).collect();
                    names.sort();
                    ActiveState::Region(names)
                }
            })
            .collect()
    }
}

/// The context handed to a transition function: the composite it belongs to
/// and the region it was invoked for.
///
/// For a plain composite the region is always 0. For a concurrent composite
/// the framework curries the index of the region whose current child the
/// function is registered for; the initial and history functions, which must
/// drive *every* region, address them explicitly with
/// [`transition_in`](Scope::transition_in) and
/// [`handle_history_in`](Scope::handle_history_in).
#[derive(Clone)]
pub struct Scope {
    core: Rc<Core>,
    owner: StateId,
    region: usize,
}

impl Scope {
    /// The region this invocation is evaluating.
    pub fn region(&self) -> usize {
        self.region
    }

    /// Transitions this region's current child to `target`.
    ///
    /// Runs the full exit → entry protocol: the current child (and its
    /// active subtree) exits, then `target` is entered and activated, and a
    /// composite target runs its initial (or history) transition to
    /// completion before this call returns. Transitioning to the owner's
    /// final pseudo-state raises the tick signal so the parent can observe
    /// completion on the next pass.
    pub async fn transition_to(&self, target: StateId) -> Result<(), Error> {
        transition(&self.core, self.owner, self.region, target, Vec::new()).await
    }

    /// Like [`transition_to`](Scope::transition_to), with transition actions
    /// run between the exit of the source and the entry of the target, in
    /// the order given.
    pub async fn transition_with(
        &self,
        target: StateId,
        actions: Vec<Action>,
    ) -> Result<(), Error> {
        transition(&self.core, self.owner, self.region, target, actions).await
    }

    /// Transitions an explicit region. The initial transition function of a
    /// concurrent composite must call this once per region.
    pub async fn transition_in(&self, region: usize, target: StateId) -> Result<(), Error> {
        transition(&self.core, self.owner, region, target, Vec::new()).await
    }

    /// [`transition_in`](Scope::transition_in) with transition actions.
    pub async fn transition_in_with(
        &self,
        region: usize,
        target: StateId,
        actions: Vec<Action>,
    ) -> Result<(), Error> {
        transition(&self.core, self.owner, region, target, actions).await
    }

    /// Restores the child remembered by the owner's history pseudo-state
    /// for this region, then forgets it.
    ///
    /// Fails with [`Error::NothingToReturnTo`] when no child is remembered.
    pub async fn handle_history(&self) -> Result<(), Error> {
        self.handle_history_in(self.region).await
    }

    /// [`handle_history`](Scope::handle_history) for an explicit region.
    /// The history transition function of a concurrent composite calls this
    /// once per region.
    pub async fn handle_history_in(&self, region: usize) -> Result<(), Error> {
        let comp = self.core.composite(self.owner)?;
        if region >= comp.regions {
            return Err(Error::RegionOutOfRange {
                state: self.core.node(self.owner).name.clone(),
                region,
            });
        }
        let target = comp.remembered.borrow()[region].ok_or_else(|| Error::NothingToReturnTo {
            state: self.core.node(self.owner).name.clone(),
        })?;
        debug!(to = %self.core.node(target).name, "history restores");
        transition(&self.core, self.owner, region, target, Vec::new()).await?;
        comp.remembered.borrow_mut()[region] = None;
        Ok(())
    }

    /// Whether `composite` currently sits at its final pseudo-state in every
    /// region. `false` for anything that is not a composite. This is the
    /// guard completion transitions poll.
    pub fn is_at_final_state(&self, composite: StateId) -> bool {
        self.core.at_final(composite)
    }
}

/// A running hierarchical state machine: the root composite, the
/// active-state stack, and the ticker that drives it.
///
/// Build one with [`Machine::builder`], then [`start`](Machine::start) it on
/// an executor that can spawn non-`Send` futures. Machines are one-shot:
/// once stopped they cannot be started again.
pub struct Machine {
    core: Rc<Core>,
}

impl Machine {
    /// Starts assembling a machine whose root composite carries `name`.
    pub fn builder(name: &str) -> MachineBuilder {
        MachineBuilder::new(name)
    }

    pub(crate) fn assemble(
        nodes: Vec<Node>,
        root: StateId,
        tick: Rc<TickSignal>,
        tracer: Rc<Tracer>,
        poll_interval: Duration,
    ) -> Machine {
        Machine {
            core: Rc::new(Core {
                nodes,
                root,
                stack: RefCell::new(Vec::new()),
                tick,
                tracer,
                poll_interval,
                ticker: RefCell::new(None),
                started: Cell::new(false),
            }),
        }
    }

    /// The root composite.
    pub fn root(&self) -> StateId {
        self.core.root
    }

    /// The name of a state.
    pub fn name(&self, id: StateId) -> &str {
        &self.core.node(id).name
    }

    /// Activates the root, spawns the ticker, and waits one poll interval so
    /// the first pass (which runs the root's initial transition, cascading
    /// down) settles before the caller proceeds.
    ///
    /// Fails with [`Error::AlreadyStarted`] on reuse.
    pub async fn start(&self, spawner: &impl LocalSpawn) -> Result<(), Error> {
        if self.core.started.replace(true) {
            return Err(Error::AlreadyStarted);
        }
        self.core.stack.borrow_mut().push(StackEntry::Single(self.core.root));
        let (task, abort) = abortable(ticker(Rc::clone(&self.core)));
        let (remote, done) = task.remote_handle();
        spawner.spawn_local(remote)?;
        *self.core.ticker.borrow_mut() = Some(Ticker { abort, done });
        debug!("ticker started");
        Delay::new(self.core.poll_interval).await;
        Ok(())
    }

    /// Requests a tick and yields once so the ticker can take its pass.
    pub async fn trigger_tick(&self) {
        self.core.tick.raise();
        yield_now().await;
    }

    /// Cancels the ticker and waits for it to wind down. When `stopped` is
    /// supplied, it is set once the ticker has finished.
    ///
    /// Stopping always succeeds; the returned error, if any, is the fault
    /// that had already terminated the ticker. After this resolves no
    /// further `do` or transition logic runs, and setting events has no
    /// effect beyond flipping their flags.
    pub async fn stop_ticker(&self, stopped: Option<&Event>) -> Result<(), Error> {
        let Ticker { abort, done } = self.core.ticker.borrow_mut().take().ok_or(Error::NotStarted)?;
        abort.abort();
        let outcome = done.await;
        if let Some(event) = stopped {
            event.set().await;
        }
        match outcome {
            Err(Aborted) => Ok(()),
            Ok(result) => result,
        }
    }

    /// A fresh snapshot of the active-state stack, root omitted. Concurrent
    /// frames render as name-sorted [`ActiveState::Region`] entries.
    pub fn active_state_names(&self) -> Vec<ActiveState> {
        self.core.active_names().into_iter().skip(1).collect()
    }

    /// Whether `composite` currently sits at its final pseudo-state in every
    /// region. `false` for anything that is not a composite.
    pub fn is_at_final_state(&self, composite: StateId) -> bool {
        self.core.at_final(composite)
    }
}

/// The ticker: one pass over the active states, then park until the next
/// tick is requested.
async fn ticker(core: Rc<Core>) -> Result<(), Error> {
    scopeguard::defer! {
        debug!("ticker stopped");
    }
    loop {
        tick_pass(&core).await?;
        core.tick.wait().await;
    }
}

async fn tick_pass(core: &Rc<Core>) -> Result<(), Error> {
    trace!("tick");
    let mut index = 0;
    loop {
        let entry = core.stack.borrow().get(index).cloned();
        match entry {
            None => break,
            Some(StackEntry::Single(id)) => run_do(core, id).await?,
            Some(StackEntry::Frame(members)) => {
                for id in members {
                    // A region may have moved on mid-pass; only the states
                    // still in the frame get their turn.
                    let present = matches!(
                        core.stack.borrow().get(index),
                        Some(StackEntry::Frame(m)) if m.contains(&id)
                    );
                    if present {
                        run_do(core, id).await?;
                    }
                }
            }
        }
        index += 1;
    }
    Ok(())
}

/// Runs one state's per-tick behaviour: its `do` actions, and for a
/// composite the transition evaluation for its current child(ren).
fn run_do(core: &Rc<Core>, id: StateId) -> LocalBoxFuture<'static, Result<(), Error>> {
    let core = Rc::clone(core);
    async move {
        let node = core.node(id);
        core.tracer.line(format_args!("{0} -> {0} : do()", node.name));
        if let Some(hook) = node.hooks.do_.clone() {
            hook().await?;
        }
        if matches!(node.kind, Kind::Composite(_)) {
            evaluate(&core, id).await?;
        }
        Ok(())
    }
    .boxed_local()
}

/// Looks up and runs the transition function(s) for a composite's current
/// child(ren). A missing entry means "no transition from here".
fn evaluate(core: &Rc<Core>, owner: StateId) -> LocalBoxFuture<'static, Result<(), Error>> {
    let core = Rc::clone(core);
    async move {
        let comp = core.composite(owner)?;
        let currents = comp.current.borrow().clone();
        let on_pseudo = currents[0] == comp.initial || Some(currents[0]) == comp.history;
        if comp.regions == 1 || on_pseudo {
            // One function drives the composite: the current child's, or for
            // a concurrent composite still on its initial/history
            // pseudo-state, the single function that must fan out to every
            // region.
            let f = comp.transitions.borrow().get(&currents[0]).cloned();
            if let Some(f) = f {
                f(Scope { core: Rc::clone(&core), owner, region: 0 }).await?;
                if on_pseudo && comp.regions > 1 {
                    let now = comp.current.borrow();
                    for (region, current) in now.iter().enumerate() {
                        if *current == comp.initial || Some(*current) == comp.history {
                            return Err(Error::RegionNotEntered {
                                state: core.node(owner).name.clone(),
                                region,
                            });
                        }
                    }
                }
            }
        } else {
            // Orthogonal regions evaluate jointly, with no ordering
            // guarantee among them.
            let mut evaluations = Vec::new();
            for (region, current) in currents.iter().enumerate() {
                if let Some(f) = comp.transitions.borrow().get(current).cloned() {
                    evaluations.push(f(Scope { core: Rc::clone(&core), owner, region }));
                }
            }
            try_join_all(evaluations).await?;
        }
        Ok(())
    }
    .boxed_local()
}

/// The canonical transition protocol for one region of `owner`:
/// exit the current child's subtree, run the transition actions, enter the
/// target, and cascade into it if it is a composite.
fn transition(
    core: &Rc<Core>,
    owner: StateId,
    region: usize,
    target: StateId,
    actions: Vec<Action>,
) -> LocalBoxFuture<'static, Result<(), Error>> {
    let core = Rc::clone(core);
    async move {
        let comp = core.composite(owner)?;
        if region >= comp.regions {
            return Err(Error::RegionOutOfRange {
                state: core.node(owner).name.clone(),
                region,
            });
        }
        if core.node(target).parent != Some(owner) {
            return Err(Error::NotAChild {
                state: core.node(target).name.clone(),
                composite: core.node(owner).name.clone(),
            });
        }

        let source = comp.current.borrow()[region];
        exit_state(&core, source, false).await?;
        debug!(from = %core.node(source).name, to = %core.node(target).name, "transition");
        for action in actions {
            action().await?;
        }

        let target_is_pseudo = core.node(target).is_pseudo();
        if !target_is_pseudo {
            enter_node(&core, target).await?;
        }
        comp.current.borrow_mut()[region] = target;
        if target == comp.final_ && comp.regions == 1 {
            // Completion poke: the parent's guard sees the final child on
            // the next pass. A concurrent region reaching its local final
            // does not request one; callers pump the extra tick themselves.
            core.tick.raise();
        }
        if !target_is_pseudo && matches!(core.node(target).kind, Kind::Composite(_)) {
            enter_cascade(&core, target).await?;
        }
        Ok(())
    }
    .boxed_local()
}

/// Exits a state and its whole active subtree, bottom-up, maintaining
/// history bookkeeping on the way.
///
/// `deep` is true while exiting below a composite with deep history: every
/// composite in that span remembers its current children even without a
/// history pseudo-state of its own.
fn exit_state(
    core: &Rc<Core>,
    id: StateId,
    deep: bool,
) -> LocalBoxFuture<'static, Result<(), Error>> {
    let core = Rc::clone(core);
    async move {
        match &core.node(id).kind {
            // Pseudo-states run no behaviour and never sit on the stack.
            Kind::Initial | Kind::Final | Kind::History => Ok(()),
            Kind::Leaf => exit_hooks_and_pop(&core, id).await,
            Kind::Composite(comp) => {
                let deep_below = deep || comp.history_kind == Some(HistoryKind::Deep);
                let currents = comp.current.borrow().clone();
                // Regions unwind in reverse activation order so their stack
                // entries pop LIFO.
                for current in currents.iter().rev() {
                    exit_state(&core, *current, deep_below).await?;
                }

                let keep = (comp.history.is_some() || deep)
                    && currents.iter().any(|c| *c != comp.final_);
                {
                    let mut current = comp.current.borrow_mut();
                    let mut remembered = comp.remembered.borrow_mut();
                    for region in 0..comp.regions {
                        if keep {
                            remembered[region] = Some(currents[region]);
                            current[region] = comp.history.unwrap_or(comp.initial);
                        } else {
                            current[region] = comp.initial;
                        }
                    }
                }
                exit_hooks_and_pop(&core, id).await
            }
        }
    }
    .boxed_local()
}

async fn exit_hooks_and_pop(core: &Rc<Core>, id: StateId) -> Result<(), Error> {
    let node = core.node(id);
    core.tracer.line(format_args!("{0} -> {0} : exit()", node.name));
    if let Some(hook) = node.hooks.exit.clone() {
        hook().await?;
    }
    core.deactivate(id)?;
    core.tracer.line(format_args!("deactivate {}", node.name));
    Ok(())
}

async fn enter_node(core: &Rc<Core>, id: StateId) -> Result<(), Error> {
    let node = core.node(id);
    core.tracer.line(format_args!("activate {}", node.name));
    core.tracer.line(format_args!("{0} -> {0} : entry()", node.name));
    if let Some(hook) = node.hooks.entry.clone() {
        hook().await?;
    }
    core.activate(id)
}

/// After a composite is entered, drive it to a stable child configuration:
/// resume children remembered through an ancestor's deep history, or run the
/// transition function of its initial/history pseudo-state to completion.
fn enter_cascade(core: &Rc<Core>, id: StateId) -> LocalBoxFuture<'static, Result<(), Error>> {
    let core = Rc::clone(core);
    async move {
        let comp = core.composite(id)?;
        let resume: Vec<(usize, StateId)> = if comp.history.is_none() {
            let mut remembered = comp.remembered.borrow_mut();
            remembered
                .iter_mut()
                .enumerate()
                .filter_map(|(region, slot)| slot.take().map(|s| (region, s)))
                .collect()
        } else {
            Vec::new()
        };
        if resume.is_empty() {
            evaluate(&core, id).await
        } else {
            for (region, remembered) in resume {
                transition(&core, id, region, remembered, Vec::new()).await?;
            }
            Ok(())
        }
    }
    .boxed_local()
}
