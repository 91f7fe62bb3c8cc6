//! The state tree: an arena of nodes assembled by [`MachineBuilder`].
//!
//! Every state (simple, composite, concurrent, or pseudo) is a node in a
//! `Vec` owned by the machine, addressed by [`StateId`]. Parent links and
//! history's remembered children are ids into the same arena, so the tree
//! has no ownership cycles and is dropped wholesale with the machine.
//!
//! The builder is the only way to grow the arena. Once
//! [`MachineBuilder::build`] has validated the tree and produced a
//! [`Machine`], the node set, parent links, and transition tables are
//! frozen; only per-composite bookkeeping (current children, history) and
//! the active-state stack mutate at runtime.
//!
//! [`Machine`]: crate::Machine

use crate::{
    error::Error,
    event::{Event, EventWithValue, TickSignal},
    machine::{Machine, Scope, TransitionFn},
    trace::Tracer,
};
use futures::future::{FutureExt, LocalBoxFuture};
use std::{cell::RefCell, collections::HashMap, future::Future, rc::Rc, time::Duration};

/// Index of a state in the machine's arena. Copyable, hashable, and stable
/// for the life of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

/// How a composite's history pseudo-state restores children on re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// Restore the directly remembered child; nested composites re-run
    /// their own initial transitions.
    Shallow,
    /// Restore the directly remembered child *and* have every composite
    /// below it resume its own remembered child instead of its initial.
    Deep,
}

/// A stored entry/do/exit callback.
pub(crate) type Hook = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>;

/// A transition action, run between the exit of the source and the entry of
/// the target. Build one with [`action`].
pub type Action = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>;

/// Wraps an async closure as a transition [`Action`].
pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move || f().boxed_local())
}

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) entry: Option<Hook>,
    pub(crate) do_: Option<Hook>,
    pub(crate) exit: Option<Hook>,
}

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<StateId>,
    pub(crate) kind: Kind,
    pub(crate) hooks: Hooks,
}

impl Node {
    pub(crate) fn is_pseudo(&self) -> bool {
        matches!(self.kind, Kind::Initial | Kind::Final | Kind::History)
    }
}

pub(crate) enum Kind {
    Leaf,
    Initial,
    Final,
    History,
    Composite(CompositeNode),
}

/// The payload of a composite node: pseudo-children, per-region bookkeeping,
/// and the transition table keyed by direct-child id.
pub(crate) struct CompositeNode {
    pub(crate) initial: StateId,
    pub(crate) final_: StateId,
    pub(crate) history: Option<StateId>,
    pub(crate) history_kind: Option<HistoryKind>,
    /// 1 for a plain composite, >= 2 for a concurrent one.
    pub(crate) regions: usize,
    pub(crate) current: RefCell<Vec<StateId>>,
    /// History storage, one slot per region. Also used to resume nested
    /// composites entered through an ancestor's deep history.
    pub(crate) remembered: RefCell<Vec<Option<StateId>>>,
    pub(crate) transitions: RefCell<HashMap<StateId, TransitionFn>>,
}

/// Assembles a state tree and produces a [`Machine`].
///
/// See the crate docs for a worked example. All structural mistakes are
/// reported here, before the machine ever runs: parenting a child on a
/// leaf, a concurrent composite with one region, hooks on pseudo-states,
/// a composite without an initial transition.
///
/// [`Machine`]: crate::Machine
pub struct MachineBuilder {
    nodes: Vec<Node>,
    root: StateId,
    tick: Rc<TickSignal>,
    tracer: Rc<Tracer>,
    poll_interval: Duration,
    declared_events: bool,
}

impl MachineBuilder {
    pub(crate) fn new(name: &str) -> Self {
        let mut builder = MachineBuilder {
            nodes: Vec::new(),
            root: StateId(0),
            tick: TickSignal::new(),
            tracer: Rc::new(Tracer::new()),
            poll_interval: Duration::from_millis(50),
            declared_events: false,
        };
        builder.root = builder
            .push_composite(None, name, 1, None)
            .expect("the root composite has no parent to mismatch");
        builder
    }

    /// The root composite every other state descends from.
    pub fn root(&self) -> StateId {
        self.root
    }

    /// Adds a simple state under `parent`.
    pub fn state(&mut self, parent: StateId, name: &str) -> Result<StateId, Error> {
        self.ensure_composite(parent)?;
        Ok(self.push_node(Some(parent), name, Kind::Leaf))
    }

    /// Adds a plain composite state under `parent`.
    pub fn composite(&mut self, parent: StateId, name: &str) -> Result<StateId, Error> {
        self.push_composite(Some(parent), name, 1, None)
    }

    /// Adds a plain composite state with a history pseudo-state.
    pub fn composite_with_history(
        &mut self,
        parent: StateId,
        name: &str,
        kind: HistoryKind,
    ) -> Result<StateId, Error> {
        self.push_composite(Some(parent), name, 1, Some(kind))
    }

    /// Adds a concurrent composite with `regions` orthogonal regions.
    ///
    /// Fails with [`Error::NotEnoughRegions`] for `regions < 2`.
    pub fn concurrent(
        &mut self,
        parent: StateId,
        name: &str,
        regions: usize,
    ) -> Result<StateId, Error> {
        if regions < 2 {
            return Err(Error::NotEnoughRegions { state: name.to_owned(), regions });
        }
        self.push_composite(Some(parent), name, regions, None)
    }

    /// Adds a concurrent composite that also keeps per-region history.
    pub fn concurrent_with_history(
        &mut self,
        parent: StateId,
        name: &str,
        regions: usize,
        kind: HistoryKind,
    ) -> Result<StateId, Error> {
        if regions < 2 {
            return Err(Error::NotEnoughRegions { state: name.to_owned(), regions });
        }
        self.push_composite(Some(parent), name, regions, Some(kind))
    }

    /// The initial pseudo-state of `composite`, for keying its initial
    /// transition.
    pub fn initial_of(&self, composite: StateId) -> Result<StateId, Error> {
        Ok(self.ensure_composite(composite)?.initial)
    }

    /// The final pseudo-state of `composite`, for use as a transition target.
    pub fn final_of(&self, composite: StateId) -> Result<StateId, Error> {
        Ok(self.ensure_composite(composite)?.final_)
    }

    /// The history pseudo-state of `composite`, if it was built with one.
    pub fn history_of(&self, composite: StateId) -> Result<Option<StateId>, Error> {
        Ok(self.ensure_composite(composite)?.history)
    }

    /// Attaches the entry actions of `state`.
    pub fn on_entry<F, Fut>(&mut self, state: StateId, hook: F) -> Result<(), Error>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        self.hooks_mut(state)?.entry = Some(wrap_hook(hook));
        Ok(())
    }

    /// Attaches the do actions of `state`, run once per tick while active.
    pub fn on_do<F, Fut>(&mut self, state: StateId, hook: F) -> Result<(), Error>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        self.hooks_mut(state)?.do_ = Some(wrap_hook(hook));
        Ok(())
    }

    /// Attaches the exit actions of `state`.
    pub fn on_exit<F, Fut>(&mut self, state: StateId, hook: F) -> Result<(), Error>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        self.hooks_mut(state)?.exit = Some(wrap_hook(hook));
        Ok(())
    }

    /// Registers the transition function evaluated while `source` is the
    /// current child of its parent composite.
    ///
    /// The function receives a [`Scope`] for the parent composite (with the
    /// region index curried in, for concurrent parents), polls its guards,
    /// and calls [`Scope::transition_to`] when one fires. Registering a
    /// second function for the same source replaces the first.
    pub fn transition<F, Fut>(&mut self, source: StateId, f: F) -> Result<(), Error>
    where
        F: Fn(Scope) -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        let parent = self.node(source).parent.ok_or_else(|| Error::ParentMissing {
            state: self.node(source).name.clone(),
        })?;
        let table: TransitionFn = Rc::new(move |scope| f(scope).boxed_local());
        self.ensure_composite(parent)?.transitions.borrow_mut().insert(source, table);
        Ok(())
    }

    /// Creates an [`Event`] bound to this machine's tick signal.
    pub fn event(&mut self, name: &str) -> Event {
        self.declare_events();
        Event::new(name, Rc::clone(&self.tick), Rc::clone(&self.tracer))
    }

    /// Creates an [`EventWithValue`] bound to this machine's tick signal.
    pub fn event_with_value<T>(&mut self, name: &str) -> EventWithValue<T> {
        self.declare_events();
        EventWithValue::new(name, Rc::clone(&self.tick), Rc::clone(&self.tracer))
    }

    /// Overrides the settling delay used by `start`, 50 ms by default.
    pub fn poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Replaces the diagram trace sink. Install a no-op to silence the
    /// stream.
    pub fn trace_with(&mut self, sink: impl Fn(&str) + 'static) {
        self.tracer.set_sink(Box::new(sink));
    }

    /// Validates the tree and produces the machine.
    ///
    /// Every composite must have a transition function registered for its
    /// initial pseudo-state, and for its history pseudo-state when it has
    /// one.
    pub fn build(self) -> Result<Machine, Error> {
        for node in &self.nodes {
            let Kind::Composite(comp) = &node.kind else { continue };
            let transitions = comp.transitions.borrow();
            if !transitions.contains_key(&comp.initial) {
                return Err(Error::MissingInitialTransition { state: node.name.clone() });
            }
            if let Some(history) = comp.history {
                if !transitions.contains_key(&history) {
                    return Err(Error::MissingHistoryTransition { state: node.name.clone() });
                }
            }
        }
        Ok(Machine::assemble(self.nodes, self.root, self.tick, self.tracer, self.poll_interval))
    }

    fn declare_events(&mut self) {
        if !self.declared_events {
            self.tracer.line(format_args!("participant Events"));
            self.declared_events = true;
        }
    }

    fn node(&self, id: StateId) -> &Node {
        &self.nodes[id.0]
    }

    fn hooks_mut(&mut self, id: StateId) -> Result<&mut Hooks, Error> {
        if self.nodes[id.0].is_pseudo() {
            return Err(Error::PseudoStateHook { state: self.nodes[id.0].name.clone() });
        }
        Ok(&mut self.nodes[id.0].hooks)
    }

    fn ensure_composite(&self, id: StateId) -> Result<&CompositeNode, Error> {
        match &self.node(id).kind {
            Kind::Composite(comp) => Ok(comp),
            _ => Err(Error::NotAComposite { state: self.node(id).name.clone() }),
        }
    }

    fn push_node(&mut self, parent: Option<StateId>, name: &str, kind: Kind) -> StateId {
        let id = StateId(self.nodes.len());
        self.nodes.push(Node { name: name.to_owned(), parent, kind, hooks: Hooks::default() });
        id
    }

    fn push_composite(
        &mut self,
        parent: Option<StateId>,
        name: &str,
        regions: usize,
        history_kind: Option<HistoryKind>,
    ) -> Result<StateId, Error> {
        if let Some(parent) = parent {
            self.ensure_composite(parent)?;
        }
        let id = self.push_node(parent, name, Kind::Leaf);
        let initial = self.push_node(Some(id), &format!("{name}_initial"), Kind::Initial);
        let final_ = self.push_node(Some(id), &format!("{name}_final"), Kind::Final);
        let history = history_kind
            .map(|_| self.push_node(Some(id), &format!("{name}_history"), Kind::History));
        self.nodes[id.0].kind = Kind::Composite(CompositeNode {
            initial,
            final_,
            history,
            history_kind,
            regions,
            current: RefCell::new(vec![initial; regions]),
            remembered: RefCell::new(vec![None; regions]),
            transitions: RefCell::new(HashMap::new()),
        });
        Ok(id)
    }
}

fn wrap_hook<F, Fut>(hook: F) -> Hook
where
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move || hook().boxed_local())
}
