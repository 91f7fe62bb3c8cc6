//! The error taxonomy for machine construction and execution.
//!
//! Configuration problems surface from [`MachineBuilder`] methods or from
//! [`MachineBuilder::build`], before anything runs. Errors raised while the
//! machine is live abort the ticker task, which completes with the error;
//! [`Machine::stop_ticker`] reports it.
//!
//! [`MachineBuilder`]: crate::MachineBuilder
//! [`MachineBuilder::build`]: crate::MachineBuilder::build
//! [`Machine::stop_ticker`]: crate::Machine::stop_ticker

use futures::task::SpawnError;
use thiserror::Error;

/// Anything that can go wrong while building or running a machine.
#[derive(Debug, Error)]
pub enum Error {
    /// A composite state was built without a transition function for its
    /// initial pseudo-state, so it could never be entered.
    #[error("`{state}` has no transition registered for its initial pseudo-state")]
    MissingInitialTransition {
        /// The offending composite.
        state: String,
    },

    /// A composite state owns a history pseudo-state but registered no
    /// transition function for it.
    #[error("`{state}` has a history pseudo-state but no transition registered for it")]
    MissingHistoryTransition {
        /// The offending composite.
        state: String,
    },

    /// A concurrent composite was requested with fewer than two regions.
    #[error("concurrent state `{state}` needs at least two regions, got {regions}")]
    NotEnoughRegions {
        /// The offending composite.
        state: String,
        /// The region count that was asked for.
        regions: usize,
    },

    /// The initial (or history) transition function of a concurrent
    /// composite returned without entering every region.
    #[error("the initial transition of `{state}` left region {region} unentered")]
    RegionNotEntered {
        /// The concurrent composite.
        state: String,
        /// The region still sitting on its pseudo-state.
        region: usize,
    },

    /// A region index outside the composite's `0..regions` range was used.
    #[error("region {region} is out of range for `{state}`")]
    RegionOutOfRange {
        /// The composite the transition was addressed to.
        state: String,
        /// The out-of-range index.
        region: usize,
    },

    /// A history pseudo-state was asked to restore a child, but nothing was
    /// remembered for it.
    #[error("the history of `{state}` has nothing to return to")]
    NothingToReturnTo {
        /// The composite whose history is empty.
        state: String,
    },

    /// A state that cannot parent children (a leaf or a pseudo-state) was
    /// used where a composite is required.
    #[error("`{state}` is not a composite state")]
    NotAComposite {
        /// The state that was used as a container.
        state: String,
    },

    /// A transition targeted a state that is not a direct child of the
    /// composite evaluating the transition.
    #[error("`{state}` is not a child of `{composite}`")]
    NotAChild {
        /// The transition target.
        state: String,
        /// The composite whose transition function fired.
        composite: String,
    },

    /// Entry, do, and exit hooks were attached to a pseudo-state, which
    /// never runs user behaviour.
    #[error("pseudo-state `{state}` cannot carry user actions")]
    PseudoStateHook {
        /// The pseudo-state the hook was attached to.
        state: String,
    },

    /// A non-root state has no parent composite. Raised when a transition is
    /// registered for the root itself, which has no containing table.
    #[error("`{state}` has no parent composite")]
    ParentMissing {
        /// The orphaned state.
        state: String,
    },

    /// A state was deactivated while not at its expected position on the
    /// active-state stack. This is a framework invariant; seeing it means a
    /// bug in the runtime or user code mutating activation out of band.
    #[error("`{state}` is not at its expected position on the active-state stack")]
    StackOutOfSync {
        /// The state being deactivated.
        state: String,
    },

    /// `start` was called on a machine that is already running, or has
    /// already run. Machines are one-shot.
    #[error("the machine has already been started")]
    AlreadyStarted,

    /// `stop_ticker` was called but no ticker is running.
    #[error("the ticker is not running")]
    NotStarted,

    /// A user entry/do/exit hook or transition action failed.
    #[error("user action failed: {0}")]
    Action(#[source] Box<dyn std::error::Error>),

    /// The executor refused to spawn the ticker task.
    #[error("could not spawn the ticker task")]
    Spawn(#[from] SpawnError),
}

impl Error {
    /// Wraps a client-side failure so it can propagate out of a hook or
    /// transition action.
    ///
    /// ```
    /// # use espalier::Error;
    /// let err = Error::user("widget jammed");
    /// assert!(matches!(err, Error::Action(_)));
    /// ```
    pub fn user(err: impl Into<Box<dyn std::error::Error>>) -> Self {
        Error::Action(err.into())
    }
}
