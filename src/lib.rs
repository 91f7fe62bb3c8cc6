#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! A minimal runtime for hierarchical, concurrent state machines in the UML
//! statechart tradition.
//!
//! A machine is a tree of states assembled by [`MachineBuilder`]: simple
//! leaves, plain composites, and concurrent composites whose orthogonal
//! regions evolve side by side. Every composite owns `initial` and `final`
//! pseudo-states, optionally a (shallow or deep) history pseudo-state, and a
//! transition table mapping each direct child to an async *transition
//! function*. States may carry async entry/do/exit hooks.
//!
//! At runtime a single cooperative task, the *ticker*, drives everything.
//! Each pass walks the stack of active states, runs every `do` hook, and
//! evaluates the transition function of each composite's current child.
//! Transition functions poll [`Event`]s (level-triggered, consumed on read)
//! and call [`Scope::transition_to`], which performs the canonical
//! exit → transition actions → entry sequence across the nesting. Setting an
//! event pokes the ticker, so transitions are driven by signals rather than
//! by polling latency.
//!
//! # Example
//!
//! A two-state toggle, driven on a [`futures::executor::LocalPool`]:
//!
//! ```
//! use espalier::{testing::single, Machine};
//! use futures::executor::LocalPool;
//!
//! # fn main() -> Result<(), espalier::Error> {
//! let mut b = Machine::builder("Lamp");
//! let root = b.root();
//! let off = b.state(root, "Off")?;
//! let on = b.state(root, "On")?;
//! let toggle = b.event("toggle");
//!
//! b.transition(b.initial_of(root)?, move |cx| async move {
//!     cx.transition_to(off).await
//! })?;
//! {
//!     let toggle = toggle.clone();
//!     b.transition(off, move |cx| {
//!         let toggle = toggle.clone();
//!         async move {
//!             if toggle.poll() {
//!                 cx.transition_to(on).await?;
//!             }
//!             Ok(())
//!         }
//!     })?;
//! }
//! {
//!     let toggle = toggle.clone();
//!     b.transition(on, move |cx| {
//!         let toggle = toggle.clone();
//!         async move {
//!             if toggle.poll() {
//!                 cx.transition_to(off).await?;
//!             }
//!             Ok(())
//!         }
//!     })?;
//! }
//!
//! let machine = b.build()?;
//! let mut pool = LocalPool::new();
//! let spawner = pool.spawner();
//! pool.run_until(async {
//!     machine.start(&spawner).await?;
//!     assert_eq!(machine.active_state_names(), vec![single("Off")]);
//!
//!     toggle.set().await;
//!     assert_eq!(machine.active_state_names(), vec![single("On")]);
//!
//!     machine.stop_ticker(None).await
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! # Model notes
//!
//! - The state tree is immutable once built; all nodes live in an arena
//!   owned by the machine and are addressed by [`StateId`].
//! - Pseudo-states never run hooks and never appear on the active stack.
//! - A plain composite reaching its final pseudo-state requests a tick so
//!   the parent's completion guard fires on the next pass. A concurrent
//!   region reaching its local final does not; observing the join of all
//!   regions may take an extra [`Machine::trigger_tick`].
//! - Everything runs on one thread. Hooks and transition functions may
//!   suspend; while they do, other tasks may set events safely.

mod error;
mod event;
mod machine;
pub mod testing;
mod trace;
mod tree;

pub use crate::{
    error::Error,
    event::{Event, EventWithValue},
    machine::{ActiveState, Machine, Scope},
    tree::{action, Action, HistoryKind, MachineBuilder, StateId},
};
