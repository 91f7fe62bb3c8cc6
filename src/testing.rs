//! Utilities for testing espalier-based machines.
//!
//! The [`Journal`] records which hooks and transition actions ran, in order,
//! so tests can assert both call counts and the exit → action → entry
//! sequencing of a transition without peeking into the machine.

use crate::{error::Error, machine::ActiveState, tree::Action};
use futures::future::{self, FutureExt, Ready};
use std::{cell::RefCell, rc::Rc};

/// A shared, ordered record of labelled calls.
///
/// Clones share the same record. Hand out [`hook`](Journal::hook) and
/// [`action`](Journal::action) closures when wiring a machine, then assert
/// on the labels afterwards.
#[derive(Clone, Default)]
pub struct Journal {
    notes: Rc<RefCell<Vec<String>>>,
}

impl Journal {
    /// An empty journal.
    pub fn new() -> Self {
        Journal::default()
    }

    /// Appends a label.
    pub fn note(&self, label: impl Into<String>) {
        self.notes.borrow_mut().push(label.into());
    }

    /// Everything recorded so far, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.notes.borrow().clone()
    }

    /// How many times `label` was recorded.
    pub fn calls(&self, label: &str) -> usize {
        self.notes.borrow().iter().filter(|l| *l == label).count()
    }

    /// Panics unless `label` was recorded exactly once.
    pub fn assert_called_once(&self, label: &str) {
        let calls = self.calls(label);
        assert_eq!(calls, 1, "`{label}` recorded {calls} times, expected exactly one");
    }

    /// Panics unless the first occurrences of `labels` appear in the given
    /// order.
    pub fn assert_order(&self, labels: &[&str]) {
        let mut last: Option<(&str, usize)> = None;
        for &label in labels {
            let position = self
                .notes
                .borrow()
                .iter()
                .position(|l| l == label)
                .unwrap_or_else(|| panic!("`{label}` was never recorded in {:?}", self.entries()));
            if let Some((previous, at)) = last {
                assert!(
                    position > at,
                    "`{label}` at {position} does not follow `{previous}` at {at}: {:?}",
                    self.entries()
                );
            }
            last = Some((label, position));
        }
    }

    /// Removes every record of `label`, so a later `assert_called_once`
    /// checks only the calls made from this point on.
    pub fn reset(&self, label: &str) {
        self.notes.borrow_mut().retain(|l| l != label);
    }

    /// An entry/do/exit hook that records `label` each time it runs.
    pub fn hook(&self, label: &str) -> impl Fn() -> Ready<Result<(), Error>> {
        let journal = self.clone();
        let label = label.to_owned();
        move || {
            journal.note(label.clone());
            future::ready(Ok(()))
        }
    }

    /// A transition [`Action`] that records `label` each time it runs.
    pub fn action(&self, label: &str) -> Action {
        let journal = self.clone();
        let label = label.to_owned();
        Rc::new(move || {
            journal.note(label.clone());
            future::ready(Ok::<(), Error>(())).boxed_local()
        })
    }
}

/// Shorthand for an [`ActiveState::Single`] expectation.
pub fn single(name: &str) -> ActiveState {
    ActiveState::Single(name.to_owned())
}

/// Shorthand for an [`ActiveState::Region`] expectation; names are sorted
/// the way the machine reports them.
pub fn region(names: &[&str]) -> ActiveState {
    let mut names: Vec<String> = names.iter().map(|n| (*n).to_owned()).collect();
    names.sort();
    ActiveState::Region(names)
}
