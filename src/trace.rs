//! The line-oriented diagram trace.
//!
//! Every lifecycle step emits one line in a sequence-diagram dialect:
//! `activate S`, `S -> S : entry()`, `rnote over Events: go`, and so on.
//! The stream has no semantic role; it exists so a run can be replayed as a
//! diagram. By default lines go to the `espalier::diagram` tracing target at
//! debug level. Installing a sink with [`MachineBuilder::trace_with`]
//! replaces that, and a no-op sink silences the stream entirely.
//!
//! [`MachineBuilder::trace_with`]: crate::MachineBuilder::trace_with

use std::{cell::RefCell, fmt};

/// The shared trace sink, owned by the builder and threaded through the
/// machine and its events explicitly.
pub(crate) struct Tracer {
    sink: RefCell<Box<dyn Fn(&str)>>,
}

impl Tracer {
    pub(crate) fn new() -> Self {
        Tracer {
            sink: RefCell::new(Box::new(|line| {
                tracing::debug!(target: "espalier::diagram", "{}", line)
            })),
        }
    }

    pub(crate) fn set_sink(&self, sink: Box<dyn Fn(&str)>) {
        *self.sink.borrow_mut() = sink;
    }

    /// Formats and emits one diagram line.
    pub(crate) fn line(&self, args: fmt::Arguments<'_>) {
        let line = args.to_string();
        (self.sink.borrow())(&line);
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tracer")
    }
}
