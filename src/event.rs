//! Level-triggered events and the tick signal that drives the machine.
//!
//! An [`Event`] is a named boolean flag shared between the code that raises
//! it and the transition function that polls it. Setting the flag also pokes
//! the machine's tick signal, so the ticker wakes and evaluates guards on
//! the next pass. Polling reads the flag and clears it in the same step,
//! which makes guards one-shot per `set`.
//!
//! Everything here lives on one thread; flags are plain [`Cell`]s and the
//! only cross-task hand-off is the stored [`Waker`].

use crate::trace::Tracer;
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tracing::debug;

/// Wakes the ticker task when a tick is requested.
///
/// The ticker parks on [`TickSignal::wait`] between passes; raising the
/// signal hands the stored waker to the executor. One signal is shared by
/// the machine, every event bound to it, and `trigger_tick`.
pub(crate) struct TickSignal {
    raised: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl TickSignal {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(TickSignal { raised: Cell::new(false), waker: RefCell::new(None) })
    }

    /// Requests a tick and wakes the ticker if it is parked.
    pub(crate) fn raise(&self) {
        self.raised.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Resolves once the signal has been raised, consuming the request.
    pub(crate) fn wait(&self) -> TickWait<'_> {
        TickWait(self)
    }
}

pub(crate) struct TickWait<'a>(&'a TickSignal);

impl Future for TickWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.raised.replace(false) {
            Poll::Ready(())
        } else {
            *self.0.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Returns control to the executor exactly once, so a freshly woken ticker
/// gets a pass before the caller resumes.
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

struct EventInner {
    name: String,
    raised: Cell<bool>,
    tick: Rc<TickSignal>,
    tracer: Rc<Tracer>,
}

/// A named, level-triggered flag polled by transition functions.
///
/// Cloning an `Event` clones the handle, not the flag: every clone observes
/// and consumes the same signal. Events are created from
/// [`MachineBuilder::event`] so they are bound to the machine's tick signal
/// from the start.
///
/// [`MachineBuilder::event`]: crate::MachineBuilder::event
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl Event {
    pub(crate) fn new(name: &str, tick: Rc<TickSignal>, tracer: Rc<Tracer>) -> Self {
        Event {
            inner: Rc::new(EventInner {
                name: name.to_owned(),
                raised: Cell::new(false),
                tick,
                tracer,
            }),
        }
    }

    /// The name the event was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raises the flag, annotates the trace, and pokes the tick signal.
    ///
    /// Yields once afterwards so that, on a cooperative executor, the ticker
    /// runs its pass before the caller resumes. Setting an already-set event
    /// is idempotent until the flag is polled.
    pub async fn set(&self) {
        self.inner.raised.set(true);
        debug!(event = %self.inner.name, "event set");
        self.inner.tracer.line(format_args!("rnote over Events: {}", self.inner.name));
        self.inner.tick.raise();
        yield_now().await;
    }

    /// Reads the flag and clears it in the same step.
    ///
    /// Returns `true` exactly once per [`set`](Event::set); the next poll
    /// returns `false` until the event is set again.
    pub fn poll(&self) -> bool {
        self.inner.raised.replace(false)
    }

    /// Clears the flag without reading it.
    pub fn clear(&self) {
        self.inner.raised.set(false);
        debug!(event = %self.inner.name, "event cleared");
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.inner.name)
            .field("raised", &self.inner.raised.get())
            .finish()
    }
}

/// An [`Event`] that carries an opaque payload alongside its flag.
///
/// The payload set by [`set_value`](EventWithValue::set_value) is only
/// guaranteed to be present between that call and the poll that consumes
/// the flag. This implementation keeps the last value around until the next
/// set, but callers must not rely on reading it after the flag has cleared.
pub struct EventWithValue<T> {
    event: Event,
    value: Rc<RefCell<Option<T>>>,
}

impl<T> EventWithValue<T> {
    pub(crate) fn new(name: &str, tick: Rc<TickSignal>, tracer: Rc<Tracer>) -> Self {
        EventWithValue { event: Event::new(name, tick, tracer), value: Rc::new(RefCell::new(None)) }
    }

    /// Stores the payload, then sets the flag as [`Event::set`] does.
    pub async fn set_value(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.event.set().await;
    }
}

impl<T: Clone> EventWithValue<T> {
    /// A copy of the stored payload, if one is present.
    pub fn value(&self) -> Option<T> {
        self.value.borrow().clone()
    }
}

impl<T> Clone for EventWithValue<T> {
    fn clone(&self) -> Self {
        EventWithValue { event: self.event.clone(), value: Rc::clone(&self.value) }
    }
}

impl<T> std::ops::Deref for EventWithValue<T> {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}
