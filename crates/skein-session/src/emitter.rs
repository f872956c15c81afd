//! Per-handle publish/subscribe.
//!
//! Every handle exposes its lifecycle (`Connect`, `Data`, `Close`, ...) as
//! events on an [`Emitter`]. Subscriptions are explicit and cancellable;
//! handlers run in subscription order; a panicking handler is isolated so
//! its siblings still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// An ordered, panic-isolated event publisher.
///
/// Cloning an `Emitter` clones a reference to the same subscription list.
pub struct Emitter<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                handlers: Vec::new(),
            })),
        }
    }

    /// Subscribe a handler. Handlers are invoked in subscription order.
    ///
    /// The handler stays subscribed until [`Subscription::cancel`] is
    /// called; dropping the returned token detaches it without
    /// unsubscribing.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription<E> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every subscribed handler with `event`, in subscription order.
    ///
    /// A panic in one handler is caught and logged; the remaining handlers
    /// still run. Handlers subscribed or cancelled *during* emission take
    /// effect from the next emission.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = {
            let inner = self.inner.lock();
            inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("event handler panicked; continuing with remaining handlers");
            }
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Token for one subscription on an [`Emitter`].
pub struct Subscription<E> {
    id: u64,
    inner: std::sync::Weak<Mutex<Inner<E>>>,
}

impl<E> Subscription<E> {
    /// Remove the handler from the emitter.
    pub fn cancel(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_run_in_subscription_order() {
        let emitter = Emitter::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            emitter.subscribe(move |_| log.lock().push(tag));
        }

        emitter.emit(&0);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_handler_does_not_suppress_siblings() {
        let emitter = Emitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.subscribe(|_| panic!("boom"));
        {
            let calls = Arc::clone(&calls);
            emitter.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        emitter.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_removes_only_that_handler() {
        let emitter = Emitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let sub = {
            let calls = Arc::clone(&calls);
            emitter.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let calls = Arc::clone(&calls);
            emitter.subscribe(move |_| {
                calls.fetch_add(10, Ordering::SeqCst);
            });
        }

        sub.cancel();
        emitter.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(emitter.len(), 1);
    }
}
