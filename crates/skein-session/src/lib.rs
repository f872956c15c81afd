#![deny(unsafe_code)]

//! Session core: turns one bridge channel into many independent handles.
//!
//! A [`Bridge`] multiplexes correlated request/response traffic and
//! unsolicited events over a single [`MessageTransport`]. Handles
//! (sockets, servers, datagram endpoints, files) hold a `Bridge` clone and
//! a registered event route; the [`Driver`] task owns the transport and is
//! the only code that receives from it.
//!
//! ```text
//!  handle ── submit ──► pending map ──► driver ──► transport ──► native
//!  handle ◄─ oneshot ◄─ pending map ◄── driver ◄── transport ◄── native
//!  handle ◄─ events ◄── route table ◄── driver ◄── transport ◄── native
//! ```
//!
//! Ordering: all outbound traffic funnels through one FIFO queue into the
//! driver, so operations issued against the same handle reach the native
//! side in call order. Operations against different handles have no
//! relative ordering guarantee.

mod driver;
mod emitter;
mod errors;
mod transport;

pub use driver::Driver;
pub use emitter::{Emitter, Subscription};
pub use errors::{BridgeError, DriverError};
pub use transport::MessageTransport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use skein_wire::{Event, HandleId, Method, Reply};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;

use driver::DriverMessage;

/// Generates request ids unique among in-flight requests on one bridge.
///
/// Monotonically increasing, starting at 1. Id 0 is never issued.
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered waiter for one in-flight request.
pub(crate) struct Pending {
    /// The handle the request acts on; teardown of that handle settles the
    /// waiter with [`BridgeError::Cancelled`].
    pub(crate) owner: Option<HandleId>,
    pub(crate) created_at: std::time::Instant,
    pub(crate) tx: oneshot::Sender<Result<Reply, BridgeError>>,
}

/// State shared between the [`Bridge`] clones and the [`Driver`].
pub(crate) struct Shared {
    /// Correlation registry: request id → waiter. Resolved exactly once.
    pub(crate) pending: Mutex<HashMap<u64, Pending>>,
    /// Event router: handle id → event sink. The bridge holds only this
    /// weak form of the handle, never the handle itself.
    pub(crate) routes: Mutex<HashMap<u64, UnboundedSender<Event>>>,
    pub(crate) request_ids: RequestIdGenerator,
    pub(crate) closed: AtomicBool,
}

impl Shared {
    /// Settle every pending waiter with `reason` (fail-fast teardown).
    pub(crate) fn fail_all_pending(&self, reason: BridgeError) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            tracing::trace!(
                age_ms = p.created_at.elapsed().as_millis() as u64,
                "settling pending request at teardown"
            );
            let _ = p.tx.send(Err(reason.clone()));
        }
    }

    /// Drop every event route, closing the handles' event streams.
    pub(crate) fn drop_all_routes(&self) {
        self.routes.lock().clear();
    }
}

/// A send-only bridge operation.
///
/// Posting one sends the request and deliberately does not await any
/// acknowledgment; in-order transport delivery alone guarantees the signal
/// takes effect at the right point in the stream. This is the contract for
/// flow-control stop/start and socket-option toggles — a latency choice,
/// not an omission.
pub struct SendOnly {
    method: Method,
}

impl SendOnly {
    pub fn new(method: Method) -> Self {
        Self { method }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

/// Events delivered to one handle, in arrival order.
///
/// The sink is unbounded so the driver never blocks on a slow handle;
/// events arriving while the handle is paused accumulate here instead of
/// being dropped.
pub struct EventSource {
    rx: UnboundedReceiver<Event>,
}

impl EventSource {
    /// Next event, or `None` once the route is torn down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Clone-able front of one bridge session.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
    driver_tx: UnboundedSender<DriverMessage>,
}

impl Bridge {
    /// Wrap a transport, returning the bridge front and the driver that
    /// must be spawned to make progress.
    pub fn new<T>(transport: T) -> (Bridge, Driver<T>)
    where
        T: MessageTransport,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            request_ids: RequestIdGenerator::new(),
            closed: AtomicBool::new(false),
        });
        let (driver_tx, driver_rx) = unbounded_channel();
        let driver = Driver::new(transport, Arc::clone(&shared), driver_rx);
        (
            Bridge {
                shared,
                driver_tx,
            },
            driver,
        )
    }

    /// Wrap a transport and spawn the driver on the current runtime.
    pub fn spawn<T>(transport: T) -> Bridge
    where
        T: MessageTransport + 'static,
    {
        let (bridge, driver) = Bridge::new(transport);
        tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                tracing::warn!(error = %e, "bridge driver exited with error");
            }
        });
        bridge
    }

    /// Submit a request and await its response.
    ///
    /// The waiter is registered before the request is queued, so a response
    /// can never race past its registration. Requests against the same
    /// handle resolve in submission order as long as the native side
    /// preserves per-handle FIFO processing.
    pub async fn submit(&self, method: Method) -> Result<Reply, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let owner = method.handle();
        let request_id = self.shared.request_ids.next();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            request_id,
            Pending {
                owner,
                created_at: std::time::Instant::now(),
                tx,
            },
        );

        if self
            .driver_tx
            .send(DriverMessage::Request { request_id, method })
            .is_err()
        {
            self.shared.pending.lock().remove(&request_id);
            return Err(BridgeError::DriverGone);
        }

        // Teardown may have swept the pending map between our insert and
        // the driver picking the request up; settle the waiter ourselves
        // so it can never be left dangling.
        if self.is_closed() {
            if let Some(p) = self.shared.pending.lock().remove(&request_id) {
                let _ = p.tx.send(Err(BridgeError::Closed));
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Waiter dropped without resolution: the driver tore down.
            Err(_) => Err(BridgeError::Closed),
        }
    }

    /// Post a send-only operation (see [`SendOnly`]).
    ///
    /// Returns synchronously; the only observable failure is the driver
    /// being gone, which callers must treat as fatal to the posting handle.
    pub fn post(&self, signal: SendOnly) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        self.driver_tx
            .send(DriverMessage::Signal {
                method: signal.method,
            })
            .map_err(|_| BridgeError::DriverGone)
    }

    /// Register an event route for `id`.
    ///
    /// Events whose source is `id` are delivered to the returned
    /// [`EventSource`] in arrival order. Registering twice replaces the
    /// previous route.
    pub fn register(&self, id: HandleId) -> EventSource {
        let (tx, rx) = unbounded_channel();
        self.shared.routes.lock().insert(id.raw(), tx);
        EventSource { rx }
    }

    /// Remove the event route for `id`. Later events for it are dropped
    /// silently — expected under concurrent close/event races.
    pub fn unregister(&self, id: HandleId) {
        self.shared.routes.lock().remove(&id.raw());
    }

    /// Forced teardown of one handle: settles all of its in-flight
    /// requests with [`BridgeError::Cancelled`] and removes its event
    /// route. Never leaves a caller awaiting a response that cannot arrive.
    pub fn cancel_handle(&self, id: HandleId) {
        let drained: Vec<Pending> = {
            let mut pending = self.shared.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.owner == Some(id))
                .map(|(rid, _)| *rid)
                .collect();
            ids.into_iter()
                .filter_map(|rid| pending.remove(&rid))
                .collect()
        };
        for p in drained {
            let _ = p.tx.send(Err(BridgeError::Cancelled));
        }
        self.unregister(id);
    }

    /// Shut the bridge down: the driver fails all pending waiters, drops
    /// all routes, and stops.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.driver_tx.send(DriverMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::{Fault, FaultCode};

    fn test_shared() -> Arc<Shared> {
        Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            request_ids: RequestIdGenerator::new(),
            closed: AtomicBool::new(false),
        })
    }

    #[test]
    fn request_ids_start_at_one_and_increase() {
        let ids = RequestIdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[tokio::test]
    async fn fail_all_pending_settles_every_waiter() {
        let shared = test_shared();
        let mut receivers = Vec::new();
        for rid in 1..=3u64 {
            let (tx, rx) = oneshot::channel();
            shared.pending.lock().insert(
                rid,
                Pending {
                    owner: Some(HandleId(7)),
                    created_at: std::time::Instant::now(),
                    tx,
                },
            );
            receivers.push(rx);
        }

        shared.fail_all_pending(BridgeError::Closed);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(BridgeError::Closed));
        }
        assert!(shared.pending.lock().is_empty());
    }

    #[test]
    fn bridge_error_display() {
        let e = BridgeError::Fault(Fault::new(FaultCode::ConnectionRefused, "10.0.0.1:9"));
        assert_eq!(e.to_string(), "connection refused: 10.0.0.1:9");
        assert_eq!(BridgeError::Cancelled.to_string(), "handle destroyed with request in flight");
    }
}
