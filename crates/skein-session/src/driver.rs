//! The bridge driver: one task that owns the transport.
//!
//! Only the driver touches [`MessageTransport::recv`] — every inbound
//! message is routed here, either to the correlation registry (responses)
//! or to the event router (unsolicited events). Outbound traffic funnels
//! through one ordered queue, which is what makes fire-and-forget signals
//! safe: a read-stop posted after a read-start can never overtake it.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use skein_wire::{Message, Method};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{trace, warn};

use crate::Shared;
use crate::errors::{BridgeError, DriverError};
use crate::transport::MessageTransport;

/// Outbound traffic from handles to the driver.
pub(crate) enum DriverMessage {
    /// A correlated request; the waiter is already registered.
    Request { request_id: u64, method: Method },
    /// A send-only signal; no response is awaited, any response the native
    /// side produces for it is dropped on arrival.
    Signal { method: Method },
    /// Tear the bridge down: fail all pending waiters and stop.
    Shutdown,
}

/// The connection driver — must be spawned (or awaited) to make progress.
pub struct Driver<T> {
    io: T,
    shared: Arc<Shared>,
    driver_rx: UnboundedReceiver<DriverMessage>,
}

impl<T> Driver<T>
where
    T: MessageTransport,
{
    pub(crate) fn new(io: T, shared: Arc<Shared>, driver_rx: UnboundedReceiver<DriverMessage>) -> Self {
        Self {
            io,
            shared,
            driver_rx,
        }
    }

    /// Run until the transport closes or the bridge is shut down.
    ///
    /// On any exit path — clean close, transport error, explicit shutdown —
    /// every pending waiter is settled with a terminal error and every
    /// event route is torn down. Nothing is left awaiting a response that
    /// can no longer arrive.
    pub async fn run(mut self) -> Result<(), DriverError> {
        let result = self.drive().await;
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.fail_all_pending(BridgeError::Closed);
        self.shared.drop_all_routes();
        result
    }

    async fn drive(&mut self) -> Result<(), DriverError> {
        loop {
            tokio::select! {
                cmd = self.driver_rx.recv() => {
                    match cmd {
                        Some(DriverMessage::Request { request_id, method }) => {
                            let msg = Message::Request { request_id, method };
                            self.io.send(&msg).await?;
                        }
                        Some(DriverMessage::Signal { method }) => {
                            let request_id = self.shared.request_ids.next();
                            trace!(method = method.name(), request_id, "send-only signal");
                            let msg = Message::Request { request_id, method };
                            self.io.send(&msg).await?;
                        }
                        Some(DriverMessage::Shutdown) | None => return Ok(()),
                    }
                }
                inbound = self.io.recv() => {
                    match inbound? {
                        Some(msg) => self.route(msg),
                        // Peer closed the channel cleanly.
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn route(&self, msg: Message) {
        match msg {
            Message::Response {
                request_id,
                fault,
                reply,
            } => {
                let waiter = self.shared.pending.lock().remove(&request_id);
                match waiter {
                    Some(pending) => {
                        let outcome = match fault {
                            Some(f) => Err(BridgeError::Fault(f)),
                            None => Ok(reply.unwrap_or(skein_wire::Reply::Done)),
                        };
                        // Receiver may be gone if the caller stopped
                        // waiting; that is not an error.
                        let _ = pending.tx.send(outcome);
                    }
                    None => {
                        trace!(request_id, "response without a waiter, dropped");
                    }
                }
            }
            Message::Event { source, event } => {
                let sink = self.shared.routes.lock().get(&source).cloned();
                match sink {
                    Some(tx) => {
                        if tx.send(event).is_err() {
                            // Handle's pump went away between lookup and
                            // send; unregister the stale route.
                            self.shared.routes.lock().remove(&source);
                        }
                    }
                    None => {
                        // Expected under close/event races.
                        trace!(source, "event for unknown handle, dropped");
                    }
                }
            }
            Message::Request { request_id, .. } => {
                warn!(request_id, "native side sent a request; dropped");
            }
        }
    }
}
