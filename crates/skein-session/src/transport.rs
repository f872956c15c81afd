//! Message transport abstraction.
//!
//! The [`MessageTransport`] trait is the seam between the session core and
//! whatever actually carries bytes to the native side. Two implementations
//! ship in this workspace:
//! - `skein-local`: in-process pair, messages move as values (the semantic
//!   reference transport, used by tests)
//! - `skein-stream`: length-prefixed framing over any async byte stream

use std::io;

use skein_wire::Message;

/// Trait for transports that can send and receive bridge messages.
///
/// The driver is the only caller of [`recv`](MessageTransport::recv); all
/// message routing happens through the session's internal channels. The
/// transport must deliver messages in the order they were sent — the
/// session's fire-and-forget signaling relies on it.
pub trait MessageTransport: Send {
    /// Send a message over the transport.
    fn send(&mut self, msg: &Message) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the channel cleanly.
    fn recv(&mut self) -> impl std::future::Future<Output = io::Result<Option<Message>>> + Send;
}
