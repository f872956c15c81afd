#![deny(unsafe_code)]

//! In-process transport for skein.
//!
//! This is the semantic reference transport: messages move between the two
//! ends as values, with no serialization, but with the same in-order
//! delivery every other transport must provide. If another transport
//! behaves differently from this one, the other transport has a bug.
//!
//! The testkit's fake native peer sits on one end of a [`pair`]; real
//! deployments use `skein-stream` over a byte stream instead.

use std::io;

use skein_session::MessageTransport;
use skein_wire::Message;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// One end of an in-process bridge channel.
pub struct LocalTransport {
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
}

/// Create a connected pair of in-process transports.
///
/// Whatever one end sends, the other receives, in order. Dropping one end
/// closes the channel cleanly for the other (`recv` returns `Ok(None)`).
pub fn pair() -> (LocalTransport, LocalTransport) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        LocalTransport { tx: a_tx, rx: a_rx },
        LocalTransport { tx: b_tx, rx: b_rx },
    )
}

impl MessageTransport for LocalTransport {
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"))
    }

    async fn recv(&mut self) -> io::Result<Option<Message>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::{Event, Method};

    #[tokio::test]
    async fn pair_delivers_in_order_both_ways() {
        let (mut app, mut native) = pair();

        app.send(&Message::Request {
            request_id: 1,
            method: Method::NetworkInterfaces,
        })
        .await
        .unwrap();
        app.send(&Message::Request {
            request_id: 2,
            method: Method::PlatformInfo,
        })
        .await
        .unwrap();

        let first = native.recv().await.unwrap().unwrap();
        let second = native.recv().await.unwrap().unwrap();
        assert!(matches!(first, Message::Request { request_id: 1, .. }));
        assert!(matches!(second, Message::Request { request_id: 2, .. }));

        native
            .send(&Message::Event {
                source: 9,
                event: Event::Data { bytes: vec![1] },
            })
            .await
            .unwrap();
        let evt = app.recv().await.unwrap().unwrap();
        assert!(matches!(evt, Message::Event { source: 9, .. }));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (app, mut native) = pair();
        drop(app);
        assert!(native.recv().await.unwrap().is_none());
    }
}
