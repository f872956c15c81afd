#![deny(unsafe_code)]

//! Length-prefixed framing for async byte streams.
//!
//! Each bridge message is one frame: a 4-byte little-endian length prefix
//! followed by the postcard-encoded [`Message`]. This module is generic
//! over the stream type — anything `AsyncRead + AsyncWrite + Unpin` works:
//! `UnixStream`, `TcpStream`, a pipe, or an in-memory duplex in tests.

use std::io;

use skein_session::MessageTransport;
use skein_wire::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FRAME_LEN_PREFIX_SIZE: usize = 4;
const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

fn compact_recv_buffer(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
        return;
    }

    if *unread_start >= RECV_BUF_COMPACT_THRESHOLD && *unread_start >= buf.len() / 2 {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

fn try_decode_one_from_buffer(
    buf: &mut Vec<u8>,
    unread_start: &mut usize,
) -> io::Result<Option<Message>> {
    let unread = &buf[*unread_start..];
    if unread.len() < FRAME_LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let frame_len = u32::from_le_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
    let frame_end = *unread_start + FRAME_LEN_PREFIX_SIZE + frame_len;
    if frame_end > buf.len() {
        return Ok(None);
    }

    let frame_start = *unread_start + FRAME_LEN_PREFIX_SIZE;
    let frame = &buf[frame_start..frame_end];

    let msg: Message = facet_postcard::from_slice(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("postcard: {e}")))?;

    *unread_start = frame_end;
    compact_recv_buffer(buf, unread_start);
    Ok(Some(msg))
}

/// A length-prefixed framed connection over an async byte stream.
pub struct FramedStream<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
}

impl<S> FramedStream<S> {
    /// Wrap an async stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one message as one frame.
    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let body = facet_postcard::to_vec(msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("encode: {e}")))?;

        let frame_len = u32::try_from(body.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "message too large for u32 length prefix",
            )
        })?;

        self.stream.write_all(&frame_len.to_le_bytes()).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next message, `Ok(None)` on clean EOF.
    ///
    /// EOF in the middle of a frame is an error: the peer vanished with a
    /// partial message on the wire.
    pub async fn recv(&mut self) -> io::Result<Option<Message>> {
        loop {
            if let Some(msg) = try_decode_one_from_buffer(&mut self.buf, &mut self.unread_start)? {
                return Ok(Some(msg));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len().saturating_sub(self.unread_start);
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    ));
                }
                return Ok(None);
            }
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

impl<S> MessageTransport for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        FramedStream::send(self, msg).await
    }

    async fn recv(&mut self) -> io::Result<Option<Message>> {
        FramedStream::recv(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::{Event, Fault, FaultCode, IpFamily, Method, Name, Reply};

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Request {
                request_id: 1,
                method: Method::TcpConnect {
                    handle: 0xDEAD_BEEF,
                    port: 443,
                    address: "192.168.1.7".into(),
                },
            },
            Message::reply(
                1,
                Reply::Name(Name {
                    address: "192.168.1.7".into(),
                    port: 443,
                    family: IpFamily::V4,
                }),
            ),
            Message::fault(2, Fault::new(FaultCode::AddressInUse, "0.0.0.0:80")),
            Message::Event {
                source: 0xDEAD_BEEF,
                event: Event::Data { bytes: vec![] },
            },
            Message::Request {
                request_id: 3,
                method: Method::UdpSend {
                    handle: 7,
                    port: None,
                    address: None,
                    data: vec![0xAB; 300],
                },
            },
        ]
    }

    #[tokio::test]
    async fn frames_round_trip_every_variant_shape() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut tx = FramedStream::new(client);
        let mut rx = FramedStream::new(server);

        for msg in sample_messages() {
            tx.send(&msg).await.unwrap();
            let got = rx.recv().await.unwrap().unwrap();
            assert_eq!(got, msg);
        }
    }

    #[tokio::test]
    async fn partial_frames_reassemble_across_reads() {
        let (client, server) = tokio::io::duplex(8);
        let mut tx = FramedStream::new(client);
        let mut rx = FramedStream::new(server);

        let msg = Message::Request {
            request_id: 42,
            method: Method::TcpSend {
                handle: 5,
                data: vec![7; 100],
            },
        };

        let send = tokio::spawn({
            let msg = msg.clone();
            async move {
                tx.send(&msg).await.unwrap();
                tx
            }
        });

        let got = rx.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(1024);
        let mut rx = FramedStream::new(server);
        drop(client);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut rx = FramedStream::new(server);

        // Announce a 100-byte frame, deliver only 3 bytes, then vanish.
        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
