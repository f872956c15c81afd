#![deny(unsafe_code)]

//! Wire-level types for the skein bridge protocol.
//!
//! One bridge channel carries three kinds of traffic: correlated requests,
//! their responses, and unsolicited events pushed by the native side. The
//! [`Message`] enum is the whole vocabulary; everything else here is the
//! named-field records those variants carry.
//!
//! Variant order is wire-significant (postcard enum discriminants) — never
//! reorder variants, only append.

use facet::Facet;

/// Identifier for one live handle (socket, server, datagram endpoint, file).
///
/// Drawn from a cryptographically strong random source at handle creation,
/// not sequentially: concurrently created handles must not collide, and ids
/// must not be predictable across process restarts. The native side uses
/// this as the demultiplexing key for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Facet)]
#[repr(transparent)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Draw a fresh random identifier.
    pub fn fresh() -> Self {
        Self(rand::random::<u64>())
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for HandleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<HandleId> for u64 {
    fn from(id: HandleId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle:{:016x}", self.0)
    }
}

/// Identifier pairing an outbound request with its eventual response.
///
/// Unique among in-flight requests on one bridge; allocated from a
/// monotonically increasing counter starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Facet)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Create a new request ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// Address family of a resolved name.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
pub enum IpFamily {
    V4 = 0,
    V6 = 1,
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// A resolved (address, port, family) triple for one side of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Name {
    pub address: String,
    pub port: u16,
    pub family: IpFamily,
}

/// Error category reported by the native side of the bridge.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
pub enum FaultCode {
    AddressInUse = 0,
    ConnectionRefused = 1,
    ConnectionReset = 2,
    BrokenPipe = 3,
    NotFound = 4,
    PermissionDenied = 5,
    Unsupported = 6,
    Resolution = 7,
    Internal = 8,
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultCode::AddressInUse => "address in use",
            FaultCode::ConnectionRefused => "connection refused",
            FaultCode::ConnectionReset => "connection reset",
            FaultCode::BrokenPipe => "broken pipe",
            FaultCode::NotFound => "not found",
            FaultCode::PermissionDenied => "permission denied",
            FaultCode::Unsupported => "not supported",
            FaultCode::Resolution => "resolution failed",
            FaultCode::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A native-side failure for one request.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
}

impl Fault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Fault {}

/// One bridge operation with its named parameters.
///
/// Each variant is a method of the native contract; the native side answers
/// every request with exactly one [`Message::Response`]. Handles appear as
/// raw u64 ids here so the wire layer stays free of handle-object concerns.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub enum Method {
    // ------------------------------------------------------------------
    // Stream sockets
    // ------------------------------------------------------------------
    TcpConnect {
        handle: u64,
        port: u16,
        address: String,
    } = 0,
    TcpListen {
        handle: u64,
        port: u16,
        address: String,
    } = 1,
    TcpSend {
        handle: u64,
        data: Vec<u8>,
    } = 2,
    TcpReadStart {
        handle: u64,
    } = 3,
    TcpReadStop {
        handle: u64,
    } = 4,
    /// Graceful write-side shutdown (FIN equivalent).
    TcpShutdown {
        handle: u64,
    } = 5,
    TcpClose {
        handle: u64,
    } = 6,
    TcpSetNoDelay {
        handle: u64,
        enable: bool,
    } = 7,
    TcpSetKeepAlive {
        handle: u64,
        enable: bool,
    } = 8,
    TcpConnectionCount {
        handle: u64,
    } = 9,
    TcpLocalName {
        handle: u64,
    } = 10,
    TcpRemoteName {
        handle: u64,
    } = 11,

    // ------------------------------------------------------------------
    // Datagram endpoints
    // ------------------------------------------------------------------
    UdpBind {
        handle: u64,
        port: u16,
        address: String,
        reuse_addr: bool,
        ipv6_only: bool,
    } = 12,
    UdpConnect {
        handle: u64,
        port: u16,
        address: String,
    } = 13,
    UdpDisconnect {
        handle: u64,
    } = 14,
    /// `port`/`address` are absent on a connected endpoint (the association
    /// supplies the destination) and present otherwise.
    UdpSend {
        handle: u64,
        port: Option<u16>,
        address: Option<String>,
        data: Vec<u8>,
    } = 15,
    UdpReadStart {
        handle: u64,
    } = 16,
    UdpLocalName {
        handle: u64,
    } = 17,
    UdpPeerName {
        handle: u64,
    } = 18,
    UdpClose {
        handle: u64,
    } = 19,

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------
    FsOpen {
        handle: u64,
        path: String,
        flags: u32,
        mode: u32,
    } = 20,
    FsRead {
        handle: u64,
        len: u32,
        /// Absolute offset, or -1 to read at the current position.
        position: i64,
    } = 21,
    FsWrite {
        handle: u64,
        data: Vec<u8>,
        /// Absolute offset, or -1 to write at the current position.
        position: i64,
    } = 22,
    FsStat {
        handle: u64,
    } = 23,
    FsClose {
        handle: u64,
    } = 24,

    // ------------------------------------------------------------------
    // Host queries
    // ------------------------------------------------------------------
    NetworkInterfaces = 25,
    PlatformInfo = 26,
}

impl Method {
    /// The handle this operation acts on, if any.
    pub fn handle(&self) -> Option<HandleId> {
        use Method::*;
        match self {
            TcpConnect { handle, .. }
            | TcpListen { handle, .. }
            | TcpSend { handle, .. }
            | TcpReadStart { handle }
            | TcpReadStop { handle }
            | TcpShutdown { handle }
            | TcpClose { handle }
            | TcpSetNoDelay { handle, .. }
            | TcpSetKeepAlive { handle, .. }
            | TcpConnectionCount { handle }
            | TcpLocalName { handle }
            | TcpRemoteName { handle }
            | UdpBind { handle, .. }
            | UdpConnect { handle, .. }
            | UdpDisconnect { handle }
            | UdpSend { handle, .. }
            | UdpReadStart { handle }
            | UdpLocalName { handle }
            | UdpPeerName { handle }
            | UdpClose { handle }
            | FsOpen { handle, .. }
            | FsRead { handle, .. }
            | FsWrite { handle, .. }
            | FsStat { handle }
            | FsClose { handle } => Some(HandleId(*handle)),
            NetworkInterfaces | PlatformInfo => None,
        }
    }

    /// Method name as it appears in logs.
    pub fn name(&self) -> &'static str {
        use Method::*;
        match self {
            TcpConnect { .. } => "tcp-connect",
            TcpListen { .. } => "tcp-listen",
            TcpSend { .. } => "tcp-send",
            TcpReadStart { .. } => "tcp-read-start",
            TcpReadStop { .. } => "tcp-read-stop",
            TcpShutdown { .. } => "tcp-shutdown",
            TcpClose { .. } => "tcp-close",
            TcpSetNoDelay { .. } => "tcp-set-no-delay",
            TcpSetKeepAlive { .. } => "tcp-set-keep-alive",
            TcpConnectionCount { .. } => "tcp-connection-count",
            TcpLocalName { .. } => "tcp-local-name",
            TcpRemoteName { .. } => "tcp-remote-name",
            UdpBind { .. } => "udp-bind",
            UdpConnect { .. } => "udp-connect",
            UdpDisconnect { .. } => "udp-disconnect",
            UdpSend { .. } => "udp-send",
            UdpReadStart { .. } => "udp-read-start",
            UdpLocalName { .. } => "udp-local-name",
            UdpPeerName { .. } => "udp-peer-name",
            UdpClose { .. } => "udp-close",
            FsOpen { .. } => "fs-open",
            FsRead { .. } => "fs-read",
            FsWrite { .. } => "fs-write",
            FsStat { .. } => "fs-stat",
            FsClose { .. } => "fs-close",
            NetworkInterfaces => "network-interfaces",
            PlatformInfo => "platform-info",
        }
    }
}

/// Successful result record for one request.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub enum Reply {
    /// Acknowledged, no data.
    Done = 0,
    /// A resolved name (bound address, connected peer, sockname, peername).
    Name(Name) = 1,
    /// Bytes accepted for sending; `queue_depth` is the native write queue
    /// depth after acceptance, used for idle-timeout suppression.
    Sent {
        queue_depth: u32,
    } = 2,
    ConnectionCount {
        count: u32,
    } = 3,
    /// Bytes read from a file; `eof` marks end of file.
    Read {
        data: Vec<u8>,
        eof: bool,
    } = 4,
    Written {
        bytes: u32,
    } = 5,
    Stat {
        size: u64,
        mode: u32,
        modified_ms: u64,
        accessed_ms: u64,
        created_ms: u64,
    } = 6,
    /// Flat (interface name, address) pairs per family, shaped into
    /// interface records by the os layer.
    Interfaces {
        ipv4: Vec<(String, String)>,
        ipv6: Vec<(String, String)>,
    } = 7,
    Platform {
        os: String,
        arch: String,
        kind: String,
    } = 8,
}

/// Unsolicited event pushed by the native side for one handle.
///
/// Events carry no correlation id; the `source` field of
/// [`Message::Event`] routes them to the owning handle.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub enum Event {
    /// Bytes arrived on a stream socket. An empty payload signals
    /// end-of-stream (the peer closed its write side).
    Data {
        bytes: Vec<u8>,
    } = 0,
    /// A new inbound connection on a listening server. `handle` is the
    /// native-assigned id of the child socket.
    Connection {
        handle: u64,
        port: u16,
        address: String,
        family: IpFamily,
    } = 1,
    /// A datagram arrived on an endpoint.
    Message {
        bytes: Vec<u8>,
        port: u16,
        address: String,
        family: IpFamily,
    } = 2,
}

/// Protocol message.
///
/// Requests flow application → native, responses and events flow native →
/// application. A response answers exactly one request; events are
/// unsolicited and carry only a source handle id.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub enum Message {
    Request {
        request_id: u64,
        method: Method,
    } = 0,
    /// Exactly one of `fault` / `reply` is populated.
    Response {
        request_id: u64,
        fault: Option<Fault>,
        reply: Option<Reply>,
    } = 1,
    Event {
        source: u64,
        event: Event,
    } = 2,
}

impl Message {
    /// Build a success response.
    pub fn reply(request_id: u64, reply: Reply) -> Self {
        Message::Response {
            request_id,
            fault: None,
            reply: Some(reply),
        }
    }

    /// Build a failure response.
    pub fn fault(request_id: u64, fault: Fault) -> Self {
        Message::Response {
            request_id,
            fault: Some(fault),
            reply: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_ids_do_not_collide() {
        let a = HandleId::fresh();
        let b = HandleId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn method_handle_extraction() {
        let m = Method::TcpSend {
            handle: 42,
            data: vec![1, 2, 3],
        };
        assert_eq!(m.handle(), Some(HandleId(42)));
        assert_eq!(Method::NetworkInterfaces.handle(), None);
    }

    #[test]
    fn fault_display_includes_code_and_message() {
        let f = Fault::new(FaultCode::AddressInUse, "0.0.0.0:80");
        assert_eq!(f.to_string(), "address in use: 0.0.0.0:80");

        let bare = Fault::new(FaultCode::ConnectionRefused, "");
        assert_eq!(bare.to_string(), "connection refused");
    }

    #[test]
    fn family_display_matches_convention() {
        assert_eq!(IpFamily::V4.to_string(), "IPv4");
        assert_eq!(IpFamily::V6.to_string(), "IPv6");
    }
}
