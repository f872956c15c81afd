use skein_session::BridgeError;

/// Error from a socket or server operation.
///
/// The first group is usage errors: detected synchronously, they never
/// cross the bridge. [`NetError::Bridge`] wraps failures reported by the
/// native side or by the bridge itself.
#[derive(Debug, Clone, PartialEq)]
pub enum NetError {
    /// `connect` on a socket that is already connecting or connected.
    AlreadyConnected,
    /// `listen` on a server that is already listening or closing.
    AlreadyListening,
    /// Operation requires an established connection.
    NotConnected,
    /// Write after the write side was shut down (locally or by the peer).
    NotWritable,
    /// Operation on a destroyed handle.
    Destroyed,
    /// The native call or the bridge failed.
    Bridge(BridgeError),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::AlreadyConnected => write!(f, "socket is already connected"),
            NetError::AlreadyListening => write!(f, "server is already listening"),
            NetError::NotConnected => write!(f, "socket is not connected"),
            NetError::NotWritable => write!(f, "write side is closed"),
            NetError::Destroyed => write!(f, "handle is destroyed"),
            NetError::Bridge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Bridge(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BridgeError> for NetError {
    fn from(e: BridgeError) -> Self {
        NetError::Bridge(e)
    }
}
