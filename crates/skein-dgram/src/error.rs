use skein_session::BridgeError;

/// Error from a datagram endpoint operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DgramError {
    /// `bind` on an endpoint that is already bound.
    AlreadyBound,
    /// `connect` on a connected endpoint, or an explicit-destination send
    /// on one — the association supplies the destination, naming another
    /// is a contract violation.
    AlreadyConnected,
    /// Destination-less send or `disconnect` on an unconnected endpoint.
    NotConnected,
    /// Feature deliberately left unimplemented (broadcast, TTL,
    /// multicast). Fails fast, never a silent no-op.
    NotSupported(&'static str),
    /// Host-name destination could not be resolved.
    Resolution(String),
    /// Operation on a closed endpoint.
    Destroyed,
    /// The native call or the bridge failed.
    Bridge(BridgeError),
}

impl std::fmt::Display for DgramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DgramError::AlreadyBound => write!(f, "endpoint is already bound"),
            DgramError::AlreadyConnected => write!(f, "endpoint is already connected"),
            DgramError::NotConnected => write!(f, "endpoint is not connected"),
            DgramError::NotSupported(what) => write!(f, "not supported: {what}"),
            DgramError::Resolution(host) => write!(f, "cannot resolve host: {host}"),
            DgramError::Destroyed => write!(f, "endpoint is closed"),
            DgramError::Bridge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DgramError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DgramError::Bridge(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BridgeError> for DgramError {
    fn from(e: BridgeError) -> Self {
        DgramError::Bridge(e)
    }
}
