use skein_wire::Fault;

/// Error from a bridge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The native side reported a failure for this request.
    Fault(Fault),
    /// The bridge channel closed before the response arrived.
    Closed,
    /// The driver task is gone.
    DriverGone,
    /// The owning handle was destroyed while the request was in flight.
    Cancelled,
    /// The native side answered with a reply record of the wrong shape.
    UnexpectedReply,
}

impl BridgeError {
    /// The native-side fault, if that is what this error carries.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            BridgeError::Fault(f) => Some(f),
            _ => None,
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Fault(fault) => write!(f, "{fault}"),
            BridgeError::Closed => write!(f, "bridge closed"),
            BridgeError::DriverGone => write!(f, "driver task stopped"),
            BridgeError::Cancelled => write!(f, "handle destroyed with request in flight"),
            BridgeError::UnexpectedReply => write!(f, "unexpected reply shape"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<Fault> for BridgeError {
    fn from(fault: Fault) -> Self {
        BridgeError::Fault(fault)
    }
}

/// Error terminating the driver loop.
#[derive(Debug)]
pub enum DriverError {
    /// IO error on the underlying transport.
    Io(std::io::Error),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Io(e)
    }
}
