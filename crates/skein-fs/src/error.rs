use skein_session::BridgeError;

/// Error from a file operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FsError {
    /// Flag string is not one of the recognized forms.
    InvalidFlags(String),
    /// Operation on a closed file handle.
    Closed,
    /// The native call or the bridge failed.
    Bridge(BridgeError),
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsError::InvalidFlags(flags) => write!(f, "invalid open flags: {flags:?}"),
            FsError::Closed => write!(f, "file handle is closed"),
            FsError::Bridge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Bridge(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BridgeError> for FsError {
    fn from(e: BridgeError) -> Self {
        FsError::Bridge(e)
    }
}
