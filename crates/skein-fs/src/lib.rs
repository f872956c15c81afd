#![deny(unsafe_code)]

//! File handles over a skein bridge.
//!
//! The native side performs the actual filesystem work; this crate holds
//! the [`FileHandle`] lifecycle and the whole-file conveniences built on
//! it.

mod error;
mod flags;
mod handle;

pub use error::FsError;
pub use flags::{constants, parse_flags};
pub use handle::{
    DEFAULT_OPEN_FLAGS, DEFAULT_OPEN_MODE, FileEvent, FileHandle, FileStat,
};

use skein_session::Bridge;
use tracing::warn;

/// Read a whole file: open, read to end, close.
///
/// The close is best-effort — a release failure after a successful read is
/// logged, not surfaced.
pub async fn read_file(bridge: &Bridge, path: impl Into<String>) -> Result<Vec<u8>, FsError> {
    let handle = FileHandle::open(bridge.clone(), path, DEFAULT_OPEN_FLAGS, DEFAULT_OPEN_MODE).await?;
    let result = handle.read_to_end().await;
    if let Err(e) = handle.close().await {
        warn!(path = handle.path(), error = %e, "close after read failed");
    }
    result
}

/// Write a whole file: open with truncation, write, close.
///
/// The close is best-effort, as in [`read_file`].
pub async fn write_file(
    bridge: &Bridge,
    path: impl Into<String>,
    data: Vec<u8>,
) -> Result<(), FsError> {
    let handle = FileHandle::open(bridge.clone(), path, "w", DEFAULT_OPEN_MODE).await?;
    let result = handle.write(data, None).await.map(|_| ());
    if let Err(e) = handle.close().await {
        warn!(path = handle.path(), error = %e, "close after write failed");
    }
    result
}
