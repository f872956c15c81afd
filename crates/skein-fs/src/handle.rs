//! File handle over the bridge.

use std::sync::Arc;

use parking_lot::Mutex;
use skein_session::{Bridge, Emitter, Subscription};
use skein_wire::{HandleId, Method, Reply};
use tracing::warn;

use crate::error::FsError;
use crate::flags::parse_flags;

/// Default open flags, matching the conventional `"r"`.
pub const DEFAULT_OPEN_FLAGS: &str = "r";
/// Default creation mode.
pub const DEFAULT_OPEN_MODE: u32 = 0o666;

/// Lifecycle events of one file handle.
#[derive(Debug, Clone)]
pub enum FileEvent {
    /// The file is open.
    Open,
    /// The handle closed. Emitted exactly once.
    Close,
}

/// File metadata as reported by the native side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub modified_ms: u64,
    pub accessed_ms: u64,
    pub created_ms: u64,
}

struct FileState {
    closed: bool,
}

struct FileShared {
    id: HandleId,
    bridge: Bridge,
    path: String,
    state: Mutex<FileState>,
    emitter: Emitter<FileEvent>,
}

/// An open file multiplexed over the bridge.
///
/// Clones share the same underlying handle.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<FileShared>,
}

impl FileHandle {
    /// Open `path` with a conventional flag string and creation mode.
    ///
    /// An open failure surfaces only on the returned future.
    pub async fn open(
        bridge: Bridge,
        path: impl Into<String>,
        flags: &str,
        mode: u32,
    ) -> Result<FileHandle, FsError> {
        let path = path.into();
        let flag_bits = parse_flags(flags)?;
        let id = HandleId::fresh();

        bridge
            .submit(Method::FsOpen {
                handle: id.raw(),
                path: path.clone(),
                flags: flag_bits,
                mode,
            })
            .await?;

        let handle = FileHandle {
            inner: Arc::new(FileShared {
                id,
                bridge,
                path,
                state: Mutex::new(FileState { closed: false }),
                emitter: Emitter::new(),
            }),
        };
        handle.inner.emitter.emit(&FileEvent::Open);
        Ok(handle)
    }

    /// This handle's bridge identifier.
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// The path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(
        &self,
        handler: impl Fn(&FileEvent) + Send + Sync + 'static,
    ) -> Subscription<FileEvent> {
        self.inner.emitter.subscribe(handler)
    }

    fn check_open(&self) -> Result<(), FsError> {
        if self.inner.state.lock().closed {
            Err(FsError::Closed)
        } else {
            Ok(())
        }
    }

    /// Read up to `len` bytes at `position` (or the current position when
    /// `None`). Returns the bytes and whether end of file was reached.
    pub async fn read(&self, len: u32, position: Option<u64>) -> Result<(Vec<u8>, bool), FsError> {
        self.check_open()?;
        let reply = self
            .inner
            .bridge
            .submit(Method::FsRead {
                handle: self.inner.id.raw(),
                len,
                position: position.map_or(-1, |p| p as i64),
            })
            .await?;
        match reply {
            Reply::Read { data, eof } => Ok((data, eof)),
            _ => Err(skein_session::BridgeError::UnexpectedReply.into()),
        }
    }

    /// Write `data` at `position` (or the current position when `None`).
    /// Returns the number of bytes written.
    pub async fn write(&self, data: Vec<u8>, position: Option<u64>) -> Result<u32, FsError> {
        self.check_open()?;
        let reply = self
            .inner
            .bridge
            .submit(Method::FsWrite {
                handle: self.inner.id.raw(),
                data,
                position: position.map_or(-1, |p| p as i64),
            })
            .await?;
        match reply {
            Reply::Written { bytes } => Ok(bytes),
            _ => Err(skein_session::BridgeError::UnexpectedReply.into()),
        }
    }

    /// Fetch file metadata.
    pub async fn stat(&self) -> Result<FileStat, FsError> {
        self.check_open()?;
        let reply = self
            .inner
            .bridge
            .submit(Method::FsStat {
                handle: self.inner.id.raw(),
            })
            .await?;
        match reply {
            Reply::Stat {
                size,
                mode,
                modified_ms,
                accessed_ms,
                created_ms,
            } => Ok(FileStat {
                size,
                mode,
                modified_ms,
                accessed_ms,
                created_ms,
            }),
            _ => Err(skein_session::BridgeError::UnexpectedReply.into()),
        }
    }

    /// Read from the current position to end of file.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, FsError> {
        const CHUNK: u32 = 64 * 1024;
        let mut out = Vec::new();
        loop {
            let (data, eof) = self.read(CHUNK, None).await?;
            out.extend_from_slice(&data);
            if eof {
                return Ok(out);
            }
        }
    }

    /// Close the handle.
    ///
    /// Idempotent: a second call is a no-op and `Close` is emitted exactly
    /// once. Any request still in flight for this handle settles with a
    /// cancellation error, and the native-side release is best-effort — a
    /// failure is logged and the handle still ends up closed.
    pub async fn close(&self) -> Result<(), FsError> {
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
        }

        self.inner.bridge.cancel_handle(self.inner.id);

        if let Err(e) = self
            .inner
            .bridge
            .submit(Method::FsClose {
                handle: self.inner.id.raw(),
            })
            .await
        {
            warn!(handle = %self.inner.id, path = %self.inner.path, error = %e, "native close failed; closing anyway");
        }

        self.inner.emitter.emit(&FileEvent::Close);
        Ok(())
    }
}
