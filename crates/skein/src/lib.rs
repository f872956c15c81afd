#![deny(unsafe_code)]

//! skein: one bridge channel, many typed concurrent handles.
//!
//! The native side of the bridge owns the sockets, files and syscalls;
//! this workspace owns everything the application observes: request
//! correlation, event demultiplexing, and the per-handle state machines.
//!
//! ```ignore
//! use skein::net::{ConnectConfig, Socket, SocketConfig};
//! use skein::session::Bridge;
//! use skein::stream::FramedStream;
//!
//! let stream = tokio::net::UnixStream::connect("/run/bridge.sock").await?;
//! let bridge = Bridge::spawn(FramedStream::new(stream));
//!
//! let socket = Socket::new(bridge.clone(), SocketConfig::default());
//! socket.connect(ConnectConfig::new(443, "93.184.215.14")).await?;
//! socket.write(b"hello".to_vec()).await?;
//! ```

pub use skein_session::{Bridge, BridgeError, Driver, Emitter, MessageTransport, Subscription};
pub use skein_wire as wire;

pub mod session {
    pub use skein_session::*;
}

pub mod local {
    pub use skein_local::*;
}

pub mod stream {
    pub use skein_stream::*;
}

pub mod net {
    pub use skein_net::*;
}

pub mod dgram {
    pub use skein_dgram::*;
}

pub mod fs {
    pub use skein_fs::*;
}

pub mod os {
    pub use skein_os::*;
}
