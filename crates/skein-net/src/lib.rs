#![deny(unsafe_code)]

//! Stream sockets and servers over a skein bridge.
//!
//! The native side of the bridge performs the actual TCP work; this crate
//! holds the per-handle state machines: connect/write/close lifecycle,
//! ordered coalesced write flushing, flowing/paused flow control, and the
//! acceptor's connection ceiling.

mod error;
mod server;
mod socket;

pub use error::NetError;
pub use server::{ListenConfig, Server, ServerEvent};
pub use socket::{ConnectConfig, Socket, SocketConfig, SocketEvent};

use skein_session::{Bridge, BridgeError};
use skein_wire::{Method, Reply};

/// Raw per-family (interface name, address) listings from the native side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInterfaces {
    pub ipv4: Vec<(String, String)>,
    pub ipv6: Vec<(String, String)>,
}

/// List the host's network interfaces as the native side reports them.
///
/// The os layer shapes these into full interface records; this is the raw
/// form.
pub async fn network_interfaces(bridge: &Bridge) -> Result<RawInterfaces, NetError> {
    let reply = bridge.submit(Method::NetworkInterfaces).await?;
    match reply {
        Reply::Interfaces { ipv4, ipv6 } => Ok(RawInterfaces { ipv4, ipv6 }),
        _ => Err(NetError::Bridge(BridgeError::UnexpectedReply)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_config_defaults_to_full_duplex_suppression() {
        assert!(!SocketConfig::default().allow_half_open);
    }

    #[test]
    fn listen_config_defaults_to_wildcard_ephemeral() {
        let config = ListenConfig::default();
        assert_eq!(config.port, 0);
        assert_eq!(config.address, "0.0.0.0");
    }

    #[test]
    fn net_error_display_distinguishes_families() {
        assert_eq!(
            NetError::AlreadyConnected.to_string(),
            "socket is already connected"
        );
        assert_eq!(
            NetError::Bridge(BridgeError::Cancelled).to_string(),
            "handle destroyed with request in flight"
        );
    }
}
