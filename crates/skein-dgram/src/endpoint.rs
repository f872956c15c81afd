//! Message-oriented endpoint handle.
//!
//! Unlike a stream socket there are no partial reads: every send is a
//! discrete datagram with its own destination, every arrival is one
//! `Message` event. An unbound endpoint implicitly binds to an ephemeral
//! port before its first send or connect — a send never proceeds against
//! an unbound endpoint.

use std::sync::Arc;

use parking_lot::Mutex;
use skein_session::{Bridge, Emitter, EventSource, Subscription};
use skein_wire::{Event, HandleId, Method, Name, Reply};
use tracing::{trace, warn};

use crate::error::DgramError;
use crate::resolve::{LiteralResolver, Resolve};
use crate::{Destination, Payload};

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointKind {
    #[default]
    V4,
    V6,
}

impl EndpointKind {
    /// The all-interfaces address for this family.
    fn wildcard(self) -> &'static str {
        match self {
            EndpointKind::V4 => "0.0.0.0",
            EndpointKind::V6 => "::",
        }
    }

    /// The loopback address for this family.
    fn loopback(self) -> &'static str {
        match self {
            EndpointKind::V4 => "127.0.0.1",
            EndpointKind::V6 => "::1",
        }
    }
}

/// Construction options for an endpoint.
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub reuse_addr: bool,
    pub ipv6_only: bool,
    pub recv_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    /// Host-name resolution seam; the default accepts literals only.
    pub resolver: Arc<dyn Resolve>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            kind: EndpointKind::V4,
            reuse_addr: false,
            ipv6_only: false,
            recv_buffer_size: None,
            send_buffer_size: None,
            resolver: Arc::new(LiteralResolver),
        }
    }
}

/// Options for [`Endpoint::bind`].
#[derive(Debug, Clone, Default)]
pub struct BindConfig {
    /// 0 asks the native side for an ephemeral port.
    pub port: u16,
    /// Defaults to the family's all-interfaces address.
    pub address: Option<String>,
}

/// Lifecycle events of one endpoint.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// Bound and receiving; carries the local name.
    Listening(Name),
    /// Associated with a fixed remote peer; carries the peer name.
    Connect(Name),
    /// A datagram arrived.
    Message { data: Vec<u8>, peer: Name },
    /// A spontaneous failure with no awaiting caller to deliver it to.
    Error(DgramError),
    /// The endpoint closed. Emitted exactly once.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unbound,
    Bound,
    Connected,
    Closed,
}

struct EndpointState {
    lifecycle: Lifecycle,
    local: Option<Name>,
    peer: Option<Name>,
    recv_buffer_size: Option<u32>,
    send_buffer_size: Option<u32>,
}

struct EndpointShared {
    id: HandleId,
    bridge: Bridge,
    kind: EndpointKind,
    reuse_addr: bool,
    ipv6_only: bool,
    resolver: Arc<dyn Resolve>,
    state: Mutex<EndpointState>,
    emitter: Emitter<EndpointEvent>,
    /// Serializes lifecycle transitions (bind/connect/disconnect/close and
    /// the implicit-bind path of send).
    op_lock: tokio::sync::Mutex<()>,
}

/// A connectionless or pseudo-connected datagram handle.
///
/// Clones share the same underlying endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointShared>,
}

impl Endpoint {
    pub fn new(bridge: Bridge, config: EndpointConfig) -> Self {
        Self {
            inner: Arc::new(EndpointShared {
                id: HandleId::fresh(),
                bridge,
                kind: config.kind,
                reuse_addr: config.reuse_addr,
                ipv6_only: config.ipv6_only,
                resolver: config.resolver,
                state: Mutex::new(EndpointState {
                    lifecycle: Lifecycle::Unbound,
                    local: None,
                    peer: None,
                    recv_buffer_size: config.recv_buffer_size,
                    send_buffer_size: config.send_buffer_size,
                }),
                emitter: Emitter::new(),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// This endpoint's bridge identifier.
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(
        &self,
        handler: impl Fn(&EndpointEvent) + Send + Sync + 'static,
    ) -> Subscription<EndpointEvent> {
        self.inner.emitter.subscribe(handler)
    }

    /// Bind to a port and start receiving.
    ///
    /// Fails with [`DgramError::AlreadyBound`] on a bound endpoint without
    /// touching its state. A failure surfaces only on the returned future.
    pub async fn bind(&self, config: BindConfig) -> Result<Name, DgramError> {
        let _guard = self.inner.op_lock.lock().await;
        self.bind_locked(config).await
    }

    /// Bind while holding the op lock.
    async fn bind_locked(&self, config: BindConfig) -> Result<Name, DgramError> {
        match self.inner.state.lock().lifecycle {
            Lifecycle::Unbound => {}
            Lifecycle::Closed => return Err(DgramError::Destroyed),
            _ => return Err(DgramError::AlreadyBound),
        }

        let address = match config.address {
            None => self.inner.kind.wildcard().to_string(),
            Some(addr) if addr.parse::<std::net::IpAddr>().is_ok() => addr,
            Some(host) => self.inner.resolver.lookup(&host).await?,
        };

        let events = self.inner.bridge.register(self.inner.id);

        let bind_result: Result<Name, DgramError> = async {
            self.inner
                .bridge
                .submit(Method::UdpBind {
                    handle: self.inner.id.raw(),
                    port: config.port,
                    address,
                    reuse_addr: self.inner.reuse_addr,
                    ipv6_only: self.inner.ipv6_only,
                })
                .await?;

            let local = match self
                .inner
                .bridge
                .submit(Method::UdpLocalName {
                    handle: self.inner.id.raw(),
                })
                .await?
            {
                Reply::Name(name) => name,
                _ => return Err(skein_session::BridgeError::UnexpectedReply.into()),
            };

            self.inner
                .bridge
                .submit(Method::UdpReadStart {
                    handle: self.inner.id.raw(),
                })
                .await?;

            Ok(local)
        }
        .await;

        match bind_result {
            Ok(local) => {
                {
                    let mut st = self.inner.state.lock();
                    st.lifecycle = Lifecycle::Bound;
                    st.local = Some(local.clone());
                }
                spawn_pump(self.clone(), events);
                self.inner
                    .emitter
                    .emit(&EndpointEvent::Listening(local.clone()));
                Ok(local)
            }
            Err(e) => {
                self.inner.bridge.unregister(self.inner.id);
                Err(e)
            }
        }
    }

    /// Bind to an ephemeral port if still unbound.
    async fn ensure_bound_locked(&self) -> Result<(), DgramError> {
        if self.inner.state.lock().lifecycle == Lifecycle::Unbound {
            self.bind_locked(BindConfig::default()).await?;
        }
        Ok(())
    }

    /// Associate with a fixed remote peer.
    ///
    /// Implicitly binds first when unbound. Calling `connect` on a
    /// connected endpoint fails with [`DgramError::AlreadyConnected`],
    /// leaving the existing association untouched.
    pub async fn connect(&self, port: u16, host: Option<String>) -> Result<Name, DgramError> {
        let _guard = self.inner.op_lock.lock().await;

        match self.inner.state.lock().lifecycle {
            Lifecycle::Connected => return Err(DgramError::AlreadyConnected),
            Lifecycle::Closed => return Err(DgramError::Destroyed),
            _ => {}
        }

        self.ensure_bound_locked().await?;

        let host = host.unwrap_or_else(|| self.inner.kind.loopback().to_string());
        let address = if host.parse::<std::net::IpAddr>().is_ok() {
            host
        } else {
            self.inner.resolver.lookup(&host).await?
        };

        self.inner
            .bridge
            .submit(Method::UdpConnect {
                handle: self.inner.id.raw(),
                port,
                address,
            })
            .await?;

        let peer = match self
            .inner
            .bridge
            .submit(Method::UdpPeerName {
                handle: self.inner.id.raw(),
            })
            .await?
        {
            Reply::Name(name) => name,
            _ => return Err(skein_session::BridgeError::UnexpectedReply.into()),
        };

        {
            let mut st = self.inner.state.lock();
            st.lifecycle = Lifecycle::Connected;
            st.peer = Some(peer.clone());
        }
        self.inner.emitter.emit(&EndpointEvent::Connect(peer.clone()));
        Ok(peer)
    }

    /// Drop the peer association, returning to plain bound state.
    pub async fn disconnect(&self) -> Result<(), DgramError> {
        let _guard = self.inner.op_lock.lock().await;

        match self.inner.state.lock().lifecycle {
            Lifecycle::Connected => {}
            Lifecycle::Closed => return Err(DgramError::Destroyed),
            _ => return Err(DgramError::NotConnected),
        }

        self.inner
            .bridge
            .submit(Method::UdpDisconnect {
                handle: self.inner.id.raw(),
            })
            .await?;

        let mut st = self.inner.state.lock();
        st.lifecycle = Lifecycle::Bound;
        st.peer = None;
        Ok(())
    }

    /// Send one datagram.
    ///
    /// `destination` must be present on an unconnected endpoint and absent
    /// on a connected one — a connected endpoint only accepts
    /// destination-less sends, and the violation is detected before any
    /// bytes leave the process. The payload is normalized to bytes in one
    /// step, also before dispatch. Implicitly binds when unbound.
    pub async fn send(
        &self,
        payload: impl Into<Payload>,
        destination: Option<Destination>,
    ) -> Result<(), DgramError> {
        // Normalization is atomic: the whole payload becomes bytes here or
        // the send never starts.
        let data = payload.into().normalize();

        let _guard = self.inner.op_lock.lock().await;

        let connected = match self.inner.state.lock().lifecycle {
            Lifecycle::Closed => return Err(DgramError::Destroyed),
            Lifecycle::Connected => true,
            _ => false,
        };

        let (port, address) = match (connected, destination) {
            (true, Some(_)) => return Err(DgramError::AlreadyConnected),
            (true, None) => (None, None),
            (false, None) => return Err(DgramError::NotConnected),
            (false, Some(dest)) => {
                let address = if dest.host.parse::<std::net::IpAddr>().is_ok() {
                    dest.host
                } else {
                    self.inner.resolver.lookup(&dest.host).await?
                };
                (Some(dest.port), Some(address))
            }
        };

        self.ensure_bound_locked().await?;

        self.inner
            .bridge
            .submit(Method::UdpSend {
                handle: self.inner.id.raw(),
                port,
                address,
                data,
            })
            .await?;
        Ok(())
    }

    /// Close the endpoint.
    ///
    /// Idempotent: a second call is a no-op and `Close` is emitted exactly
    /// once. The native-side release is best-effort.
    pub async fn close(&self) -> Result<(), DgramError> {
        let _guard = self.inner.op_lock.lock().await;

        {
            let mut st = self.inner.state.lock();
            if st.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            st.lifecycle = Lifecycle::Closed;
        }

        self.inner.bridge.cancel_handle(self.inner.id);

        if let Err(e) = self
            .inner
            .bridge
            .submit(Method::UdpClose {
                handle: self.inner.id.raw(),
            })
            .await
        {
            warn!(handle = %self.inner.id, error = %e, "native close failed; closing anyway");
        }

        self.inner.emitter.emit(&EndpointEvent::Close);
        Ok(())
    }

    /// The bound local name (cached at bind time).
    pub fn local_addr(&self) -> Option<Name> {
        self.inner.state.lock().local.clone()
    }

    /// The associated peer's name (cached at connect time).
    pub fn peer_addr(&self) -> Option<Name> {
        self.inner.state.lock().peer.clone()
    }

    pub fn recv_buffer_size(&self) -> Option<u32> {
        self.inner.state.lock().recv_buffer_size
    }

    pub fn set_recv_buffer_size(&self, size: u32) {
        self.inner.state.lock().recv_buffer_size = Some(size);
    }

    pub fn send_buffer_size(&self) -> Option<u32> {
        self.inner.state.lock().send_buffer_size
    }

    pub fn set_send_buffer_size(&self, size: u32) {
        self.inner.state.lock().send_buffer_size = Some(size);
    }

    // ------------------------------------------------------------------
    // Deliberately unimplemented socket options. These fail fast with a
    // dedicated signal, never silently as a no-op.
    // ------------------------------------------------------------------

    pub fn set_broadcast(&self, _enable: bool) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("broadcast"))
    }

    pub fn set_ttl(&self, _ttl: u32) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("ttl"))
    }

    pub fn set_multicast_ttl(&self, _ttl: u32) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("multicast ttl"))
    }

    pub fn set_multicast_loopback(&self, _enable: bool) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("multicast loopback"))
    }

    pub fn set_multicast_interface(&self, _interface: &str) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("multicast interface"))
    }

    pub fn add_membership(&self, _group: &str) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("multicast membership"))
    }

    pub fn drop_membership(&self, _group: &str) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("multicast membership"))
    }

    pub fn add_source_specific_membership(
        &self,
        _source: &str,
        _group: &str,
    ) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("source-specific multicast membership"))
    }

    pub fn drop_source_specific_membership(
        &self,
        _source: &str,
        _group: &str,
    ) -> Result<(), DgramError> {
        Err(DgramError::NotSupported("source-specific multicast membership"))
    }
}

/// Event pump: delivers datagram arrivals in order.
fn spawn_pump(endpoint: Endpoint, mut events: EventSource) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Message {
                    bytes,
                    port,
                    address,
                    family,
                } => {
                    endpoint.inner.emitter.emit(&EndpointEvent::Message {
                        data: bytes,
                        peer: Name {
                            address,
                            port,
                            family,
                        },
                    });
                }
                other => {
                    trace!(handle = %endpoint.inner.id, event = ?other, "unexpected event kind for endpoint, dropped");
                }
            }
        }
    });
}
