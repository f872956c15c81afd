//! Listening acceptor.
//!
//! A [`Server`] owns a listening identifier on the bridge and spawns a
//! [`Socket`] per inbound `Connection` event. The connection ceiling is
//! enforced at accept time: an over-limit inbound connection is accepted at
//! the transport level but immediately closed at the bridge, without ever
//! being surfaced to the application.

use std::sync::Arc;

use parking_lot::Mutex;
use skein_session::{Bridge, Emitter, EventSource, Subscription};
use skein_wire::{Event, HandleId, IpFamily, Method, Name, Reply};
use tracing::{debug, trace, warn};

use crate::error::NetError;
use crate::socket::Socket;

/// Options for [`Server::listen`].
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    pub address: String,
}

impl ListenConfig {
    pub fn new(port: u16, address: impl Into<String>) -> Self {
        Self {
            port,
            address: address.into(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: 0,
            address: "0.0.0.0".into(),
        }
    }
}

/// Lifecycle events of one server.
#[derive(Clone)]
pub enum ServerEvent {
    /// The listener is bound; carries the resolved local name.
    Listening(Name),
    /// An accepted inbound connection.
    Connection(Socket),
    /// The listener is released and the last child has drained. Emitted
    /// exactly once.
    Close,
    /// A spontaneous failure with no awaiting caller to deliver it to.
    Error(NetError),
}

impl std::fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerEvent::Listening(name) => f.debug_tuple("Listening").field(name).finish(),
            ServerEvent::Connection(s) => f.debug_tuple("Connection").field(&s.id()).finish(),
            ServerEvent::Close => f.write_str("Close"),
            ServerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

struct ServerState {
    listening: bool,
    /// Asked to stop accepting (close requested or completed).
    closing: bool,
    /// Listener released on the native side.
    released: bool,
    close_emitted: bool,
    connections: usize,
    max_connections: Option<usize>,
    local: Option<Name>,
}

pub(crate) struct ServerShared {
    id: HandleId,
    bridge: Bridge,
    state: Mutex<ServerState>,
    emitter: Emitter<ServerEvent>,
}

impl ServerShared {
    /// Called by a child socket when it reaches `Closed`.
    pub(crate) fn child_closed(&self) {
        let emit = {
            let mut st = self.state.lock();
            st.connections = st.connections.saturating_sub(1);
            self.close_ready(&mut st)
        };
        if emit {
            self.emitter.emit(&ServerEvent::Close);
        }
    }

    /// `Close` fires exactly once, when the listener is released and the
    /// live count has drained — whichever happens later. Reaching zero
    /// connections alone, while still listening, does not close the server.
    fn close_ready(&self, st: &mut ServerState) -> bool {
        if st.closing && st.released && st.connections == 0 && !st.close_emitted {
            st.close_emitted = true;
            true
        } else {
            false
        }
    }
}

/// A listening acceptor over one bridge.
///
/// Clones share the same underlying server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerShared>,
}

impl Server {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            inner: Arc::new(ServerShared {
                id: HandleId::fresh(),
                bridge,
                state: Mutex::new(ServerState {
                    listening: false,
                    closing: false,
                    released: false,
                    close_emitted: false,
                    connections: 0,
                    max_connections: None,
                    local: None,
                }),
                emitter: Emitter::new(),
            }),
        }
    }

    /// This server's bridge identifier.
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(
        &self,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription<ServerEvent> {
        self.inner.emitter.subscribe(handler)
    }

    /// Cap the number of simultaneously live accepted connections.
    ///
    /// Inbound connections beyond the ceiling are closed immediately and
    /// never emitted.
    pub fn set_max_connections(&self, max: Option<usize>) {
        self.inner.state.lock().max_connections = max;
    }

    /// Number of currently live accepted connections.
    pub fn connections(&self) -> usize {
        self.inner.state.lock().connections
    }

    /// Bind and start listening; resolves to the bound local name,
    /// delivered once. A failure surfaces only on the returned future.
    pub async fn listen(&self, config: ListenConfig) -> Result<Name, NetError> {
        {
            let mut st = self.inner.state.lock();
            if st.listening || st.closing {
                return Err(NetError::AlreadyListening);
            }
            st.listening = true;
        }

        let events = self.inner.bridge.register(self.inner.id);
        spawn_acceptor(self.clone(), events);

        let reply = self
            .inner
            .bridge
            .submit(Method::TcpListen {
                handle: self.inner.id.raw(),
                port: config.port,
                address: config.address,
            })
            .await;

        match reply {
            Ok(Reply::Name(name)) => {
                self.inner.state.lock().local = Some(name.clone());
                self.inner.emitter.emit(&ServerEvent::Listening(name.clone()));
                Ok(name)
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected listen reply shape");
                self.fail_listen();
                Err(NetError::Bridge(skein_session::BridgeError::UnexpectedReply))
            }
            Err(e) => {
                self.fail_listen();
                Err(NetError::Bridge(e))
            }
        }
    }

    fn fail_listen(&self) {
        self.inner.state.lock().listening = false;
        self.inner.bridge.unregister(self.inner.id);
    }

    /// The bound local name, once listening.
    pub fn local_addr(&self) -> Option<Name> {
        self.inner.state.lock().local.clone()
    }

    /// Ask the native side how many connections it tracks for this server.
    pub async fn connection_count(&self) -> Result<u32, NetError> {
        let reply = self
            .inner
            .bridge
            .submit(Method::TcpConnectionCount {
                handle: self.inner.id.raw(),
            })
            .await?;
        match reply {
            Reply::ConnectionCount { count } => Ok(count),
            _ => Err(NetError::Bridge(skein_session::BridgeError::UnexpectedReply)),
        }
    }

    /// Release the listener.
    ///
    /// Safe to call while accepted connections remain open: children are
    /// not force-closed, and the `Close` event waits for them to drain.
    /// A release failure is logged and does not prevent the teardown from
    /// completing.
    pub async fn close(&self) -> Result<(), NetError> {
        {
            let mut st = self.inner.state.lock();
            if st.closing {
                return Ok(());
            }
            st.closing = true;
            st.listening = false;
        }

        let result = self
            .inner
            .bridge
            .submit(Method::TcpClose {
                handle: self.inner.id.raw(),
            })
            .await;
        if let Err(ref e) = result {
            warn!(handle = %self.inner.id, error = %e, "listener release failed; closing anyway");
        }

        self.inner.bridge.unregister(self.inner.id);

        let emit = {
            let mut st = self.inner.state.lock();
            st.released = true;
            self.inner.close_ready(&mut st)
        };
        if emit {
            self.inner.emitter.emit(&ServerEvent::Close);
        }

        result.map(|_| ()).map_err(NetError::Bridge)
    }

    /// Handle one inbound `Connection` event.
    fn accept(&self, handle: u64, port: u16, address: String, family: IpFamily) {
        let remote = Name {
            address,
            port,
            family,
        };

        let over_limit = {
            let mut st = self.inner.state.lock();
            if st.closing {
                true
            } else {
                match st.max_connections {
                    Some(max) if st.connections >= max => true,
                    _ => {
                        st.connections += 1;
                        false
                    }
                }
            }
        };

        if over_limit {
            // Accepted at the transport level, rejected here: close the
            // child immediately and never surface it.
            debug!(handle, "inbound connection over ceiling, closing");
            let bridge = self.inner.bridge.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.submit(Method::TcpClose { handle }).await {
                    trace!(handle, error = %e, "close of over-limit connection failed");
                }
            });
            return;
        }

        let socket = Socket::accepted(
            self.inner.bridge.clone(),
            HandleId(handle),
            remote,
            Arc::downgrade(&self.inner),
        );
        self.inner.emitter.emit(&ServerEvent::Connection(socket));
    }
}

/// Event pump for the listening identifier.
fn spawn_acceptor(server: Server, mut events: EventSource) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Connection {
                    handle,
                    port,
                    address,
                    family,
                } => server.accept(handle, port, address, family),
                other => {
                    trace!(server = %server.inner.id, event = ?other, "unexpected event kind for server, dropped");
                }
            }
        }
    });
}
