//! Stream-oriented socket handle.
//!
//! A [`Socket`] walks a strictly linear lifecycle:
//!
//! ```text
//! Unbound → Connecting → Connected → HalfClosed(read|write) → Closed
//! ```
//!
//! Once `Closed` it never re-opens; a second `connect` fails without
//! touching the first connection's state. All native interaction goes
//! through the bridge: correlated requests for connect/send/shutdown/close,
//! send-only signals for flow control and option toggles, and inbound
//! `Data` events routed here by the session's event router.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use skein_session::{Bridge, Emitter, EventSource, SendOnly, Subscription};
use skein_wire::{Event, HandleId, Method, Name, Reply};
use tokio::sync::{Notify, oneshot};
use tracing::{trace, warn};

use crate::error::NetError;
use crate::server::ServerShared;

/// Construction options for a socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// When false (the default), receiving end-of-stream from the peer
    /// automatically shuts down the write side as well: a socket that does
    /// not support half-duplex degrades immediately to full close once the
    /// peer finishes its side.
    pub allow_half_open: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            allow_half_open: false,
        }
    }
}

/// Destination for [`Socket::connect`].
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub port: u16,
    pub host: String,
}

impl ConnectConfig {
    pub fn new(port: u16, host: impl Into<String>) -> Self {
        Self {
            port,
            host: host.into(),
        }
    }
}

/// Lifecycle events of one socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is established.
    Connect,
    /// Bytes arrived from the peer.
    Data(Vec<u8>),
    /// The peer closed its write side (end-of-stream).
    End,
    /// The idle timeout elapsed without suppression.
    Timeout,
    /// A spontaneous failure with no awaiting caller to deliver it to.
    Error(NetError),
    /// The socket reached `Closed`. Emitted exactly once.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Unbound,
    Connecting,
    Connected,
    /// The peer finished sending; our write side is still open.
    ReadClosed,
    /// We shut down our write side; the peer may still send.
    WriteClosed,
    Closed,
}

impl Lifecycle {
    fn write_open(self) -> bool {
        matches!(self, Lifecycle::Connected | Lifecycle::ReadClosed)
    }
}

struct WriteItem {
    data: Vec<u8>,
    done: oneshot::Sender<Result<(), NetError>>,
}

enum QueuedWrite {
    Chunk(WriteItem),
    /// Write-side shutdown barrier: flush everything before it, then send
    /// the shutdown request. Keeps `end()` from overtaking queued chunks.
    Shutdown(oneshot::Sender<Result<(), NetError>>),
}

/// One flush-cycle step: a coalesced run of chunks, or the shutdown barrier.
enum Batch {
    Chunks(Vec<WriteItem>),
    Shutdown(oneshot::Sender<Result<(), NetError>>),
}

pub(crate) struct SocketState {
    lifecycle: Lifecycle,
    destroyed: bool,
    /// Consumer intent: deliver data events (true) or buffer them (false).
    flowing: bool,
    /// Last flow signal actually posted to the native side.
    delivering: bool,
    read_buffer: VecDeque<Vec<u8>>,
    write_queue: VecDeque<QueuedWrite>,
    flushing: bool,
    local: Option<Name>,
    remote: Option<Name>,
    /// Native write-queue depth from the last send reply.
    last_queue_depth: Option<u32>,
    /// Depth observed at the last timeout check; a difference means the
    /// elapsed timer was a false positive.
    timeout_checked_depth: Option<u32>,
    /// Bumped on reads and completed writes; the idle timer re-arms
    /// instead of firing when it moved.
    activity_epoch: u64,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct SocketShared {
    id: HandleId,
    bridge: Bridge,
    allow_half_open: bool,
    state: Mutex<SocketState>,
    emitter: Emitter<SocketEvent>,
    /// Wakes the event pump when flow intent changes.
    flow_notify: Notify,
    /// Parent acceptor, for live-connection accounting of accepted sockets.
    server: Option<Weak<ServerShared>>,
}

/// A stream-oriented handle multiplexed over one bridge.
///
/// Clones share the same underlying socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketShared>,
}

impl Socket {
    /// Create an unconnected socket on `bridge`.
    pub fn new(bridge: Bridge, config: SocketConfig) -> Self {
        Self::build(bridge, config.allow_half_open, Lifecycle::Unbound, None, None)
    }

    /// Build an already-connected socket for an accepted connection.
    pub(crate) fn accepted(
        bridge: Bridge,
        id: HandleId,
        remote: Name,
        server: Weak<ServerShared>,
    ) -> Self {
        let socket = Self::build(
            bridge.clone(),
            false,
            Lifecycle::Connected,
            Some(server),
            Some(id),
        );
        socket.inner.state.lock().remote = Some(remote);
        let events = bridge.register(id);
        spawn_pump(socket.clone(), events);
        socket
    }

    fn build(
        bridge: Bridge,
        allow_half_open: bool,
        lifecycle: Lifecycle,
        server: Option<Weak<ServerShared>>,
        id: Option<HandleId>,
    ) -> Self {
        Self {
            inner: Arc::new(SocketShared {
                id: id.unwrap_or_else(HandleId::fresh),
                bridge,
                allow_half_open,
                state: Mutex::new(SocketState {
                    lifecycle,
                    destroyed: false,
                    flowing: false,
                    delivering: false,
                    read_buffer: VecDeque::new(),
                    write_queue: VecDeque::new(),
                    flushing: false,
                    local: None,
                    remote: None,
                    last_queue_depth: None,
                    timeout_checked_depth: None,
                    activity_epoch: 0,
                    timeout_task: None,
                }),
                emitter: Emitter::new(),
                flow_notify: Notify::new(),
                server,
            }),
        }
    }

    /// This socket's bridge identifier.
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(
        &self,
        handler: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> Subscription<SocketEvent> {
        self.inner.emitter.subscribe(handler)
    }

    /// Establish a connection.
    ///
    /// Fails with [`NetError::AlreadyConnected`] if called on a socket that
    /// is already connecting or connected, leaving the first connection
    /// untouched. A connect failure surfaces only on the returned future —
    /// never additionally as an `Error` event — and leaves the socket
    /// `Closed`.
    pub async fn connect(&self, config: ConnectConfig) -> Result<(), NetError> {
        {
            let mut st = self.inner.state.lock();
            match st.lifecycle {
                Lifecycle::Unbound => st.lifecycle = Lifecycle::Connecting,
                Lifecycle::Closed => return Err(NetError::Destroyed),
                _ => return Err(NetError::AlreadyConnected),
            }
        }

        // Route events before the connect request is on the wire so nothing
        // pushed right after the reply can be missed.
        let events = self.inner.bridge.register(self.inner.id);
        spawn_pump(self.clone(), events);

        let reply = self
            .inner
            .bridge
            .submit(Method::TcpConnect {
                handle: self.inner.id.raw(),
                port: config.port,
                address: config.host,
            })
            .await;

        match reply {
            Ok(Reply::Name(remote)) => {
                let mut st = self.inner.state.lock();
                st.lifecycle = Lifecycle::Connected;
                st.remote = Some(remote);
                drop(st);
                self.inner.emitter.emit(&SocketEvent::Connect);
                Ok(())
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected connect reply shape");
                self.fail_connect();
                Err(NetError::Bridge(skein_session::BridgeError::UnexpectedReply))
            }
            Err(e) => {
                self.fail_connect();
                Err(NetError::Bridge(e))
            }
        }
    }

    fn fail_connect(&self) {
        self.inner.state.lock().lifecycle = Lifecycle::Closed;
        self.inner.bridge.cancel_handle(self.inner.id);
    }

    /// Queue bytes for sending and await their acceptance by the native
    /// side.
    ///
    /// Queued chunks are flushed in submission order; when several are
    /// pending they are coalesced into one contiguous buffer to amortize
    /// the bridge round trip. A write failure destroys the socket and the
    /// error propagates to every queued write's caller.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), NetError> {
        let (rx, drive) = {
            let mut st = self.inner.state.lock();
            if st.destroyed {
                return Err(NetError::Destroyed);
            }
            if !st.lifecycle.write_open() {
                return Err(match st.lifecycle {
                    Lifecycle::Unbound | Lifecycle::Connecting => NetError::NotConnected,
                    _ => NetError::NotWritable,
                });
            }
            let (tx, rx) = oneshot::channel();
            st.write_queue.push_back(QueuedWrite::Chunk(WriteItem { data, done: tx }));
            let drive = !st.flushing;
            if drive {
                st.flushing = true;
            }
            (rx, drive)
        };

        if drive {
            spawn_flush(self.clone());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NetError::Destroyed),
        }
    }

    /// Gracefully shut down the write side after all queued writes flush.
    ///
    /// The shutdown request travels through the same ordered queue as the
    /// writes, so no queued chunk is skipped or reordered.
    pub async fn end(&self) -> Result<(), NetError> {
        let (rx, drive) = {
            let mut st = self.inner.state.lock();
            if st.destroyed {
                return Err(NetError::Destroyed);
            }
            if !st.lifecycle.write_open() {
                return Err(match st.lifecycle {
                    Lifecycle::Unbound | Lifecycle::Connecting => NetError::NotConnected,
                    _ => NetError::NotWritable,
                });
            }
            let (tx, rx) = oneshot::channel();
            st.write_queue.push_back(QueuedWrite::Shutdown(tx));
            let drive = !st.flushing;
            if drive {
                st.flushing = true;
            }
            (rx, drive)
        };

        if drive {
            spawn_flush(self.clone());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NetError::Destroyed),
        }
    }

    /// Stop delivering data events; arriving data is buffered, not dropped.
    ///
    /// The read-stop signal is posted fire-and-forget: transport ordering
    /// alone guarantees it takes effect before any data sent after it.
    pub fn pause(&self) {
        let mut st = self.inner.state.lock();
        st.flowing = false;
        self.sync_flow(&mut st);
        drop(st);
        self.inner.flow_notify.notify_one();
    }

    /// Start (or resume) delivering data events, beginning with anything
    /// buffered while paused. Fire-and-forget, like [`pause`](Self::pause).
    pub fn resume(&self) {
        let mut st = self.inner.state.lock();
        if st.destroyed {
            return;
        }
        st.flowing = true;
        self.sync_flow(&mut st);
        drop(st);
        self.inner.flow_notify.notify_one();
    }

    /// Post the flow signal matching the current intent, if it changed.
    /// Exactly one stop or start signal per transition, no matter how many
    /// data events arrive in between.
    fn sync_flow(&self, st: &mut SocketState) {
        if st.destroyed || st.flowing == st.delivering {
            return;
        }
        st.delivering = st.flowing;
        let method = if st.flowing {
            Method::TcpReadStart {
                handle: self.inner.id.raw(),
            }
        } else {
            Method::TcpReadStop {
                handle: self.inner.id.raw(),
            }
        };
        if self.inner.bridge.post(SendOnly::new(method)).is_err() {
            // No flow-control recovery path exists; a failed stop/start
            // signal is fatal to the handle.
            self.force_destroy();
        }
    }

    /// Disable or enable Nagle coalescing. Fire-and-forget; ordered
    /// delivery means the option is set before any later data is sent.
    pub fn set_no_delay(&self, enable: bool) {
        self.post_option(Method::TcpSetNoDelay {
            handle: self.inner.id.raw(),
            enable,
        });
    }

    /// Toggle keep-alive probes. Fire-and-forget, as
    /// [`set_no_delay`](Self::set_no_delay).
    pub fn set_keep_alive(&self, enable: bool) {
        self.post_option(Method::TcpSetKeepAlive {
            handle: self.inner.id.raw(),
            enable,
        });
    }

    fn post_option(&self, method: Method) {
        if self.inner.bridge.post(SendOnly::new(method)).is_err() {
            self.force_destroy();
        }
    }

    /// Arm (or disarm with `None`) the idle timeout.
    ///
    /// An elapsed timer is suppressed when a write is in flight and the
    /// native-reported write-queue depth has changed since the last check:
    /// progress is being made, so the timer is treated as a false positive
    /// and rescheduled instead of firing.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let mut st = self.inner.state.lock();
        if let Some(task) = st.timeout_task.take() {
            task.abort();
        }
        let Some(duration) = timeout else { return };
        if st.destroyed {
            return;
        }
        st.timeout_checked_depth = st.last_queue_depth;
        let mut seen_epoch = st.activity_epoch;
        // Weak so an abandoned socket is not kept alive by its own timer.
        let weak = Arc::downgrade(&self.inner);
        st.timeout_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                let Some(inner) = weak.upgrade() else { break };
                let fire = {
                    let mut st = inner.state.lock();
                    if st.destroyed {
                        break;
                    }
                    if st.activity_epoch != seen_epoch {
                        // IO happened inside the window; not idle.
                        seen_epoch = st.activity_epoch;
                        false
                    } else {
                        let write_in_flight = st.flushing || !st.write_queue.is_empty();
                        if write_in_flight && st.last_queue_depth != st.timeout_checked_depth {
                            // The logical window elapsed but the native
                            // write queue moved: a false positive, reschedule.
                            st.timeout_checked_depth = st.last_queue_depth;
                            false
                        } else {
                            true
                        }
                    }
                };
                if fire {
                    inner.emitter.emit(&SocketEvent::Timeout);
                }
            }
        }));
    }

    /// The bound local name, fetched from the native side on first use.
    pub async fn local_addr(&self) -> Result<Name, NetError> {
        if let Some(name) = self.inner.state.lock().local.clone() {
            return Ok(name);
        }
        let reply = self
            .inner
            .bridge
            .submit(Method::TcpLocalName {
                handle: self.inner.id.raw(),
            })
            .await?;
        match reply {
            Reply::Name(name) => {
                self.inner.state.lock().local = Some(name.clone());
                Ok(name)
            }
            _ => Err(NetError::Bridge(skein_session::BridgeError::UnexpectedReply)),
        }
    }

    /// The connected peer's name.
    ///
    /// Usually cached from the connect reply (or the connection event for
    /// accepted sockets); fetched from the native side otherwise.
    pub async fn remote_addr(&self) -> Result<Name, NetError> {
        if let Some(name) = self.inner.state.lock().remote.clone() {
            return Ok(name);
        }
        let reply = self
            .inner
            .bridge
            .submit(Method::TcpRemoteName {
                handle: self.inner.id.raw(),
            })
            .await?;
        match reply {
            Reply::Name(name) => {
                self.inner.state.lock().remote = Some(name.clone());
                Ok(name)
            }
            _ => Err(NetError::Bridge(skein_session::BridgeError::UnexpectedReply)),
        }
    }

    /// Whether the write side is currently open.
    pub fn writable(&self) -> bool {
        self.inner.state.lock().lifecycle.write_open()
    }

    /// Tear the socket down.
    ///
    /// Idempotent: a second call is a no-op and `Close` is emitted exactly
    /// once. Every queued or in-flight request owned by the socket settles
    /// with a terminal error; the native-side release is best-effort (a
    /// failure is logged and does not prevent reaching `Closed`).
    pub async fn destroy(&self) {
        let Some(leftovers) = self.begin_destroy() else {
            return;
        };
        for item in leftovers {
            let _ = match item {
                QueuedWrite::Chunk(w) => w.done.send(Err(NetError::Destroyed)),
                QueuedWrite::Shutdown(done) => done.send(Err(NetError::Destroyed)),
            };
        }

        self.inner.bridge.cancel_handle(self.inner.id);

        if let Err(e) = self
            .inner
            .bridge
            .submit(Method::TcpClose {
                handle: self.inner.id.raw(),
            })
            .await
        {
            warn!(handle = %self.inner.id, error = %e, "native close failed; closing anyway");
        }

        if let Some(server) = self.inner.server.as_ref().and_then(Weak::upgrade) {
            server.child_closed();
        }

        self.inner.flow_notify.notify_one();
        self.inner.emitter.emit(&SocketEvent::Close);
    }

    /// First phase of teardown under the state lock. Returns `None` when
    /// the socket is already destroyed.
    fn begin_destroy(&self) -> Option<Vec<QueuedWrite>> {
        let mut st = self.inner.state.lock();
        if st.destroyed {
            return None;
        }
        st.destroyed = true;
        st.lifecycle = Lifecycle::Closed;
        st.flowing = false;
        if let Some(task) = st.timeout_task.take() {
            task.abort();
        }
        Some(st.write_queue.drain(..).collect())
    }

    /// End the write side if still open, then destroy once flushed.
    pub fn destroy_soon(&self) {
        let socket = self.clone();
        tokio::spawn(async move {
            if socket.writable() {
                if let Err(e) = socket.end().await {
                    trace!(handle = %socket.inner.id, error = %e, "end during destroy_soon");
                }
            }
            socket.destroy().await;
        });
    }

    /// Synchronous teardown entry for contexts that cannot await.
    fn force_destroy(&self) {
        let socket = self.clone();
        tokio::spawn(async move {
            socket.destroy().await;
        });
    }

    /// Handle end-of-stream from the peer (an empty data payload).
    fn peer_finished(&self) {
        let auto_close = {
            let mut st = self.inner.state.lock();
            st.lifecycle = match st.lifecycle {
                Lifecycle::WriteClosed => Lifecycle::Closed,
                Lifecycle::Closed => Lifecycle::Closed,
                _ => Lifecycle::ReadClosed,
            };
            !self.inner.allow_half_open || st.lifecycle == Lifecycle::Closed
        };
        self.inner.emitter.emit(&SocketEvent::End);
        if auto_close {
            // Half-duplex suppression: without independent-direction
            // closing, the peer finishing its side closes ours too.
            self.destroy_soon();
        }
    }

    /// Record the write-side state transition after a successful shutdown.
    fn local_finished(&self) {
        let fully_closed = {
            let mut st = self.inner.state.lock();
            st.lifecycle = match st.lifecycle {
                Lifecycle::ReadClosed => Lifecycle::Closed,
                Lifecycle::Closed => Lifecycle::Closed,
                _ => Lifecycle::WriteClosed,
            };
            st.lifecycle == Lifecycle::Closed
        };
        if fully_closed {
            self.force_destroy();
        }
    }
}

/// Drain the write queue in order, coalescing pending chunks into one
/// contiguous buffer per bridge round trip.
fn spawn_flush(socket: Socket) {
    tokio::spawn(async move {
        loop {
            let batch = {
                let mut st = socket.inner.state.lock();
                if st.write_queue.is_empty() {
                    st.flushing = false;
                    return;
                }
                if matches!(st.write_queue.front(), Some(QueuedWrite::Shutdown(_))) {
                    match st.write_queue.pop_front() {
                        Some(QueuedWrite::Shutdown(done)) => Batch::Shutdown(done),
                        _ => unreachable!("front was just observed"),
                    }
                } else {
                    let mut chunks = Vec::new();
                    while matches!(st.write_queue.front(), Some(QueuedWrite::Chunk(_))) {
                        if let Some(QueuedWrite::Chunk(item)) = st.write_queue.pop_front() {
                            chunks.push(item);
                        }
                    }
                    Batch::Chunks(chunks)
                }
            };

            match batch {
                Batch::Chunks(items) => {
                    let mut data = Vec::with_capacity(items.iter().map(|i| i.data.len()).sum());
                    for item in &items {
                        data.extend_from_slice(&item.data);
                    }
                    let reply = socket
                        .inner
                        .bridge
                        .submit(Method::TcpSend {
                            handle: socket.inner.id.raw(),
                            data,
                        })
                        .await;
                    match reply {
                        Ok(reply) => {
                            {
                                let mut st = socket.inner.state.lock();
                                if let Reply::Sent { queue_depth } = reply {
                                    st.last_queue_depth = Some(queue_depth);
                                }
                                st.activity_epoch += 1;
                            }
                            for item in items {
                                let _ = item.done.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            // A write failure destroys the socket; the error
                            // reaches every caller whose bytes were in the
                            // failed batch.
                            for item in items {
                                let _ = item.done.send(Err(NetError::Bridge(e.clone())));
                            }
                            socket.inner.state.lock().flushing = false;
                            socket.destroy().await;
                            return;
                        }
                    }
                }
                Batch::Shutdown(done) => {
                    let reply = socket
                        .inner
                        .bridge
                        .submit(Method::TcpShutdown {
                            handle: socket.inner.id.raw(),
                        })
                        .await;
                    match reply {
                        Ok(_) => {
                            socket.local_finished();
                            let _ = done.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = done.send(Err(NetError::Bridge(e)));
                            socket.inner.state.lock().flushing = false;
                            socket.destroy().await;
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// Event pump: the single consumer of this socket's routed events.
///
/// Arriving data is buffered under the state lock and delivered from here
/// in arrival order whenever the socket is flowing; pausing just stops
/// delivery, nothing is dropped.
fn spawn_pump(socket: Socket, mut events: EventSource) {
    tokio::spawn(async move {
        loop {
            // Deliver buffered chunks while flowing.
            loop {
                let chunk = {
                    let mut st = socket.inner.state.lock();
                    if st.flowing && !st.destroyed {
                        st.read_buffer.pop_front()
                    } else {
                        None
                    }
                };
                match chunk {
                    Some(bytes) if bytes.is_empty() => socket.peer_finished(),
                    Some(bytes) => socket.inner.emitter.emit(&SocketEvent::Data(bytes)),
                    None => break,
                }
            }

            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::Data { bytes }) => {
                            let mut st = socket.inner.state.lock();
                            st.activity_epoch += 1;
                            st.read_buffer.push_back(bytes);
                        }
                        Some(other) => {
                            trace!(handle = %socket.inner.id, event = ?other, "unexpected event kind for socket, dropped");
                        }
                        // Route torn down: destroy or bridge teardown.
                        None => break,
                    }
                }
                _ = socket.inner.flow_notify.notified() => {}
            }
        }
    });
}
