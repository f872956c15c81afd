#![deny(unsafe_code)]

//! Test support: a scripted native-side peer.
//!
//! [`FakeNative`] sits on the far end of an in-process transport pair and
//! plays the native side of the bridge: it records every request in
//! arrival order, answers each one from a script (or sensible defaults),
//! and can inject unsolicited events. The cross-crate property tests in
//! `tests/` drive real handles against it.

use std::sync::Arc;

use parking_lot::Mutex;
use skein_session::Bridge;
use skein_wire::{Event, Fault, HandleId, IpFamily, Message, Method, Name, Reply};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::trace;

/// What the script wants done with one request.
pub enum Scripted {
    /// Answer with the built-in default reply for the method.
    Default,
    /// Answer with this reply.
    Reply(Reply),
    /// Answer with this fault.
    Fault(Fault),
    /// Swallow the request: no response, the waiter stays pending.
    Silent,
}

/// Per-request script. Runs on the fake native task.
pub type Script = Box<dyn FnMut(&Method) -> Scripted + Send>;

/// The scripted native-side peer.
pub struct FakeNative {
    requests: Arc<Mutex<Vec<Method>>>,
    inject_tx: UnboundedSender<Message>,
}

impl FakeNative {
    /// Spawn a fake native peer answering everything with defaults.
    /// Returns the application-side bridge and the fake.
    pub fn spawn() -> (Bridge, FakeNative) {
        Self::spawn_with(Box::new(|_| Scripted::Default))
    }

    /// Spawn with a custom script.
    pub fn spawn_with(mut script: Script) -> (Bridge, FakeNative) {
        let (app_side, mut native_side) = skein_local::pair();
        let bridge = Bridge::spawn(app_side);

        let requests = Arc::new(Mutex::new(Vec::new()));
        let (inject_tx, mut inject_rx) = unbounded_channel::<Message>();

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            use skein_session::MessageTransport;
            loop {
                tokio::select! {
                    inbound = native_side.recv() => {
                        let Ok(Some(Message::Request { request_id, method })) = inbound else {
                            break;
                        };
                        recorded.lock().push(method.clone());
                        let response = match script(&method) {
                            Scripted::Default => Message::reply(request_id, default_reply(&method)),
                            Scripted::Reply(reply) => Message::reply(request_id, reply),
                            Scripted::Fault(fault) => Message::fault(request_id, fault),
                            Scripted::Silent => {
                                trace!(method = method.name(), "scripted silence");
                                continue;
                            }
                        };
                        if native_side.send(&response).await.is_err() {
                            break;
                        }
                    }
                    injected = inject_rx.recv() => {
                        let Some(msg) = injected else { break };
                        if native_side.send(&msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (
            bridge,
            FakeNative {
                requests,
                inject_tx,
            },
        )
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Method> {
        self.requests.lock().clone()
    }

    /// The `tcp-send` payloads for `handle`, in arrival order.
    pub fn sent_data(&self, handle: HandleId) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .iter()
            .filter_map(|m| match m {
                Method::TcpSend { handle: h, data } if *h == handle.raw() => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Push an unsolicited event for `source` to the application side.
    pub fn inject(&self, source: HandleId, event: Event) {
        let _ = self.inject_tx.send(Message::Event {
            source: source.raw(),
            event,
        });
    }
}

/// Built-in reply for each method, for scripts that don't care.
pub fn default_reply(method: &Method) -> Reply {
    match method {
        Method::TcpConnect { port, address, .. } => Reply::Name(Name {
            address: address.clone(),
            port: *port,
            family: IpFamily::V4,
        }),
        Method::TcpListen { port, address, .. } => Reply::Name(Name {
            address: address.clone(),
            port: if *port == 0 { 43000 } else { *port },
            family: IpFamily::V4,
        }),
        Method::TcpSend { .. } => Reply::Sent { queue_depth: 0 },
        Method::TcpConnectionCount { .. } => Reply::ConnectionCount { count: 0 },
        Method::TcpLocalName { .. }
        | Method::TcpRemoteName { .. }
        | Method::UdpLocalName { .. }
        | Method::UdpPeerName { .. } => Reply::Name(Name {
            address: "127.0.0.1".into(),
            port: 50000,
            family: IpFamily::V4,
        }),
        Method::FsRead { .. } => Reply::Read {
            data: Vec::new(),
            eof: true,
        },
        Method::FsWrite { data, .. } => Reply::Written {
            bytes: data.len() as u32,
        },
        Method::FsStat { .. } => Reply::Stat {
            size: 0,
            mode: 0o644,
            modified_ms: 0,
            accessed_ms: 0,
            created_ms: 0,
        },
        Method::NetworkInterfaces => Reply::Interfaces {
            ipv4: vec![
                ("lo".into(), "127.0.0.1".into()),
                ("en0".into(), "192.168.1.20".into()),
            ],
            ipv6: vec![("lo".into(), "::1".into())],
        },
        Method::PlatformInfo => Reply::Platform {
            os: "linux".into(),
            arch: "x86_64".into(),
            kind: "linux".into(),
        },
        _ => Reply::Done,
    }
}

/// Poll `condition` every few milliseconds until it holds or the deadline
/// passes. Panics on expiry: in these tests a missed condition is a bug.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = std::time::Duration::from_secs(2);
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

/// Sleep long enough for queued work on the bridge to settle.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
