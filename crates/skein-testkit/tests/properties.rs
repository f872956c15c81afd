//! Cross-crate properties, driven against the scripted native peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use skein_dgram::{Destination, DgramError, Endpoint, EndpointConfig};
use skein_fs::FileHandle;
use skein_net::{
    ConnectConfig, ListenConfig, NetError, Server, ServerEvent, Socket, SocketConfig, SocketEvent,
};
use skein_session::BridgeError;
use skein_testkit::{FakeNative, Scripted, eventually, settle};
use skein_wire::{Event, Method};

fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let reader = {
        let count = Arc::clone(&count);
        move || count.load(Ordering::SeqCst)
    };
    (count, reader)
}

async fn connected_socket(bridge: &skein_session::Bridge, config: SocketConfig) -> Socket {
    let socket = Socket::new(bridge.clone(), config);
    socket
        .connect(ConnectConfig::new(4000, "127.0.0.1"))
        .await
        .expect("connect against fake native");
    socket
}

// ---------------------------------------------------------------------------
// Close idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn socket_destroy_twice_emits_close_once() {
    let (bridge, _fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    let (closes, close_count) = counter();
    socket.subscribe(move |e| {
        if matches!(e, SocketEvent::Close) {
            closes.fetch_add(1, Ordering::SeqCst);
        }
    });

    socket.destroy().await;
    socket.destroy().await;
    settle().await;

    assert_eq!(close_count(), 1);
}

#[tokio::test]
async fn endpoint_close_twice_emits_close_once() {
    let (bridge, _fake) = FakeNative::spawn();
    let endpoint = Endpoint::new(bridge, EndpointConfig::default());
    endpoint.bind(Default::default()).await.unwrap();

    let (closes, close_count) = counter();
    endpoint.subscribe(move |e| {
        if matches!(e, skein_dgram::EndpointEvent::Close) {
            closes.fetch_add(1, Ordering::SeqCst);
        }
    });

    endpoint.close().await.unwrap();
    endpoint.close().await.unwrap();
    settle().await;

    assert_eq!(close_count(), 1);
}

#[tokio::test]
async fn file_close_twice_emits_close_once() {
    let (bridge, _fake) = FakeNative::spawn();
    let file = FileHandle::open(bridge, "/tmp/x", "r", 0o666).await.unwrap();

    let (closes, close_count) = counter();
    file.subscribe(move |e| {
        if matches!(e, skein_fs::FileEvent::Close) {
            closes.fetch_add(1, Ordering::SeqCst);
        }
    });

    file.close().await.unwrap();
    file.close().await.unwrap();
    settle().await;

    assert_eq!(close_count(), 1);
}

// ---------------------------------------------------------------------------
// Write ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn writes_arrive_in_call_order_none_skipped() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    for i in 0u8..5 {
        socket.write(vec![i, i, i]).await.unwrap();
    }
    socket.end().await.unwrap();

    let flat: Vec<u8> = fake.sent_data(socket.id()).concat();
    let expected: Vec<u8> = (0u8..5).flat_map(|i| [i, i, i]).collect();
    assert_eq!(flat, expected);

    // The shutdown request trails every send.
    let names: Vec<&str> = fake
        .requests()
        .iter()
        .filter(|m| m.handle() == Some(socket.id()))
        .map(Method::name)
        .collect();
    let last_send = names.iter().rposition(|n| *n == "tcp-send").unwrap();
    let shutdown = names.iter().position(|n| *n == "tcp-shutdown").unwrap();
    assert!(shutdown > last_send);
}

#[tokio::test]
async fn concurrent_writes_coalesce_without_reordering() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    let (a, b, c) = tokio::join!(
        socket.write(b"one-".to_vec()),
        socket.write(b"two-".to_vec()),
        socket.write(b"three".to_vec()),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let flat: Vec<u8> = fake.sent_data(socket.id()).concat();
    assert_eq!(flat, b"one-two-three");
}

// ---------------------------------------------------------------------------
// Half-duplex suppression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_of_stream_auto_closes_without_half_open() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(
        &bridge,
        SocketConfig {
            allow_half_open: false,
        },
    )
    .await;
    socket.resume();

    let (closes, close_count) = counter();
    socket.subscribe(move |e| {
        if matches!(e, SocketEvent::Close) {
            closes.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Peer finishes its side; no manual end() follows.
    fake.inject(socket.id(), Event::Data { bytes: vec![] });

    eventually(|| close_count() == 1).await;
    assert!(!socket.writable());

    let names: Vec<&str> = fake
        .requests()
        .iter()
        .filter(|m| m.handle() == Some(socket.id()))
        .map(Method::name)
        .collect();
    assert!(names.contains(&"tcp-shutdown"));
    assert!(names.contains(&"tcp-close"));
}

#[tokio::test]
async fn end_of_stream_keeps_write_side_with_half_open() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(
        &bridge,
        SocketConfig {
            allow_half_open: true,
        },
    )
    .await;
    socket.resume();

    let (ends, end_count) = counter();
    let (closes, close_count) = counter();
    socket.subscribe(move |e| match e {
        SocketEvent::End => {
            ends.fetch_add(1, Ordering::SeqCst);
        }
        SocketEvent::Close => {
            closes.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    });

    fake.inject(socket.id(), Event::Data { bytes: vec![] });

    eventually(|| end_count() == 1).await;
    settle().await;

    // Still writable until the application ends it explicitly.
    assert!(socket.writable());
    assert_eq!(close_count(), 0);
    socket.write(b"late".to_vec()).await.unwrap();

    socket.end().await.unwrap();
    eventually(|| close_count() == 1).await;
}

// ---------------------------------------------------------------------------
// Acceptor ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn over_ceiling_connection_is_closed_and_never_surfaced() {
    let (bridge, fake) = FakeNative::spawn();
    let server = Server::new(bridge);
    server.set_max_connections(Some(1));
    server.listen(ListenConfig::default()).await.unwrap();

    let accepted = Arc::new(Mutex::new(Vec::new()));
    {
        let accepted = Arc::clone(&accepted);
        server.subscribe(move |e| {
            if let ServerEvent::Connection(socket) = e {
                accepted.lock().push(socket.id());
            }
        });
    }

    fake.inject(
        server.id(),
        Event::Connection {
            handle: 111,
            port: 6001,
            address: "10.0.0.1".into(),
            family: skein_wire::IpFamily::V4,
        },
    );
    fake.inject(
        server.id(),
        Event::Connection {
            handle: 222,
            port: 6002,
            address: "10.0.0.2".into(),
            family: skein_wire::IpFamily::V4,
        },
    );

    // The over-limit child is released at the bridge...
    eventually(|| {
        fake.requests()
            .iter()
            .any(|m| matches!(m, Method::TcpClose { handle: 222 }))
    })
    .await;

    // ...and never emitted; the accepted count stays at the ceiling.
    assert_eq!(accepted.lock().len(), 1);
    assert_eq!(accepted.lock()[0].raw(), 111);
    assert_eq!(server.connections(), 1);
}

// ---------------------------------------------------------------------------
// Double connect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_connect_fails_and_leaves_first_untouched() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;
    let remote_before = socket.remote_addr().await.unwrap();

    let err = socket
        .connect(ConnectConfig::new(9999, "9.9.9.9"))
        .await
        .unwrap_err();

    assert_eq!(err, NetError::AlreadyConnected);
    assert_eq!(socket.remote_addr().await.unwrap(), remote_before);

    let connects = fake
        .requests()
        .iter()
        .filter(|m| matches!(m, Method::TcpConnect { .. }))
        .count();
    assert_eq!(connects, 1);
}

// ---------------------------------------------------------------------------
// Connected datagram endpoint rejects explicit destinations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connected_endpoint_rejects_destination_and_sends_nothing() {
    let (bridge, fake) = FakeNative::spawn();
    let endpoint = Endpoint::new(bridge, EndpointConfig::default());
    endpoint.connect(9000, Some("127.0.0.1".into())).await.unwrap();

    let err = endpoint
        .send(b"datagram".as_slice(), Some(Destination::new(7, "127.0.0.1")))
        .await
        .unwrap_err();

    assert_eq!(err, DgramError::AlreadyConnected);
    assert!(
        !fake
            .requests()
            .iter()
            .any(|m| matches!(m, Method::UdpSend { .. }))
    );

    // Destination-less send on the association still works.
    endpoint.send(b"datagram".as_slice(), None).await.unwrap();
    assert!(
        fake.requests()
            .iter()
            .any(|m| matches!(m, Method::UdpSend { port: None, address: None, .. }))
    );
}

// ---------------------------------------------------------------------------
// Flow control signals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_resume_sends_one_stop_one_start_and_buffers() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        socket.subscribe(move |e| {
            if let SocketEvent::Data(bytes) = e {
                received.lock().push(bytes.clone());
            }
        });
    }

    socket.resume();
    settle().await;
    socket.pause();
    settle().await;

    // Data already in flight when the stop signal lands.
    for i in 1u8..=3 {
        fake.inject(socket.id(), Event::Data { bytes: vec![i] });
    }
    settle().await;
    assert!(received.lock().is_empty());

    socket.resume();
    eventually(|| received.lock().len() == 3).await;
    assert_eq!(*received.lock(), vec![vec![1], vec![2], vec![3]]);

    let signals: Vec<&str> = fake
        .requests()
        .iter()
        .filter(|m| m.handle() == Some(socket.id()))
        .map(Method::name)
        .filter(|n| *n == "tcp-read-start" || *n == "tcp-read-stop")
        .collect();
    assert_eq!(
        signals,
        vec!["tcp-read-start", "tcp-read-stop", "tcp-read-start"]
    );
}

// ---------------------------------------------------------------------------
// Teardown settles pending requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroy_settles_in_flight_requests_with_cancellation() {
    let (bridge, _fake) = FakeNative::spawn_with(Box::new(|method| match method {
        Method::TcpSend { .. } => Scripted::Silent,
        _ => Scripted::Default,
    }));
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    let writer = {
        let socket = socket.clone();
        tokio::spawn(async move { socket.write(b"never acknowledged".to_vec()).await })
    };
    settle().await;

    socket.destroy().await;

    let outcome = writer.await.unwrap();
    assert_eq!(outcome, Err(NetError::Bridge(BridgeError::Cancelled)));
}

#[tokio::test]
async fn bridge_close_fails_pending_requests_fast() {
    let (bridge, _fake) = FakeNative::spawn_with(Box::new(|method| match method {
        Method::PlatformInfo => Scripted::Silent,
        _ => Scripted::Default,
    }));

    let waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.submit(Method::PlatformInfo).await })
    };
    settle().await;

    bridge.close();

    let outcome = waiter.await.unwrap();
    assert_eq!(outcome, Err(BridgeError::Closed));
}

// ---------------------------------------------------------------------------
// Router drops events for unknown handles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_for_unknown_handles_are_dropped_silently() {
    let (bridge, fake) = FakeNative::spawn();

    fake.inject(
        skein_wire::HandleId(0x5EED),
        Event::Data { bytes: vec![1, 2] },
    );
    settle().await;

    // The bridge is still healthy.
    let os = skein_os::Os::new(bridge);
    assert_eq!(os.platform().await.unwrap(), "linux");
}

// ---------------------------------------------------------------------------
// Server close waits for the last child
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_close_event_waits_for_children_to_drain() {
    let (bridge, fake) = FakeNative::spawn();
    let server = Server::new(bridge);
    server.listen(ListenConfig::default()).await.unwrap();

    let children = Arc::new(Mutex::new(Vec::new()));
    let (closes, close_count) = counter();
    {
        let children = Arc::clone(&children);
        server.subscribe(move |e| match e {
            ServerEvent::Connection(socket) => children.lock().push(socket.clone()),
            ServerEvent::Close => {
                closes.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
    }

    fake.inject(
        server.id(),
        Event::Connection {
            handle: 333,
            port: 7001,
            address: "10.0.0.3".into(),
            family: skein_wire::IpFamily::V4,
        },
    );
    eventually(|| !children.lock().is_empty()).await;

    // Listener released while the child is still open: no Close yet.
    server.close().await.unwrap();
    settle().await;
    assert_eq!(close_count(), 0);

    let child = children.lock()[0].clone();
    child.destroy().await;
    eventually(|| close_count() == 1).await;

    // Idempotent from here on.
    server.close().await.unwrap();
    settle().await;
    assert_eq!(close_count(), 1);
}

// ---------------------------------------------------------------------------
// File conveniences
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_file_concatenates_chunks_and_closes() {
    let reads = Arc::new(AtomicUsize::new(0));
    let script_reads = Arc::clone(&reads);
    let (bridge, fake) = FakeNative::spawn_with(Box::new(move |method| match method {
        Method::FsRead { .. } => {
            if script_reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Scripted::Reply(skein_wire::Reply::Read {
                    data: b"abc".to_vec(),
                    eof: false,
                })
            } else {
                Scripted::Reply(skein_wire::Reply::Read {
                    data: b"def".to_vec(),
                    eof: true,
                })
            }
        }
        _ => Scripted::Default,
    }));

    let contents = skein_fs::read_file(&bridge, "/etc/config").await.unwrap();
    assert_eq!(contents, b"abcdef");

    let names: Vec<&str> = fake.requests().iter().map(Method::name).collect();
    assert_eq!(
        names,
        vec!["fs-open", "fs-read", "fs-read", "fs-close"]
    );
}

#[tokio::test]
async fn stat_surfaces_native_metadata() {
    let (bridge, _fake) = FakeNative::spawn_with(Box::new(|method| match method {
        Method::FsStat { .. } => Scripted::Reply(skein_wire::Reply::Stat {
            size: 1234,
            mode: 0o600,
            modified_ms: 1700000000000,
            accessed_ms: 1700000000001,
            created_ms: 1600000000000,
        }),
        _ => Scripted::Default,
    }));

    let file = FileHandle::open(bridge, "/var/log/app", "r", 0o666)
        .await
        .unwrap();
    let stat = file.stat().await.unwrap();
    assert_eq!(stat.size, 1234);
    assert_eq!(stat.mode, 0o600);
    file.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Idle timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_timeout_fires_only_after_activity_stops() {
    let (bridge, fake) = FakeNative::spawn();
    let socket = connected_socket(&bridge, SocketConfig::default()).await;

    let (timeouts, timeout_count) = counter();
    socket.subscribe(move |e| {
        if matches!(e, SocketEvent::Timeout) {
            timeouts.fetch_add(1, Ordering::SeqCst);
        }
    });

    socket.set_timeout(Some(std::time::Duration::from_millis(200)));

    // Activity inside the first window suppresses the first firing.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    socket.write(b"keepalive".to_vec()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(timeout_count(), 0);

    // Idle long enough and it fires.
    eventually(|| timeout_count() >= 1).await;
    drop(fake);
}
