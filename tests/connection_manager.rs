//! End-to-end scenarios over a shared in-memory DHT and loopback ICE:
//! connection negotiation, channel gating, simultaneous opens, liveness.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test connection_manager -- --nocapture

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use common::{fast_timeouts, init_tracing, spawn_node, TestEnv, TestNode};
use dhtlink::{ChannelSocket, ConnectOptions, ConnectionError, SocketTuning};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Surface every accepted inbound channel of `node` on a queue.
fn collect_ready_channels(node: &TestNode) -> mpsc::UnboundedReceiver<ChannelSocket> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.manager.on_connection_ready(move |_, _, channel| {
        let _ = tx.send(channel);
    });
    rx
}

/// Drain a channel until `len` bytes arrived or the channel closed.
async fn read_exact(channel: &ChannelSocket, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];
    while out.len() < len {
        let n = channel.read(&mut buf).await.expect("read");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[tokio::test]
async fn happy_path_opens_channel_and_moves_bytes() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    let requested = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    {
        let requested = requested.clone();
        b.manager.on_channel_request(move |_, name| {
            requested.lock().expect("names lock").push(name.to_string());
            true
        });
    }
    let mut b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("connect within deadline")
    .expect("connect succeeds");

    let sb = timeout(CONNECT_DEADLINE, b_channels.recv())
        .await
        .expect("ready callback within deadline")
        .expect("channel surfaced");

    assert_eq!(sa.name(), "git");
    assert_eq!(sb.name(), "git");
    assert_eq!(sa.peer(), b.device);
    assert_eq!(sb.peer(), a.device);
    assert_eq!(
        *requested.lock().expect("names lock"),
        vec!["git".to_string()]
    );

    sa.write(&[0x01, 0x02, 0x03]).await.expect("write");
    assert_eq!(read_exact(&sb, 3).await, vec![0x01, 0x02, 0x03]);

    // Both registries converged on one socket.
    assert_eq!(a.manager.active_sockets(), 1);
    assert_eq!(b.manager.active_sockets(), 1);
}

#[tokio::test]
async fn ice_request_rejection_times_out_initiator() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    b.manager.on_ice_request(|_| false);

    let err = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("connect resolves within deadline")
    .unwrap_err();
    assert_eq!(err, ConnectionError::NegotiationTimeout);
    assert_eq!(b.manager.active_sockets(), 0);
}

#[tokio::test]
async fn channel_request_rejection_keeps_prior_channels_usable() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    b.manager.on_channel_request(|_, name| name != "secret");
    let mut b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("first channel accepted");
    let sb = b_channels.recv().await.expect("surfaced");

    let err = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "secret"),
    )
    .await
    .expect("deadline")
    .unwrap_err();
    assert_eq!(err, ConnectionError::PeerDeclined);

    // The rejected open reused the socket and left it intact.
    assert_eq!(a.manager.active_sockets(), 1);
    sa.write(b"still alive").await.expect("write");
    assert_eq!(read_exact(&sb, 11).await, b"still alive".to_vec());
}

#[tokio::test]
async fn simultaneous_connect_converges_to_one_socket() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    let mut a_channels = collect_ready_channels(&a);
    let mut b_channels = collect_ready_channels(&b);

    let a_mgr = a.manager.clone();
    let b_mgr = b.manager.clone();
    let (a_dev, b_dev) = (a.device, b.device);

    let from_a = tokio::spawn(async move { a_mgr.connect_device(b_dev, "sync").await });
    let from_b = tokio::spawn(async move { b_mgr.connect_device(a_dev, "sync").await });

    let ca = timeout(CONNECT_DEADLINE, from_a)
        .await
        .expect("deadline")
        .expect("join")
        .expect("a connects");
    let cb = timeout(CONNECT_DEADLINE, from_b)
        .await
        .expect("deadline")
        .expect("join")
        .expect("b connects");

    // One "sync" channel surfaced on each side through the ready callback.
    let _ = timeout(CONNECT_DEADLINE, async {
        tokio::select! {
            c = a_channels.recv() => c,
            c = b_channels.recv() => c,
        }
    })
    .await
    .expect("one inbound channel surfaced");

    // Exactly one transport exists in both registries after settling.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.manager.active_sockets(), 1);
    assert_eq!(b.manager.active_sockets(), 1);

    // Both returned channels are live.
    ca.write(b"ping").await.expect("a write");
    cb.write(b"pong").await.expect("b write");
}

#[tokio::test]
async fn no_new_socket_fails_fast_without_transport() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    let before = std::time::Instant::now();
    let err = a
        .manager
        .connect_device_with(
            b.device,
            "x",
            ConnectOptions {
                no_new_socket: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::NoExistingSocket);
    assert!(before.elapsed() < Duration::from_secs(1), "must fail fast");
}

#[tokio::test]
async fn beacon_detects_frozen_peer() {
    init_tracing();
    let env = TestEnv::default();
    let tuning = SocketTuning {
        beacon_interval: Duration::from_millis(300),
        beacon_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let a = spawn_node(&env, fast_timeouts(), tuning);
    let b = spawn_node(&env, fast_timeouts(), tuning);
    let mut b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "live"),
    )
    .await
    .expect("deadline")
    .expect("connect");
    let _sb = b_channels.recv().await.expect("surfaced");

    let (down_tx, down_rx) = oneshot::channel();
    sa.set_on_shutdown(move || {
        let _ = down_tx.send(());
    });

    // Freeze B's transport I/O; beacons stop being acknowledged.
    b.freeze.store(true, Ordering::SeqCst);

    // Death within two beacon intervals (plus scheduling slack).
    timeout(Duration::from_secs(2), down_rx)
        .await
        .expect("socket declared dead in time")
        .expect("shutdown hook");
    assert!(sa.is_closed());
    assert_eq!(a.manager.active_sockets(), 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_negotiation() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let _b_channels = collect_ready_channels(&b);

    let mgr = a.manager.clone();
    let dev = b.device;
    let git = tokio::spawn(async move { mgr.connect_device(dev, "git").await });
    let mgr = a.manager.clone();
    let doc = tokio::spawn(async move { mgr.connect_device(dev, "doc").await });

    let git = timeout(CONNECT_DEADLINE, git)
        .await
        .expect("deadline")
        .expect("join")
        .expect("git channel");
    let doc = timeout(CONNECT_DEADLINE, doc)
        .await
        .expect("deadline")
        .expect("join")
        .expect("doc channel");

    assert_eq!(git.name(), "git");
    assert_eq!(doc.name(), "doc");
    // Both rode the same negotiated transport.
    assert_eq!(a.manager.active_sockets(), 1);
}

#[tokio::test]
async fn forced_socket_negotiates_in_parallel() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let _b_channels = collect_ready_channels(&b);

    let first = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("first connect");

    let second = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device_with(
            b.device,
            "git",
            ConnectOptions {
                force_new_socket: true,
                ..Default::default()
            },
        ),
    )
    .await
    .expect("deadline")
    .expect("forced connect");

    assert!(!first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(
        a.manager.active_sockets(),
        2,
        "forced connect must negotiate a second transport"
    );
}

#[tokio::test]
async fn is_connecting_tracks_pending_opens() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    // The peer never answers, keeping the negotiation pending.
    b.manager.on_ice_request(|_| false);

    let mgr = a.manager.clone();
    let dev = b.device;
    let pending = tokio::spawn(async move { mgr.connect_device(dev, "git").await });

    // Give the request time to reach the async worker.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.manager.is_connecting(&b.device, "git"));
    assert!(!a.manager.is_connecting(&b.device, "other"));

    let err = timeout(CONNECT_DEADLINE, pending)
        .await
        .expect("deadline")
        .expect("join")
        .unwrap_err();
    assert_eq!(err, ConnectionError::NegotiationTimeout);
    assert!(!a.manager.is_connecting(&b.device, "git"));
}

#[tokio::test]
async fn close_connections_with_tears_down_peer_state() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let _b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("connect");
    assert_eq!(a.manager.active_sockets(), 1);

    a.manager.close_connections_with(&b.device.to_hex()).await;

    assert_eq!(a.manager.active_sockets(), 0);
    assert!(sa.is_closed());
    let err = sa.write(b"x").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn close_is_synchronous_for_both_sides() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let mut b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("connect");
    let sb = b_channels.recv().await.expect("surfaced");

    sa.write(b"last words").await.expect("write");
    sa.close().await;

    // The peer drains buffered bytes, then sees EOF; no bytes follow the
    // close notification.
    assert_eq!(read_exact(&sb, 10).await, b"last words".to_vec());
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), sb.read(&mut buf))
        .await
        .expect("close propagated")
        .expect("read");
    assert_eq!(n, 0);

    // Writing after close fails locally.
    assert!(sa.write(b"more").await.is_err());
}

#[tokio::test]
async fn large_transfer_preserves_order_across_frames() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let mut b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "bulk"),
    )
    .await
    .expect("deadline")
    .expect("connect");
    let sb = b_channels.recv().await.expect("surfaced");

    // Spans multiple frames and crosses the read high-water mark, so the
    // demultiplexer pause/resume path runs.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        sa.write(&payload).await.expect("bulk write");
        sa
    });

    let received = timeout(Duration::from_secs(10), read_exact(&sb, expected.len()))
        .await
        .expect("bulk read deadline");
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);

    let sa = writer.await.expect("writer join");
    assert!(!sa.is_closed());
}

#[tokio::test]
async fn connect_by_certificate_skips_dht_resolution() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let mut b_channels = collect_ready_channels(&b);

    // Hand the certificate over directly, as an application holding a
    // pinned cert would.
    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.cert.clone(), "git"),
    )
    .await
    .expect("deadline")
    .expect("connect by certificate");
    let sb = b_channels.recv().await.expect("surfaced");

    assert_eq!(sa.peer(), b.device);
    sa.write(b"hi").await.expect("write");
    assert_eq!(read_exact(&sb, 2).await, b"hi".to_vec());
}

#[tokio::test]
async fn unknown_peer_fails_certificate_resolution() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    // A fingerprint nobody published a certificate for.
    let ghost = dhtlink::DeviceKeypair::generate().device_id();
    let err = timeout(CONNECT_DEADLINE, a.manager.connect_device(ghost, "git"))
        .await
        .expect("deadline")
        .unwrap_err();
    assert_eq!(err, ConnectionError::UnknownPeer);
}

#[tokio::test]
async fn shutdown_fails_pending_and_future_connects() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    // Keep a negotiation pending through shutdown.
    b.manager.on_ice_request(|_| false);
    let mgr = a.manager.clone();
    let dev = b.device;
    let pending = tokio::spawn(async move { mgr.connect_device(dev, "git").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.manager.shutdown().await;

    let err = timeout(CONNECT_DEADLINE, pending)
        .await
        .expect("deadline")
        .expect("join")
        .unwrap_err();
    assert_eq!(err, ConnectionError::Shutdown);

    let err = a.manager.connect_device(b.device, "git").await.unwrap_err();
    assert_eq!(err, ConnectionError::Shutdown);
    assert_eq!(a.manager.active_sockets(), 0);
}

#[tokio::test]
async fn default_callbacks_accept_and_drop_unclaimed_channels() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());

    // B installs no callbacks at all: opens are accepted by default, but
    // nobody claims the surfaced channel, so it closes again.
    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("default-accept connect succeeds");

    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(3), sa.read(&mut buf))
        .await
        .expect("unclaimed channel closes back")
        .expect("read");
    assert_eq!(n, 0, "channel should close once the peer drops it");
}

#[tokio::test]
async fn connectivity_change_keeps_healthy_sockets() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let _b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("connect");

    a.manager.connectivity_changed().await;
    assert_eq!(a.manager.active_sockets(), 1, "healthy socket survives");
    assert!(!sa.is_closed());
}

#[tokio::test]
async fn connectivity_change_reaps_frozen_sockets() {
    init_tracing();
    let env = TestEnv::default();
    let tuning = SocketTuning {
        beacon_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let a = spawn_node(&env, fast_timeouts(), tuning);
    let b = spawn_node(&env, fast_timeouts(), tuning);
    let _b_channels = collect_ready_channels(&b);

    let sa = timeout(
        CONNECT_DEADLINE,
        a.manager.connect_device(b.device, "git"),
    )
    .await
    .expect("deadline")
    .expect("connect");

    b.freeze.store(true, Ordering::SeqCst);
    a.manager.connectivity_changed().await;

    assert_eq!(a.manager.active_sockets(), 0, "frozen socket reaped");
    assert!(sa.is_closed());
}

#[tokio::test]
async fn callback_fires_exactly_once_per_connect() {
    init_tracing();
    let env = TestEnv::default();
    let a = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let b = spawn_node(&env, fast_timeouts(), SocketTuning::default());
    let _b_channels = collect_ready_channels(&b);

    let resolved = Arc::new(AtomicUsize::new(0));
    let mut joins = Vec::new();
    for i in 0..4 {
        let mgr = a.manager.clone();
        let dev = b.device;
        let resolved = resolved.clone();
        joins.push(tokio::spawn(async move {
            let result = mgr.connect_device(dev, &format!("ch-{i}")).await;
            resolved.fetch_add(1, Ordering::SeqCst);
            result.is_ok()
        }));
    }
    for join in joins {
        assert!(timeout(CONNECT_DEADLINE, join)
            .await
            .expect("deadline")
            .expect("join"));
    }
    assert_eq!(resolved.load(Ordering::SeqCst), 4);
    assert_eq!(a.manager.active_sockets(), 1);
}
