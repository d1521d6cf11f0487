//! Pool lifecycle: bulk open, replacement after remote close, shutdown,
//! and error-driven reconnection.

mod common;

use common::{CaptureBackend, FakeRemote};
use passage_client::{Tunnel, TunnelConfig, TunnelEvent};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

fn config(remote_port: u16, local_port: u16, max_connections: usize) -> TunnelConfig {
    TunnelConfig::builder()
        .local_address("localhost")
        .local_port(local_port)
        .remote_address("127.0.0.1")
        .remote_port(remote_port)
        .max_connections(max_connections)
        .private_key([1u8; 32])
        // Keep the heartbeat far away from the assertions below.
        .auto_reconnect_interval(Duration::from_secs(30))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_open_fills_pool_and_remote_close_is_replaced() {
    let mut remote = FakeRemote::spawn().await;
    let backend = CaptureBackend::spawn(false).await;

    let tunnel = Tunnel::new(config(remote.port, backend.port, 4)).unwrap();
    tunnel.open(None).await.unwrap();

    assert_eq!(tunnel.pool_size().await, 4);
    assert_eq!(remote.authenticated.load(Ordering::SeqCst), 4);

    // Server-side close of one pooled connection triggers exactly one
    // replacement dial, restoring steady-state size.
    let session = remote.sessions.recv().await.unwrap();
    drop(session);

    remote.wait_for_authenticated(5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tunnel.pool_size().await, 4);
    assert_eq!(remote.authenticated.load(Ordering::SeqCst), 5);

    tunnel.close().await;
}

#[tokio::test]
async fn test_open_emits_open_and_connected_events() {
    let remote = FakeRemote::spawn().await;
    let backend = CaptureBackend::spawn(false).await;

    let tunnel = Tunnel::new(config(remote.port, backend.port, 1)).unwrap();
    let mut events = tunnel.subscribe();
    tunnel.open(None).await.unwrap();

    let first = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert!(matches!(first, Ok(TunnelEvent::Open(_))));
    assert!(matches!(second, Ok(TunnelEvent::Connected(_))));

    tunnel.close().await;
}

#[tokio::test]
async fn test_close_drains_pool_and_stops_replacements() {
    let mut remote = FakeRemote::spawn().await;
    let backend = CaptureBackend::spawn(false).await;

    let tunnel = Tunnel::new(config(remote.port, backend.port, 3)).unwrap();
    tunnel.open(None).await.unwrap();
    assert_eq!(tunnel.pool_size().await, 3);

    let mut events = tunnel.subscribe();
    tunnel.close().await;
    assert_eq!(tunnel.pool_size().await, 0);
    assert!(matches!(events.recv().await, Ok(TunnelEvent::Closed)));

    // The torn-down connections must not spawn replacements.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.authenticated.load(Ordering::SeqCst), 3);
    assert_eq!(tunnel.pool_size().await, 0);

    // The sessions the server held are now dead.
    while let Ok(mut session) = remote.sessions.try_recv() {
        use tokio::io::AsyncReadExt;
        let n = timeout(Duration::from_secs(1), session.read(&mut [0u8; 16]))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn test_refused_remote_emits_disconnected_and_retries() {
    // Bind then drop to get a port that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = TunnelConfig::builder()
        .local_address("localhost")
        .local_port(3000)
        .remote_address("127.0.0.1")
        .remote_port(dead_port)
        .max_connections(2)
        .private_key([1u8; 32])
        .auto_reconnect_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let tunnel = Tunnel::new(config).unwrap();
    let mut events = tunnel.subscribe();

    assert!(tunnel.open(None).await.is_err());
    assert_eq!(tunnel.pool_size().await, 0);

    // Every refused dial surfaces a disconnected event with the fixed
    // message; the timer then drives further rounds at ~50ms spacing.
    let mut disconnected = 0;
    while disconnected < 3 {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(TunnelEvent::Disconnected(message))) => {
                assert_eq!(message, "Tunnel connection refused");
                disconnected += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("event stream ended: {}", e),
            Err(_) => panic!("no reconnection round within 2s"),
        }
    }

    tunnel.close().await;
}

#[tokio::test]
async fn test_reconnect_stops_after_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = TunnelConfig::builder()
        .local_address("localhost")
        .local_port(3000)
        .remote_address("127.0.0.1")
        .remote_port(dead_port)
        .max_connections(1)
        .private_key([1u8; 32])
        .auto_reconnect_interval(Duration::from_millis(30))
        .build()
        .unwrap();

    let tunnel = Tunnel::new(config).unwrap();
    assert!(tunnel.open(None).await.is_err());

    tunnel.close().await;

    // With the timer cancelled, no further dial rounds surface events.
    let mut events = tunnel.subscribe();
    let quiet = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(quiet.is_err(), "unexpected event after close: {:?}", quiet);
}
