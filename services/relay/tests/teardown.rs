
use std::time::Duration;

use harness::{
    dead_port, eventually, roundtrip, session_config, ClosingBackend, HoldingBackend,
    RecordingBackend, RelayHandle, TcpEchoBackend,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn short_timeout(millis: u64) -> tlsfrag_relay::SessionConfig {
    let mut config = session_config(16, Duration::ZERO);
    config.socket_timeout = Duration::from_millis(millis);
    config
}

#[tokio::test]
async fn idle_client_hits_session_deadline() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[backend.addr], short_timeout(300))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(3), client.read_to_end(&mut buf))
        .await
        .expect("relay kept the idle session open")
        .unwrap_or(0);
    assert_eq!(n, 0);

    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    timeout(Duration::from_secs(2), async {
        while backend.closed_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backend connection was left open");

    let received = roundtrip(&relay, b"still serving").await.unwrap();
    assert_eq!(received, b"still serving");
}

#[tokio::test]
async fn silent_backend_hits_session_deadline() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[backend.addr], short_timeout(300))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"anyone there?").await.unwrap();

    let mut buf = Vec::new();
    timeout(Duration::from_secs(3), client.read_to_end(&mut buf))
        .await
        .expect("relay kept the session open past its deadline")
        .ok();
    assert!(buf.is_empty());

    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(backend.reads().await.concat(), b"anyone there?");
}

#[tokio::test]
async fn client_half_close_closes_whole_session() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[backend.addr], short_timeout(4_000))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"hello").await.unwrap();
    client.shutdown().await.unwrap();

    // The backend never answers, so only teardown can end the client's read.
    let mut buf = Vec::new();
    timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
        .await
        .expect("client side stayed open after its own half-close")
        .unwrap();
    assert!(buf.is_empty());

    assert!(relay.wait_idle(Duration::from_secs(1)).await);
    assert!(eventually(Duration::from_secs(1), || backend.closed_count() == 1).await);
    assert_eq!(backend.reads().await.concat(), b"hello");
}

#[tokio::test]
async fn client_reset_closes_silent_backend() {
    let backend = HoldingBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[backend.addr], short_timeout(4_000))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Zero linger turns the close into a reset.
    #[allow(deprecated)]
    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);

    assert!(
        relay.wait_idle(Duration::from_secs(1)).await,
        "session outlived the client reset"
    );
    assert!(eventually(Duration::from_secs(1), || backend.ended_count() == 1).await);
}

#[tokio::test]
async fn backend_close_closes_client() {
    let backend = ClosingBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[backend.addr], short_timeout(4_000))
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client.write_all(b"hello").await.unwrap();

    // The client never closes its own side.
    let mut buf = Vec::new();
    timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
        .await
        .expect("client stayed open after the backend closed")
        .ok();
    assert!(buf.is_empty());

    assert!(relay.wait_idle(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn dial_failure_closes_client_and_loop_survives() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let dead = format!("127.0.0.1:{}", dead_port().await).parse().unwrap();
    let relay = RelayHandle::spawn(&[dead, backend.addr], session_config(16, Duration::ZERO))
        .await
        .unwrap();

    // First connection rotates onto the dead backend.
    let mut client = relay.connect().await.unwrap();
    let mut buf = Vec::new();
    let closed = timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
    assert!(closed.is_ok(), "client was not closed after the dial failed");
    assert!(buf.is_empty());

    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(relay.stat(|s| &s.backend_failed), 1);

    // Second one lands on the live backend.
    let received = roundtrip(&relay, b"after failure").await.unwrap();
    assert_eq!(received, b"after failure");
    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(relay.stat(|s| &s.backend_connected), 1);
}

#[tokio::test]
async fn connections_rotate_across_backends() {
    let first = TcpEchoBackend::spawn().await.unwrap();
    let second = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayHandle::spawn(&[first.addr, second.addr], session_config(16, Duration::ZERO))
        .await
        .unwrap();

    let mut order = Vec::new();
    for i in 0..4 {
        let before = (first.connection_count(), second.connection_count());
        let payload = format!("conn {i}");
        let received = roundtrip(&relay, payload.as_bytes()).await.unwrap();
        assert_eq!(received, payload.as_bytes());

        let after = (first.connection_count(), second.connection_count());
        order.push(if after.0 > before.0 { "first" } else { "second" });
    }

    assert_eq!(order, ["first", "second", "first", "second"]);
    assert_eq!(relay.stat(|s| &s.connections_accepted), 4);
}
