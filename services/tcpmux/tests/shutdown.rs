
use std::time::Duration;

use harness::{read_exactly, read_to_eof, FakeUpstream, MuxHandle};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[tokio::test]
async fn shutdown_closes_clients_then_upstream() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    let mut b = mux.connect_client(2).await;
    upstream.send(b"Welcome\n");
    assert_eq!(read_exactly(&mut a, 8).await, b"Welcome\n");
    assert_eq!(read_exactly(&mut b, 8).await, b"Welcome\n");

    let supervisor = std::sync::Arc::clone(&mux.supervisor);
    mux.signal_and_join().await.unwrap();

    assert!(read_to_eof(&mut a).await.is_empty());
    assert!(read_to_eof(&mut b).await.is_empty());
    upstream.wait_disconnected().await;

    assert!(supervisor.registry().is_empty().await);
    assert!(supervisor.upstream().is_closed());
    let stats = supervisor.stats();
    assert_eq!(stats.clients_active, 0);
    assert_eq!(stats.clients_closed, 2);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();
    let mut a = mux.connect_client(1).await;

    assert!(mux.supervisor.shutdown().await);
    assert!(!mux.supervisor.shutdown().await);

    // The accept loop notices the shutdown on its own; a duplicate signal is harmless.
    let supervisor = std::sync::Arc::clone(&mux.supervisor);
    mux.signal_and_join().await.unwrap();
    assert!(!supervisor.shutdown().await);

    assert!(read_to_eof(&mut a).await.is_empty());
    assert!(supervisor.registry().is_empty().await);
    assert!(supervisor.upstream().is_closed());
}

#[tokio::test]
async fn in_flight_input_after_shutdown_fails_cleanly() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();
    let mut a = mux.connect_client(1).await;

    let supervisor = std::sync::Arc::clone(&mux.supervisor);
    supervisor.shutdown().await;

    // Writes may succeed locally or fail with a reset; neither may panic the mux.
    let _ = a.write_all(b"look\n").await;
    assert!(matches!(
        supervisor.upstream().write(b"look\n").await,
        Err(tcpmux::MuxError::LinkClosed)
    ));

    mux.signal_and_join().await.unwrap();
    assert!(supervisor.registry().is_empty().await);
}

#[tokio::test]
async fn shutdown_completes_while_a_client_stalls() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    // Connected but never read, so the kernel buffers fill and the
    // broadcast write to this client parks.
    let _stalled = mux.connect_client(1).await;
    let chunk = vec![b'#'; 64 * 1024];
    for _ in 0..512 {
        upstream.send(&chunk);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let supervisor = std::sync::Arc::clone(&mux.supervisor);
    let finished = timeout(Duration::from_secs(3), supervisor.shutdown()).await;
    assert!(matches!(finished, Ok(true)), "shutdown waited on a stalled client");

    mux.signal_and_join().await.unwrap();
    assert!(supervisor.registry().is_empty().await);
    assert!(supervisor.upstream().is_closed());
}
