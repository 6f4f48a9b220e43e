
use std::time::Duration;

use harness::{assert_quiet, read_exactly, FakeUpstream, MuxHandle, WAIT};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[tokio::test]
async fn late_joiner_sees_only_new_output() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    upstream.send(b"Welcome\n");
    assert_eq!(read_exactly(&mut a, 8).await, b"Welcome\n");

    let mut b = mux.connect_client(2).await;
    upstream.send(b"Room update\n");
    assert_eq!(read_exactly(&mut a, 12).await, b"Room update\n");
    assert_eq!(read_exactly(&mut b, 12).await, b"Room update\n");

    // No duplicate or stray delivery to either client.
    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;

    mux.signal_and_join().await.unwrap();
}

#[tokio::test]
async fn client_input_reaches_upstream_verbatim() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    a.write_all(b"look\n").await.unwrap();
    assert_eq!(upstream.wait_received(5).await, b"look\n");

    a.write_all(b"north\n").await.unwrap();
    a.write_all(b"get lamp\n").await.unwrap();
    assert_eq!(
        upstream.wait_received(20).await,
        b"look\nnorth\nget lamp\n"
    );

    assert_eq!(mux.supervisor.stats().bytes_to_upstream, 20);
    mux.signal_and_join().await.unwrap();
}

#[tokio::test]
async fn per_client_order_is_preserved_upstream() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    let mut b = mux.connect_client(2).await;

    let writer_a = tokio::spawn(async move {
        for i in 0..20 {
            a.write_all(format!("A{i:02}\n").as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        a
    });
    let writer_b = tokio::spawn(async move {
        for i in 0..20 {
            b.write_all(format!("B{i:02}\n").as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        b
    });
    let _a = writer_a.await.unwrap();
    let _b = writer_b.await.unwrap();

    let received = upstream.wait_received(40 * 4).await;
    let text = String::from_utf8(received).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 40);

    for prefix in ["A", "B"] {
        let own: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|l| l.starts_with(prefix))
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("{prefix}{i:02}")).collect();
        assert_eq!(own, expected);
    }

    mux.signal_and_join().await.unwrap();
}

#[tokio::test]
async fn upstream_output_order_is_preserved_per_client() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    let mut b = mux.connect_client(2).await;

    let mut expected = Vec::new();
    for i in 0..50 {
        let line = format!("tick {i:03}\n");
        upstream.send(line.as_bytes());
        expected.extend_from_slice(line.as_bytes());
    }

    assert_eq!(read_exactly(&mut a, expected.len()).await, expected);
    assert_eq!(read_exactly(&mut b, expected.len()).await, expected);

    mux.signal_and_join().await.unwrap();
}

#[tokio::test]
async fn departed_client_is_deregistered_and_others_keep_receiving() {
    let upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    let b = mux.connect_client(2).await;
    let mut d = mux.connect_client(3).await;

    drop(b);
    mux.wait_for_clients(2).await;

    upstream.send(b"You hear a bell.\n");
    assert_eq!(read_exactly(&mut a, 17).await, b"You hear a bell.\n");
    assert_eq!(read_exactly(&mut d, 17).await, b"You hear a bell.\n");

    let stats = mux.supervisor.stats();
    assert_eq!(stats.clients_accepted, 3);
    assert_eq!(stats.clients_active, 2);
    assert_eq!(stats.clients_closed, 1);

    mux.signal_and_join().await.unwrap();
}

#[tokio::test]
async fn dead_upstream_leaves_clients_connected() {
    let mut upstream = FakeUpstream::spawn().await.unwrap();
    let mux = MuxHandle::spawn(upstream.addr).await.unwrap();

    let mut a = mux.connect_client(1).await;
    upstream.send(b"bye\n");
    assert_eq!(read_exactly(&mut a, 4).await, b"bye\n");

    upstream.hang_up();
    timeout(WAIT, async {
        while !mux.supervisor.stats().relay_ended {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay should stop after upstream EOF");

    // The existing client is not closed and new clients are still accepted.
    assert_quiet(&mut a).await;
    let _b = mux.connect_client(2).await;
    assert!(!mux.supervisor.upstream().is_closed());

    mux.signal_and_join().await.unwrap();
}
