
use std::time::Duration;

use harness::{
    eventually, free_port, handshake, ProxyHandle, ShieldDb, TcpEchoBackend, LOCALHOST,
};
use shield_wire::NextState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Send `handshake` followed by `payload` and collect the echo of both.
async fn echo_through(stream: TcpStream, handshake: Vec<u8>, payload: Vec<u8>) -> Vec<u8> {
    let expected_len = handshake.len() + payload.len();
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        writer.write_all(&handshake).await.unwrap();
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected_len];
    timeout(IO_TIMEOUT, reader.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();

    drop(writer_task.await.unwrap());
    received
}

#[tokio::test]
async fn payloads_relay_byte_for_byte() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let db = ShieldDb::new();
    let port = free_port();
    db.add_server(port, backend.addr);
    let proxy = ProxyHandle::spawn(&db).await;

    for size in [1usize, 100, 8191, 8192, 8193, 65_536, 262_144] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();
        let hello = handshake("play.example.com", 25565, NextState::Login);

        let stream = TcpStream::connect(proxy.addr(port)).await.unwrap();
        let received = echo_through(stream, hello.clone(), payload.clone()).await;

        assert_eq!(&received[..hello.len()], &hello[..], "size {size}");
        assert!(received[hello.len()..] == payload[..], "payload mismatch at size {size}");
    }

    assert_eq!(backend.connection_count(), 7);
}

#[tokio::test]
async fn handshake_split_across_writes_is_forwarded_once_complete() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let db = ShieldDb::new();
    let port = free_port();
    db.add_server(port, backend.addr);
    let proxy = ProxyHandle::spawn(&db).await;

    let hello = handshake("play.example.com", 25565, NextState::Login);
    let mut stream = TcpStream::connect(proxy.addr(port)).await.unwrap();

    stream.write_all(&hello[..2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    stream.write_all(&hello[2..7]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Backend connected, but nothing forwarded yet.
    assert!(eventually(|| backend.connection_count() == 1).await);
    assert_eq!(backend.bytes_received(), 0);

    stream.write_all(&hello[7..]).await.unwrap();

    let mut echoed = vec![0u8; hello.len()];
    timeout(IO_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, hello);
    assert_eq!(backend.bytes_received(), hello.len() as u64);
}

#[tokio::test]
async fn bytes_after_handshake_in_same_write_are_kept_in_order() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let db = ShieldDb::new();
    let port = free_port();
    db.add_server(port, backend.addr);
    let proxy = ProxyHandle::spawn(&db).await;

    let mut first_write = handshake("mc.example.net", 25565, NextState::Status);
    // Status request frame.
    first_write.extend_from_slice(&[0x01, 0x00]);

    let mut stream = TcpStream::connect(proxy.addr(port)).await.unwrap();
    stream.write_all(&first_write).await.unwrap();

    let mut echoed = vec![0u8; first_write.len()];
    timeout(IO_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, first_write);
}

#[tokio::test]
async fn client_close_ends_connection_and_counts_bytes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let db = ShieldDb::new();
    let port = free_port();
    db.add_server(port, backend.addr);
    let proxy = ProxyHandle::spawn(&db).await;

    let hello = handshake("play.example.com", 25565, NextState::Login);
    let stream = TcpStream::connect(proxy.addr(port)).await.unwrap();
    let received = echo_through(stream, hello.clone(), b"ping".to_vec()).await;
    assert_eq!(received.len(), hello.len() + 4);

    let total = (hello.len() + 4) as u64;
    assert!(eventually(|| proxy.stats().connections_closed == 1).await);

    let stats = proxy.stats();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.connections_active, 0);
    assert_eq!(stats.bytes_to_backend, total);
    assert_eq!(stats.bytes_from_backend, total);
}

#[tokio::test]
async fn established_connection_survives_server_removal() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let db = ShieldDb::new();
    let port = free_port();
    let id = db.add_server(port, backend.addr);
    let proxy = ProxyHandle::spawn(&db).await;

    let hello = handshake("play.example.com", 25565, NextState::Login);
    let mut stream = TcpStream::connect(proxy.addr(port)).await.unwrap();
    stream.write_all(&hello).await.unwrap();
    let mut echoed = vec![0u8; hello.len()];
    stream.read_exact(&mut echoed).await.unwrap();

    db.set_server_status(id, "inactive");
    let report = proxy.refresh().await;
    assert_eq!(report.closed, vec![port]);

    // The open connection still relays.
    stream.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");

    // New connections are no longer accepted.
    let mut refused = false;
    for _ in 0..100 {
        if TcpStream::connect(proxy.addr(port)).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused, "listener should stop accepting after removal");
}

#[tokio::test]
async fn backend_first_frame_is_held_until_classified() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let backend_addr = listener.local_addr().unwrap();

    let (prefix_sent_tx, prefix_sent_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (received_tx, received_rx) = oneshot::channel();
    let hello = handshake("play.example.com", 25565, NextState::Status);
    let hello_len = hello.len();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Length prefix alone: the frame cannot be classified yet.
        stream.write_all(&[0x03]).await.unwrap();
        let _ = prefix_sent_tx.send(());

        release_rx.await.unwrap();
        stream.write_all(&[0x02, 0xaa, 0xbb]).await.unwrap();

        let mut forwarded = vec![0u8; hello_len];
        stream.read_exact(&mut forwarded).await.unwrap();
        let _ = received_tx.send(forwarded);
    });

    let db = ShieldDb::new();
    let port = free_port();
    db.add_server(port, backend_addr);
    let proxy = ProxyHandle::spawn(&db).await;

    let mut stream = TcpStream::connect(proxy.addr(port)).await.unwrap();
    timeout(IO_TIMEOUT, prefix_sent_rx).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut buf = [0u8; 4];
    assert!(
        timeout(Duration::from_millis(200), stream.read(&mut buf))
            .await
            .is_err(),
        "partial backend frame reached the client"
    );

    release_tx.send(()).unwrap();
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, [0x03, 0x02, 0xaa, 0xbb]);

    stream.write_all(&hello).await.unwrap();
    let forwarded = timeout(IO_TIMEOUT, received_rx).await.unwrap().unwrap();
    assert_eq!(forwarded, hello);
}
