//! Integration tests for the TFTP engine
//!
//! The scenario tests script the remote side by hand on loopback sockets;
//! the round-trip tests run the real client against the real server.

use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::tempdir;
use tftp::{
    Client, Error, ErrorKind, Extensions, GetOptions, GetResponse, GlobalOptions, IncomingRequest, PutOptions,
    RequestHandler, ShutdownHandle, Sink, TftpOpcode, TftpServer, TftpServerConfig, UserExtensions, abort_pair,
    build_ack, build_data, build_error_kind, build_oack, get_tftp_opcode, parse_ack, parse_data, parse_error,
    parse_request,
};
use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

async fn recv(sock: &UdpSocket) -> (Bytes, SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (n, from) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .expect("peer timed out")
        .unwrap();
    buf.truncate(n);
    (Bytes::from(buf), from)
}

async fn fake_server() -> (UdpSocket, u16) {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn options(port: u16) -> GlobalOptions {
    GlobalOptions::new("127.0.0.1").with_port(port)
}

#[tokio::test]
async fn test_put_lockstep_with_small_blocks() {
    let (listener, port) = fake_server().await;

    let peer = tokio::spawn(async move {
        let (buf, client) = recv(&listener).await;
        assert_eq!(get_tftp_opcode(&buf), Some(TftpOpcode::WriteRequest));
        let request = parse_request(&buf).unwrap();
        assert_eq!(request.filename, "upload.bin");
        let ext = request.extensions.unwrap();
        assert_eq!(ext.blksize, Some(8));
        assert_eq!(ext.tsize, Some(10));
        assert_eq!(ext.windowsize, Some(1));

        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let oack = Extensions {
            blksize: Some(8),
            windowsize: Some(1),
            ..Default::default()
        };
        transfer.send_to(&build_oack(&oack), client).await.unwrap();

        let mut received = Vec::new();
        for expected in 1..=2u16 {
            let (buf, from) = recv(&transfer).await;
            assert_eq!(from, client);
            let (block, data) = parse_data(&buf).unwrap();
            assert_eq!(block, expected);
            received.extend_from_slice(&data);
            transfer.send_to(&build_ack(block), client).await.unwrap();
        }
        received
    });

    let client = Client::new(options(port).with_block_size(8).with_window_size(1));
    let mut source: &[u8] = b"0123456789";
    let stats = client.put("upload.bin", &mut source, PutOptions::new(10)).await.unwrap();

    assert_eq!(stats.block_size, 8);
    assert_eq!(stats.window_size, 1);
    assert_eq!(peer.await.unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_get_exact_multiple_ends_with_empty_block() {
    let (listener, port) = fake_server().await;
    let content: Vec<u8> = (0..16).collect();
    let expected = content.clone();

    let peer = tokio::spawn(async move {
        let (buf, client) = recv(&listener).await;
        let ext = parse_request(&buf).unwrap().extensions.unwrap();
        assert_eq!(ext.tsize, Some(0));

        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let oack = Extensions {
            blksize: Some(8),
            tsize: Some(16),
            windowsize: Some(2),
            ..Default::default()
        };
        transfer.send_to(&build_oack(&oack), client).await.unwrap();
        let (buf, _) = recv(&transfer).await;
        assert_eq!(parse_ack(&buf).unwrap(), 0);

        transfer.send_to(&build_data(1, &content[..8]), client).await.unwrap();
        transfer.send_to(&build_data(2, &content[8..]), client).await.unwrap();
        let (buf, _) = recv(&transfer).await;
        assert_eq!(parse_ack(&buf).unwrap(), 2);

        transfer.send_to(&build_data(3, &[]), client).await.unwrap();
        let (buf, _) = recv(&transfer).await;
        assert_eq!(parse_ack(&buf).unwrap(), 3);
    });

    let client = Client::new(options(port).with_block_size(8).with_window_size(2));
    let mut out = Vec::new();
    let stats = client.get("file.bin", &mut out, GetOptions::default()).await.unwrap();

    assert_eq!(stats.transfer_size, Some(16));
    assert_eq!(stats.window_size, 2);
    assert_eq!(out, expected);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_denied_options_fall_back_once() {
    let (listener, port) = fake_server().await;

    let peer = tokio::spawn(async move {
        let (buf, client) = recv(&listener).await;
        assert!(parse_request(&buf).unwrap().extensions.is_some());
        listener.send_to(&build_error_kind(ErrorKind::Deny), client).await.unwrap();

        let (buf, from) = recv(&listener).await;
        assert_eq!(from, client);
        let request = parse_request(&buf).unwrap();
        assert_eq!(request.filename, "legacy.txt");
        assert!(request.extensions.is_none());

        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transfer.send_to(&build_data(1, b"hello"), client).await.unwrap();
        let (buf, _) = recv(&transfer).await;
        assert_eq!(parse_ack(&buf).unwrap(), 1);
    });

    let client = Client::new(options(port));
    let mut out = Vec::new();
    let stats = client.get("legacy.txt", &mut out, GetOptions::default()).await.unwrap();

    assert_eq!(stats.block_size, 512);
    assert_eq!(stats.window_size, 1);
    assert_eq!(out, b"hello");
    peer.await.unwrap();
}

#[tokio::test]
async fn test_second_option_denial_is_illegal() {
    let (listener, port) = fake_server().await;

    let peer = tokio::spawn(async move {
        let (buf, client) = recv(&listener).await;
        assert!(parse_request(&buf).unwrap().extensions.is_some());
        listener.send_to(&build_error_kind(ErrorKind::Deny), client).await.unwrap();

        let (buf, _) = recv(&listener).await;
        assert!(parse_request(&buf).unwrap().extensions.is_none());
        listener.send_to(&build_error_kind(ErrorKind::Deny), client).await.unwrap();

        let (buf, _) = recv(&listener).await;
        parse_error(&buf).unwrap()
    });

    let client = Client::new(options(port));
    let mut out = Vec::new();
    let err = client.get("legacy.txt", &mut out, GetOptions::default()).await.unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::BadOp));
    let (code, message) = peer.await.unwrap();
    assert_eq!(code, ErrorKind::BadOp.code());
    assert_eq!(message, ErrorKind::BadOp.message());
    assert!(out.is_empty());
}

/// Rejects every write
struct FailingSink;

impl AsyncWrite for FailingSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::other("disk full")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Sink for FailingSink {}

#[tokio::test]
async fn test_sink_failure_on_last_block_is_reported() {
    let (listener, port) = fake_server().await;

    let peer = tokio::spawn(async move {
        let (_, client) = recv(&listener).await;
        // Ignore the options and answer with the whole file at once
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transfer.send_to(&build_data(1, b"short"), client).await.unwrap();
        let (buf, _) = recv(&transfer).await;
        parse_error(&buf).unwrap()
    });

    let client = Client::new(options(port));
    let err = client.get("file.bin", &mut FailingSink, GetOptions::default()).await.unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(peer.await.unwrap(), (0, ErrorKind::Io.message().to_string()));
}

#[tokio::test]
async fn test_sink_failure_against_real_server() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("boot.img"), vec![9u8; 3000]).unwrap();
    let (port, shutdown) = start_server(root.path(), false).await;

    let err = Client::new(options(port).with_block_size(1024))
        .get("boot.img", &mut FailingSink, GetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    shutdown.shutdown();
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (listener, port) = fake_server().await;

    let peer = tokio::spawn(async move {
        let mut requests = 0;
        let mut buf = [0u8; 1024];
        while let Ok(Ok(_)) = timeout(Duration::from_millis(500), listener.recv_from(&mut buf)).await {
            requests += 1;
        }
        requests
    });

    let client = Client::new(options(port).with_retries(2).with_timeout(Duration::from_millis(50)));
    let mut out = Vec::new();
    let err = client.get("nobody.bin", &mut out, GetOptions::default()).await.unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::Time));
    assert_eq!(peer.await.unwrap(), 3);
}

#[tokio::test]
async fn test_abort_before_reply() {
    let (listener, port) = fake_server().await;
    let (handle, signal) = abort_pair();
    handle.abort_with("stop");

    let peer = tokio::spawn(async move {
        let (buf, _) = recv(&listener).await;
        assert_eq!(get_tftp_opcode(&buf), Some(TftpOpcode::ReadRequest));
        let (buf, _) = recv(&listener).await;
        parse_error(&buf).unwrap()
    });

    let client = Client::new(options(port));
    let mut out = Vec::new();
    let get = GetOptions {
        abort: Some(signal),
        ..Default::default()
    };
    let err = client.get("file.bin", &mut out, get).await.unwrap_err();

    assert!(matches!(err, Error::Aborted(ref reason) if reason == "stop"));
    assert_eq!(peer.await.unwrap(), (0, "stop".to_string()));
}

async fn start_server(root: &Path, deny_get: bool) -> (u16, ShutdownHandle) {
    let config = TftpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        root_directory: root.to_path_buf(),
        deny_get,
        ..Default::default()
    };
    let server = TftpServer::bind(config).await.unwrap();
    let port = server.local_addr().unwrap().port();
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.serve());
    (port, shutdown)
}

/// Poll until an upload shows up on the server's disk
async fn wait_for_content(path: &Path, expected: &[u8]) {
    for _ in 0..250 {
        if tokio::fs::read(path).await.is_ok_and(|c| c == expected) {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never received the expected content", path.display());
}

#[tokio::test]
async fn test_round_trip_with_real_server() -> anyhow::Result<()> {
    let root = tempdir()?;
    let local = tempdir()?;
    let (port, shutdown) = start_server(root.path(), false).await;
    let client = Client::new(options(port).with_block_size(1024));

    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(root.path().join("boot.img"), &content)?;

    let download = local.path().join("boot.img");
    let stats = client.get_file("boot.img", &download, GetOptions::default()).await?;
    assert_eq!(stats.block_size, 1024);
    assert_eq!(stats.window_size, 4);
    assert_eq!(stats.transfer_size, Some(100_000));
    assert_eq!(std::fs::read(&download)?, content);

    let upload = local.path().join("report.txt");
    std::fs::write(&upload, b"uploaded through a window of four")?;
    let stats = client.put_file(&upload, "report.txt", PutOptions::default()).await?;
    assert_eq!(stats.transfer_size, Some(33));
    wait_for_content(&root.path().join("report.txt"), b"uploaded through a window of four").await;

    shutdown.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_empty_file() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("empty"), b"").unwrap();
    let (port, shutdown) = start_server(root.path(), false).await;

    let mut out = Vec::new();
    let stats = Client::new(options(port))
        .get("empty", &mut out, GetOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.transfer_size, Some(0));
    assert!(out.is_empty());

    shutdown.shutdown();
}

#[tokio::test]
async fn test_server_errors_reach_client() {
    let root = tempdir().unwrap();
    let (port, shutdown) = start_server(root.path(), false).await;
    let client = Client::new(options(port));

    let mut out = Vec::new();
    let err = client.get("missing.bin", &mut out, GetOptions::default()).await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.kind(), Some(ErrorKind::NoEnt));
    shutdown.shutdown();

    let (port, shutdown) = start_server(root.path(), true).await;
    let err = Client::new(options(port))
        .get("anything", &mut out, GetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { code: 0, ref message } if message == ErrorKind::NoGet.message()));
    shutdown.shutdown();
}

#[tokio::test]
async fn test_checksum_mismatch_removes_download() {
    let root = tempdir().unwrap();
    let local = tempdir().unwrap();
    std::fs::write(root.path().join("hello.txt"), b"hello").unwrap();
    let (port, shutdown) = start_server(root.path(), false).await;
    let client = Client::new(options(port));

    let good = GetOptions {
        md5: Some("5d41402abc4b2a76b9719d911017c592".to_string()),
        ..Default::default()
    };
    let path = local.path().join("ok.txt");
    client.get_file("hello.txt", &path, good).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    let bad = GetOptions {
        sha1: Some("0000000000000000000000000000000000000000".to_string()),
        ..Default::default()
    };
    let path = local.path().join("bad.txt");
    let err = client.get_file("hello.txt", &path, bad).await.unwrap_err();
    assert!(matches!(err, Error::Checksum("sha1sum")));
    assert!(!path.exists());

    shutdown.shutdown();
}

/// Forwards datagrams between a client and a server, losing the first DATA
/// numbered `lose_data` and the first ACK numbered `lose_ack`
///
/// Returns the relay's port and a task that ends after a second of silence,
/// reporting whether both datagrams were actually lost.
async fn lossy_relay(server_port: u16, lose_data: u16, lose_ack: u16) -> (u16, tokio::task::JoinHandle<(bool, bool)>) {
    let front = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let back = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = front.local_addr().unwrap().port();
    let listener: SocketAddr = ([127, 0, 0, 1], server_port).into();

    let relay = tokio::spawn(async move {
        let mut client = None;
        let mut server = None;
        let (mut lost_data, mut lost_ack) = (false, false);
        let mut up = vec![0u8; 65536];
        let mut down = vec![0u8; 65536];
        loop {
            tokio::select! {
                received = front.recv_from(&mut up) => {
                    let (n, from) = received.unwrap();
                    client = Some(from);
                    let datagram = &up[..n];
                    if !lost_ack
                        && get_tftp_opcode(datagram) == Some(TftpOpcode::Acknowledgment)
                        && parse_ack(datagram).unwrap() == lose_ack
                    {
                        lost_ack = true;
                        continue;
                    }
                    back.send_to(datagram, server.unwrap_or(listener)).await.unwrap();
                }
                received = back.recv_from(&mut down) => {
                    let (n, from) = received.unwrap();
                    server.get_or_insert(from);
                    let datagram = Bytes::copy_from_slice(&down[..n]);
                    if !lost_data
                        && get_tftp_opcode(&datagram) == Some(TftpOpcode::Data)
                        && parse_data(&datagram).unwrap().0 == lose_data
                    {
                        lost_data = true;
                        continue;
                    }
                    if let Some(client) = client {
                        front.send_to(&datagram, client).await.unwrap();
                    }
                }
                _ = sleep(Duration::from_secs(1)) => break,
            }
        }
        (lost_data, lost_ack)
    });
    (port, relay)
}

#[tokio::test]
async fn test_windowed_get_survives_lost_block_and_ack() {
    let root = tempdir().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(root.path().join("kernel"), &content).unwrap();
    let (server_port, shutdown) = start_server(root.path(), false).await;
    let (relay_port, relay) = lossy_relay(server_port, 3, 8).await;

    let client = Client::new(
        options(relay_port)
            .with_block_size(512)
            .with_window_size(4)
            .with_timeout(Duration::from_millis(150)),
    );
    let mut out = Vec::new();
    let stats = timeout(Duration::from_secs(10), client.get("kernel", &mut out, GetOptions::default()))
        .await
        .expect("transfer stalled")
        .unwrap();

    assert_eq!(stats.window_size, 4);
    assert_eq!(stats.timeout, Duration::from_millis(150));
    assert_eq!(out, content);
    assert_eq!(relay.await.unwrap(), (true, true));

    shutdown.shutdown();
}

/// Serves a fixed payload and acknowledges the client's token
struct TokenHandler;

#[async_trait]
impl RequestHandler for TokenHandler {
    async fn open_get(&self, req: &IncomingRequest) -> tftp::Result<GetResponse> {
        let token = req.user_extensions.get("x-token").ok_or(ErrorKind::Access)?;
        let mut resp = GetResponse::new(Box::new(Cursor::new(format!("hello {token}").into_bytes())), None);
        resp.user_extensions = UserExtensions::new().with("x-token", "accepted");
        Ok(resp)
    }

    async fn open_put(&self, _req: &IncomingRequest) -> tftp::Result<tftp::PutResponse> {
        Err(ErrorKind::Access.into())
    }
}

#[tokio::test]
async fn test_custom_handler_and_user_extensions() {
    let config = TftpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let server = TftpServer::bind(config).await.unwrap().with_handler(Arc::new(TokenHandler));
    let port = server.local_addr().unwrap().port();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    let client = Client::new(options(port));
    let mut out = Vec::new();
    let get = GetOptions {
        user_extensions: UserExtensions::new().with("x-token", "abc"),
        ..Default::default()
    };
    let stats = client.get("greeting", &mut out, get).await.unwrap();
    assert_eq!(out, b"hello abc");
    assert_eq!(stats.user_extensions.get("x-token"), Some("accepted"));
    assert_eq!(stats.transfer_size, None);

    let mut source: &[u8] = b"data";
    let err = client.put("greeting", &mut source, PutOptions::new(4)).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Access));

    shutdown.shutdown();
    serving.await.unwrap().unwrap();
}
