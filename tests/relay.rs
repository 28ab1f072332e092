//! Auth relay tests - real loopback sockets against a scripted upstream proxy.
//!
//! These tests validate:
//! 1. Proxy-Authorization injection and verbatim header forwarding
//! 2. Tunnel gating on the upstream response
//! 3. Session termination when either side closes
//! 4. Per-connection failure isolation

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use shunt::proxy::{AuthRelay, RelayConfig};
use shunt::types::{Credentials, ProxyTarget};

const CONNECT: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: test\r\n\r\n";
const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\n\r\n";

// ============================================================================
// Scripted upstream proxy
// ============================================================================

/// What the fake upstream does after answering the CONNECT.
#[derive(Clone, Copy)]
enum AfterHead {
    /// Echo everything back until the client half closes, then close.
    Echo,
    /// Write these bytes and close.
    SendAndClose(&'static [u8]),
    /// Read until end of stream and report whether it arrived.
    AwaitEof,
}

struct Upstream {
    addr: SocketAddr,
    /// Request head as received by the upstream.
    request: oneshot::Receiver<Vec<u8>>,
    /// Set once the upstream observed end of stream from the relay.
    eof: oneshot::Receiver<()>,
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    head
}

async fn spawn_upstream(response: &'static [u8], after: AfterHead) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (request_tx, request) = oneshot::channel();
    let (eof_tx, eof) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let head = read_head(&mut stream).await;
        let _ = request_tx.send(head);
        stream.write_all(response).await.unwrap();

        match after {
            AfterHead::Echo => {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = eof_tx.send(());
            }
            AfterHead::SendAndClose(data) => {
                stream.write_all(data).await.unwrap();
            }
            AfterHead::AwaitEof => {
                let mut sink = Vec::new();
                if stream.read_to_end(&mut sink).await.is_ok() {
                    let _ = eof_tx.send(());
                }
            }
        }
    });

    Upstream { addr, request, eof }
}

async fn start_relay(upstream: SocketAddr, credentials: Credentials) -> (AuthRelay, SocketAddr) {
    let mut relay = AuthRelay::new(RelayConfig::default());
    let addr = relay
        .start(ProxyTarget::new("127.0.0.1", upstream.port()), &credentials, 0)
        .await
        .unwrap();
    (relay, addr)
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or_default();
    buf
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_auth_header_injected() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();

    let request = timeout(Duration::from_secs(5), upstream.request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        String::from_utf8(request).unwrap(),
        "CONNECT example.com:443 HTTP/1.1\r\n\
         Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\
         Host: example.com:443\r\n\
         User-Agent: test\r\n\
         \r\n"
    );

    assert_eq!(read_exact_len(&mut client, ESTABLISHED.len()).await, ESTABLISHED);

    relay.stop().await;
}

#[tokio::test]
async fn test_request_without_headers() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT 10.0.0.1:22 HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let request = timeout(Duration::from_secs(5), upstream.request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        request,
        b"CONNECT 10.0.0.1:22 HTTP/1.0\r\nProxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n"
    );

    relay.stop().await;
}

// ============================================================================
// Tunnel gating
// ============================================================================

#[tokio::test]
async fn test_established_tunnel_forwards_both_ways() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();
    assert_eq!(read_exact_len(&mut client, ESTABLISHED.len()).await, ESTABLISHED);

    for payload in [&b"ping"[..], &[0u8, 1, 2, 255][..], &vec![7u8; 100_000][..]] {
        client.write_all(payload).await.unwrap();
        assert_eq!(read_exact_len(&mut client, payload.len()).await, payload);
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_rejected_tunnel_closes_both_sides() {
    let upstream = spawn_upstream(AUTH_REQUIRED, AfterHead::AwaitEof).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "wrong")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();

    // The rejection is forwarded verbatim, then the connection closes.
    assert_eq!(read_to_eof(&mut client).await, AUTH_REQUIRED);
    timeout(Duration::from_secs(5), upstream.eof)
        .await
        .expect("upstream socket was not closed")
        .unwrap();

    let stats = relay.stats();
    assert_eq!(stats.established, 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_bytes_after_head_reach_client() {
    static RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nearly";
    let upstream = spawn_upstream(RESPONSE, AfterHead::SendAndClose(b" data")).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, b"HTTP/1.1 200 OK\r\n\r\nearly data");

    relay.stop().await;
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_upstream_close_ends_session() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::SendAndClose(b"bye")).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();

    let mut expected = ESTABLISHED.to_vec();
    expected.extend_from_slice(b"bye");
    assert_eq!(read_to_eof(&mut client).await, expected);

    relay.stop().await;
}

#[tokio::test]
async fn test_client_close_ends_session() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();
    assert_eq!(read_exact_len(&mut client, ESTABLISHED.len()).await, ESTABLISHED);

    client.write_all(b"last words").await.unwrap();
    client.shutdown().await.unwrap();

    // Upstream echoes what it got, sees end of stream, and closes.
    assert_eq!(read_to_eof(&mut client).await, b"last words");
    timeout(Duration::from_secs(5), upstream.eof)
        .await
        .expect("upstream never saw end of stream")
        .unwrap();

    relay.stop().await;
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_unreachable_upstream_only_fails_that_connection() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (mut relay, addr) = start_relay(dead_addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();
    assert!(read_to_eof(&mut client).await.is_empty());

    // The listener keeps serving.
    let mut again = TcpStream::connect(addr).await.unwrap();
    again.write_all(CONNECT).await.unwrap();
    assert!(read_to_eof(&mut again).await.is_empty());
    assert!(relay.is_running());

    relay.stop().await;
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"\r\n").await.unwrap();
    assert!(read_to_eof(&mut client).await.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let accepted = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let rejected = spawn_upstream(AUTH_REQUIRED, AfterHead::AwaitEof).await;

    let (mut good_relay, good_addr) =
        start_relay(accepted.addr, Credentials::new("alice", "secret")).await;
    let (mut bad_relay, bad_addr) = start_relay(rejected.addr, Credentials::new("alice", "nope")).await;

    let mut good = TcpStream::connect(good_addr).await.unwrap();
    let mut bad = TcpStream::connect(bad_addr).await.unwrap();
    good.write_all(CONNECT).await.unwrap();
    bad.write_all(CONNECT).await.unwrap();

    assert_eq!(read_to_eof(&mut bad).await, AUTH_REQUIRED);

    assert_eq!(read_exact_len(&mut good, ESTABLISHED.len()).await, ESTABLISHED);
    good.write_all(b"still alive").await.unwrap();
    assert_eq!(read_exact_len(&mut good, 11).await, b"still alive");

    good_relay.stop().await;
    bad_relay.stop().await;
}

#[tokio::test]
async fn test_stop_abandons_open_tunnels() {
    let upstream = spawn_upstream(ESTABLISHED, AfterHead::Echo).await;
    let (mut relay, addr) = start_relay(upstream.addr, Credentials::new("alice", "secret")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(CONNECT).await.unwrap();
    assert_eq!(read_exact_len(&mut client, ESTABLISHED.len()).await, ESTABLISHED);

    timeout(Duration::from_secs(5), relay.stop())
        .await
        .expect("stop waited on an open tunnel");

    assert!(read_to_eof(&mut client).await.is_empty());
    assert!(TcpStream::connect(addr).await.is_err());
}
