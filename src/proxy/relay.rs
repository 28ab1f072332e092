//! Authenticating HTTP CONNECT relay.
//!
//! Listens on loopback, accepts CONNECT requests from clients that cannot
//! authenticate to the upstream proxy themselves, re-issues each request to
//! the upstream with a `Proxy-Authorization` header, and once the upstream
//! accepts the tunnel pumps raw bytes in both directions.
//!
//! Every accepted connection runs in its own task. A failure in one
//! connection is logged and never touches the listener or other connections.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};
use zeroize::Zeroizing;

use super::auth;
use crate::error::{Error, RelayError, Result};
use crate::types::{Credentials, ProxyTarget};

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Fixed loopback port the relay listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-direction forwarding buffer size.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on a request or response header block.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_port() -> u16 {
    crate::DEFAULT_RELAY_PORT
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_buffer_size() -> usize {
    8192
}
fn default_max_connections() -> usize {
    256
}
fn default_max_header_bytes() -> usize {
    64 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

/// Relay statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connections accepted on the listener.
    pub accepted: u64,
    /// Connections currently being handled.
    pub active: u64,
    /// Tunnels the upstream accepted.
    pub established: u64,
    /// Tunnels the upstream refused.
    pub rejected: u64,
    /// Connections that failed before a tunnel was established, including
    /// those turned away at `max_connections`.
    pub failed: u64,
    /// Bytes forwarded client -> upstream after establishment.
    pub bytes_to_upstream: u64,
    /// Bytes forwarded upstream -> client after establishment.
    pub bytes_to_client: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    accepted: AtomicU64,
    active: AtomicU64,
    established: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl RelayCounters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active gauge when a connection task ends or is aborted.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn new(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Read-only state shared by every connection task of one relay run.
struct RelayContext {
    upstream: ProxyTarget,
    auth_header: Zeroizing<String>,
    config: RelayConfig,
    counters: Arc<RelayCounters>,
    next_id: AtomicU64,
}

struct RunningRelay {
    local_addr: SocketAddr,
    upstream: ProxyTarget,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Local authenticating relay in front of a single upstream proxy.
pub struct AuthRelay {
    config: RelayConfig,
    counters: Arc<RelayCounters>,
    running: Option<RunningRelay>,
}

impl AuthRelay {
    /// Create a stopped relay.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RelayCounters::default()),
            running: None,
        }
    }

    /// Bind `127.0.0.1:local_port` and start accepting connections.
    ///
    /// A relay that is already running is stopped first. Port 0 binds an
    /// ephemeral port; the bound address is returned.
    pub async fn start(
        &mut self,
        upstream: ProxyTarget,
        credentials: &Credentials,
        local_port: u16,
    ) -> Result<SocketAddr> {
        if self.running.is_some() {
            self.stop().await;
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        let listener = bind_listener(addr).map_err(|e| Error::BindFailed {
            addr,
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

        let ctx = Arc::new(RelayContext {
            upstream: upstream.clone(),
            auth_header: Zeroizing::new(auth::basic_header(credentials)),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            next_id: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        info!(listen = %local_addr, upstream = %upstream, "Auth relay started");

        self.running = Some(RunningRelay {
            local_addr,
            upstream,
            shutdown_tx,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting and abandon in-flight connections. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.accept_task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Relay accept loop panicked");
            }
        }

        info!(listen = %running.local_addr, "Auth relay stopped");
    }

    /// Check if the relay is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound listener address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Upstream proxy the relay forwards to while running.
    pub fn upstream(&self) -> Option<&ProxyTarget> {
        self.running.as_ref().map(|r| &r.upstream)
    }

    /// Counters accumulated across every run of this relay.
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }
}

impl Drop for AuthRelay {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());
            running.accept_task.abort();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    ctx.counters.accepted.fetch_add(1, Ordering::Relaxed);

                    if connections.len() >= ctx.config.max_connections {
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(%peer, max = ctx.config.max_connections, "Max relay connections reached, rejecting");
                        continue;
                    }

                    let ctx = Arc::clone(&ctx);
                    connections.spawn(async move {
                        handle_connection(stream, peer, &ctx).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Relay accept error");
                }
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    if !connections.is_empty() {
        debug!(count = connections.len(), "Abandoning in-flight relay connections");
    }
    connections.abort_all();
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &RelayContext) {
    let _active = ActiveGuard::new(&ctx.counters.active);
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    trace!(id, %peer, "Relay connection accepted");

    match RelaySession::new(id, peer, stream).run(ctx).await {
        Ok(summary) => {
            debug!(
                id,
                %peer,
                target = %summary.target,
                sent = summary.bytes_to_upstream,
                received = summary.bytes_to_client,
                "Relay tunnel closed"
            );
        }
        Err(Error::Relay(RelayError::TunnelRejected(status))) => {
            ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(id, %peer, %status, "Upstream rejected tunnel");
        }
        Err(e) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(id, %peer, error = %e, "Relay connection failed");
        }
    }
}

/// Totals for one finished tunnel.
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub target: String,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

/// One accepted client connection and, once connected, its upstream.
///
/// Dropping the session closes both sockets.
pub struct RelaySession {
    id: u64,
    peer: SocketAddr,
    client: BufReader<TcpStream>,
}

impl RelaySession {
    pub fn new(id: u64, peer: SocketAddr, client: TcpStream) -> Self {
        Self {
            id,
            peer,
            client: BufReader::new(client),
        }
    }

    async fn run(mut self, ctx: &RelayContext) -> Result<RelaySummary> {
        let limit = ctx.config.max_header_bytes;
        let request = read_request(&mut self.client, limit).await?;
        debug!(id = self.id, peer = %self.peer, request = %request.line, "CONNECT request");

        let upstream = connect_upstream(&ctx.upstream, ctx.config.connect_timeout).await?;
        let mut upstream = BufReader::new(upstream);

        upstream
            .get_mut()
            .write_all(&request.forwarded(&ctx.auth_header))
            .await?;
        upstream.get_mut().flush().await?;

        let head = read_response_head(&mut upstream, limit).await?;
        debug!(id = self.id, status = %head.status_line(), "Upstream response");

        self.client.get_mut().write_all(&head.bytes).await?;
        self.client.get_mut().flush().await?;

        if !head.complete {
            return Err(RelayError::UnterminatedResponse.into());
        }
        if !tunnel_accepted(&head.bytes) {
            return Err(RelayError::TunnelRejected(head.status_line()).into());
        }

        ctx.counters.established.fetch_add(1, Ordering::Relaxed);
        let target = request.target().unwrap_or_default().to_string();

        let (bytes_to_upstream, bytes_to_client) =
            forward(self.client, upstream, ctx.config.buffer_size).await;

        ctx.counters
            .bytes_to_upstream
            .fetch_add(bytes_to_upstream, Ordering::Relaxed);
        ctx.counters
            .bytes_to_client
            .fetch_add(bytes_to_client, Ordering::Relaxed);

        Ok(RelaySummary {
            target,
            bytes_to_upstream,
            bytes_to_client,
        })
    }
}

/// A client's CONNECT request as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Request line without its CRLF, e.g. `CONNECT host:443 HTTP/1.1`.
    pub line: String,
    /// Header lines verbatim, each with its CRLF, blank terminator excluded.
    pub headers: Vec<u8>,
}

impl ConnectRequest {
    /// The request target (`host:port` for CONNECT).
    pub fn target(&self) -> Option<&str> {
        self.line.split_whitespace().nth(1)
    }

    /// Bytes sent upstream: request line, auth header, original headers, blank line.
    pub fn forwarded(&self, auth_header: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.line.len() + auth_header.len() + self.headers.len() + 8);
        out.extend_from_slice(self.line.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(auth_header.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.headers);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Upstream response header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Bytes read, up to and including `\r\n\r\n` when complete.
    pub bytes: Vec<u8>,
    /// Whether the terminator was seen before end of stream.
    pub complete: bool,
}

impl ResponseHead {
    pub fn status_line(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        text.split("\r\n").next().unwrap_or_default().to_string()
    }
}

/// Whether the upstream accepted the tunnel.
///
/// Matches `"200"` anywhere in the raw head rather than parsing the status
/// code, so a header value containing "200" also counts as accepted.
pub fn tunnel_accepted(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).contains("200")
}

/// Read a CONNECT request line and its header block.
pub async fn read_request<R>(reader: &mut R, limit: usize) -> Result<ConnectRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;

    let raw = read_crlf_line(reader, limit, &mut consumed)
        .await?
        .ok_or_else(|| RelayError::MalformedRequest("connection closed before request line".into()))?;
    let line = std::str::from_utf8(&raw[..raw.len() - 2])
        .map_err(|_| RelayError::MalformedRequest("request line is not UTF-8".into()))?
        .trim()
        .to_string();
    if line.is_empty() {
        return Err(RelayError::MalformedRequest("empty request line".into()).into());
    }

    let mut headers = Vec::new();
    loop {
        let raw = read_crlf_line(reader, limit, &mut consumed)
            .await?
            .ok_or_else(|| RelayError::MalformedRequest("connection closed inside headers".into()))?;
        if raw == b"\r\n" {
            break;
        }
        headers.extend_from_slice(&raw);
    }

    Ok(ConnectRequest { line, headers })
}

/// Read one line ending in CRLF. `None` on end of stream before any byte.
///
/// A bare LF does not terminate the line.
async fn read_crlf_line<R>(reader: &mut R, limit: usize, consumed: &mut usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let remaining = limit.saturating_sub(*consumed);
        if remaining == 0 {
            return Err(RelayError::HeadersTooLarge { limit }.into());
        }

        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut line)
            .await?;
        *consumed += n;

        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(RelayError::MalformedRequest("unterminated line".into()).into());
        }
        if line.ends_with(b"\r\n") {
            return Ok(Some(line));
        }
    }
}

/// Read the upstream response up to and including the first `\r\n\r\n`.
///
/// Bytes after the terminator stay buffered in `reader` for forwarding.
pub async fn read_response_head<R>(reader: &mut R, limit: usize) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let remaining = limit.saturating_sub(bytes.len());
        if remaining == 0 {
            return Err(RelayError::HeadersTooLarge { limit }.into());
        }

        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut bytes)
            .await?;
        if n == 0 {
            return Ok(ResponseHead {
                bytes,
                complete: false,
            });
        }
        if bytes.ends_with(b"\r\n\r\n") {
            return Ok(ResponseHead {
                bytes,
                complete: true,
            });
        }
    }
}

async fn connect_upstream(upstream: &ProxyTarget, timeout: Duration) -> Result<TcpStream> {
    let addr = upstream.to_string();
    match tokio::time::timeout(timeout, TcpStream::connect((upstream.host.as_str(), upstream.port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(RelayError::UpstreamConnect {
            addr,
            reason: e.to_string(),
        }
        .into()),
        Err(_) => Err(RelayError::UpstreamTimeout {
            addr,
            secs: timeout.as_secs(),
        }
        .into()),
    }
}

/// Pump both directions until each sees end of stream or an error.
///
/// Returns `(client -> upstream, upstream -> client)` byte counts. Bytes
/// already buffered by either reader are forwarded first.
async fn forward(
    client: BufReader<TcpStream>,
    upstream: BufReader<TcpStream>,
    buffer_size: usize,
) -> (u64, u64) {
    let (client_read, client_write) = split_buffered(client);
    let (upstream_read, upstream_write) = split_buffered(upstream);

    tokio::join!(
        pump(client_read, upstream_write, buffer_size),
        pump(upstream_read, client_write, buffer_size),
    )
}

/// Split a buffered stream into owned halves, keeping any buffered bytes.
fn split_buffered(
    stream: BufReader<TcpStream>,
) -> (
    tokio::io::Chain<std::io::Cursor<Vec<u8>>, tokio::net::tcp::OwnedReadHalf>,
    tokio::net::tcp::OwnedWriteHalf,
) {
    let pending = stream.buffer().to_vec();
    let (read, write) = stream.into_inner().into_split();
    (std::io::Cursor::new(pending).chain(read), write)
}

async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    trace!(error = %e, "Relay write ended");
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                trace!(error = %e, "Relay read ended");
                break;
            }
        }
    }

    // Propagate end of stream to the other side.
    let _ = writer.shutdown().await;
    total
}
