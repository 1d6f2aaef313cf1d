//! Capture servers - mock duplication targets feeding one shared queue
//!
//! Each server accepts any HTTP/1.x request, records it, and either echoes
//! the body back with `200 OK` or, when the path carries the delay marker,
//! stalls, records late and never answers. Both servers push into the same
//! unbounded queue, which the assertion engine drains.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::{E2eError, E2eResult};

/// One request as received by a capture server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    pub method: String,
    pub path: String,
    /// Raw header lines in arrival order, trailing whitespace stripped
    pub header_lines: Vec<String>,
    pub body: String,
    /// Port of the capture server that received it
    pub source_port: u16,
}

impl fmt::Display for CaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  port: {}", self.source_port)?;
        writeln!(f, "  method: {}", self.method)?;
        writeln!(f, "  path: {}", self.path)?;
        for line in &self.header_lines {
            writeln!(f, "  header: {}", line)?;
        }
        write!(f, "  body: {}", self.body)
    }
}

pub type CaptureSender = mpsc::UnboundedSender<CaptureRecord>;

/// Consumer side of the shared capture channel
pub struct CaptureQueue {
    tx: CaptureSender,
    rx: mpsc::UnboundedReceiver<CaptureRecord>,
}

impl CaptureQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A producer handle for a capture server
    pub fn sender(&self) -> CaptureSender {
        self.tx.clone()
    }

    /// Wait up to `wait` for the next record. `None` means nothing arrived.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<CaptureRecord> {
        match timeout(wait, self.rx.recv()).await {
            Ok(record) => record,
            Err(_) => None,
        }
    }
}

impl Default for CaptureQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// How a capture server treats the requests it receives
#[derive(Debug, Clone)]
pub struct CaptureBehavior {
    /// Lower-cased path token that triggers a stall
    delay_marker: String,
    delay: Duration,
}

impl CaptureBehavior {
    pub fn new(delay_marker: &str, delay: Duration) -> Self {
        Self {
            delay_marker: delay_marker.to_lowercase(),
            delay,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(&config.delay_marker, Duration::from_millis(config.delay_ms))
    }

    pub fn is_delayed(&self, path: &str) -> bool {
        !self.delay_marker.is_empty() && path.to_lowercase().contains(&self.delay_marker)
    }
}

/// Handle to a capture server running on its own task
pub struct CaptureServer {
    name: String,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl CaptureServer {
    /// Bind `bind_addr` and start accepting in the background
    pub async fn spawn(
        name: impl Into<String>,
        bind_addr: &str,
        sender: CaptureSender,
        behavior: CaptureBehavior,
    ) -> E2eResult<Self> {
        let name = name.into();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| E2eError::CaptureBind {
                name: name.clone(),
                addr: bind_addr.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;

        info!("Capture server '{}' listening on {}", name, addr);

        let task = tokio::spawn(accept_loop(
            name.clone(),
            listener,
            addr.port(),
            sender,
            Arc::new(behavior),
        ));

        Ok(Self { name, addr, task })
    }

    /// Probe the listener until it accepts a connection
    pub async fn wait_until_ready(&self, timeout_duration: Duration) -> E2eResult<()> {
        let probe = probe_addr(self.addr);
        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;
            match TcpStream::connect(probe).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!("Capture server '{}' not ready: {}", self.name, e),
            }
            sleep(Duration::from_millis(50)).await;
        }

        Err(E2eError::CaptureStartup(self.addr, attempts))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and drop every open connection, stalled ones included
    pub fn stop(&mut self) {
        if !self.task.is_finished() {
            info!("Stopping capture server '{}' on {}", self.name, self.addr);
            self.task.abort();
        }
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The primary and secondary capture servers plus their shared queue
pub struct CaptureSet {
    pub primary: CaptureServer,
    pub secondary: CaptureServer,
    queue: CaptureQueue,
}

impl CaptureSet {
    /// Start both servers and wait until they accept connections
    pub async fn start(config: &CaptureConfig) -> E2eResult<Self> {
        let queue = CaptureQueue::new();
        let behavior = CaptureBehavior::from_config(config);

        let primary = CaptureServer::spawn(
            "primary",
            &format!("{}:{}", config.host, config.primary_port),
            queue.sender(),
            behavior.clone(),
        )
        .await?;
        let secondary = CaptureServer::spawn(
            "secondary",
            &format!("{}:{}", config.host, config.secondary_port),
            queue.sender(),
            behavior,
        )
        .await?;

        let startup = Duration::from_millis(config.startup_timeout_ms);
        primary.wait_until_ready(startup).await?;
        secondary.wait_until_ready(startup).await?;

        Ok(Self {
            primary,
            secondary,
            queue,
        })
    }

    pub fn queue(&mut self) -> &mut CaptureQueue {
        &mut self.queue
    }

    pub fn stop(&mut self) {
        self.primary.stop();
        self.secondary.stop();
    }
}

fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    port: u16,
    sender: CaptureSender,
    behavior: Arc<CaptureBehavior>,
) {
    // Dropping the set on abort tears down every connection task
    let mut connections = JoinSet::new();
    let mut accept_errors = 0u32;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    accept_errors = 0;
                    debug!("{}: new connection from {}", name, peer);
                    connections.spawn(serve_connection(
                        stream,
                        port,
                        sender.clone(),
                        behavior.clone(),
                    ));
                }
                Err(e) => {
                    accept_errors = accept_errors.saturating_add(1);
                    let backoff = accept_backoff(accept_errors);
                    warn!("{}: accept error: {} (retrying in {:?})", name, e, backoff);
                    sleep(backoff).await;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                match done {
                    Ok(Err(e)) => debug!("{}: connection error: {}", name, e),
                    Err(e) if e.is_panic() => warn!("{}: connection task panicked", name),
                    _ => {}
                }
            }
        }
    }
}

/// Pause after consecutive accept failures (fd exhaustion and the like):
/// 10 ms doubling up to one second
fn accept_backoff(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(7);
    Duration::from_millis(10 << exponent).min(Duration::from_secs(1))
}

async fn serve_connection(
    stream: TcpStream,
    port: u16,
    sender: CaptureSender,
    behavior: Arc<CaptureBehavior>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let Some((record, raw_body)) = read_request(&mut reader, port).await? else {
        return Ok(());
    };

    if behavior.is_delayed(&record.path) {
        debug!("port {}: stalling {:?} on {}", port, behavior.delay, record.path);
        sleep(behavior.delay).await;
        deliver(&sender, record);
        // Never answer; the connection stays open until the server stops
        std::future::pending::<()>().await;
        return Ok(());
    }

    deliver(&sender, record);

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        raw_body.len()
    );
    let stream = reader.get_mut();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&raw_body).await?;
    stream.shutdown().await
}

fn deliver(sender: &CaptureSender, record: CaptureRecord) {
    debug!("Captured {} {} on port {}", record.method, record.path, record.source_port);
    if sender.send(record).is_err() {
        debug!("Capture queue closed, record dropped");
    }
}

/// Read one request head and its body.
///
/// Returns `None` when the peer closed before sending anything.
async fn read_request<R>(reader: &mut R, port: u16) -> std::io::Result<Option<(CaptureRecord, Vec<u8>)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }

    let mut request_line = line.split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();

    let mut header_lines = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        header_lines.push(header.to_string());
    }

    // The declared length only bounds the read; a short body ends at EOF
    let mut raw_body = Vec::new();
    (&mut *reader)
        .take(content_length(&header_lines))
        .read_to_end(&mut raw_body)
        .await?;

    let record = CaptureRecord {
        method,
        path,
        header_lines,
        body: String::from_utf8_lossy(&raw_body).into_owned(),
        source_port: port,
    };
    Ok(Some((record, raw_body)))
}

/// Declared body length; missing or unparsable counts as zero
fn content_length(header_lines: &[String]) -> u64 {
    header_lines
        .iter()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
