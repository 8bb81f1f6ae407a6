//! TCP server implementation.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::{error_response, BlogService};
use crate::metrics::Metrics;
use crate::session::{Session, SessionState};
use blogd_protocol::message::{Request, Response, StreamItem};
use blogd_protocol::{Decoder, Encoder, ProtocolError};
use bytes::BytesMut;
use blogd_storage::DocumentStore;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long shutdown waits for open connections before aborting them.
    pub drain_timeout: Duration,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("drain_timeout", &self.drain_timeout)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], blogd_protocol::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            drain_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            drain_timeout: network.drain_timeout(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Decrements the active connection count when a connection task ends,
/// including when it is aborted.
struct ConnectionGuard {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }
    }
}

/// Resolves once shutdown has been requested or the sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// TCP server for blogd.
pub struct Server {
    config: ServerConfig,
    service: Arc<BlogService>,
    stats: Arc<ServerStats>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server handling blog requests against `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let mut service = BlogService::new(store);
        if let Some(ref metrics) = config.metrics {
            service = service.with_metrics(metrics.clone());
        }
        service.update_gauge_metrics();

        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            service: Arc::new(service),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown,
    /// then drains open connections.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown_rx) => {
                    tracing::info!("Server shutting down");
                    break;
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            connections.spawn(self.connection_task(stream, addr));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        self.drain(&mut connections).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connection_task(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let guard = ConnectionGuard {
            stats: self.stats.clone(),
            metrics: self.config.metrics.clone(),
        };
        let service = self.service.clone();
        let stats = self.stats.clone();
        let idle_timeout = self.config.idle_timeout;
        let shutdown = self.shutdown.subscribe();

        async move {
            let _guard = guard;
            let mut session = Session::new(addr);
            let result = Self::handle_connection(
                stream,
                &mut session,
                service,
                stats.clone(),
                idle_timeout,
                shutdown,
            )
            .await;

            match result {
                Ok(()) | Err(ServerError::ShuttingDown) => {}
                Err(e) => {
                    tracing::debug!("Connection {} error: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            tracing::info!(
                "Client disconnected: {} (session={} protocol=v{} requests={} duration={:?})",
                addr,
                session.id,
                session.protocol_version(),
                session.request_count(),
                session.age()
            );
        }
    }

    async fn drain(&self, connections: &mut JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        tracing::info!("Draining {} connections", connections.len());

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Drain timeout elapsed, aborting {} connections",
                connections.len()
            );
            connections.shutdown().await;
        }
    }

    /// Handles a single connection until the client leaves, the session
    /// idles out or the server shuts down.
    async fn handle_connection(
        mut stream: TcpStream,
        session: &mut Session,
        service: Arc<BlogService>,
        stats: Arc<ServerStats>,
        idle_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        tracing::info!("Client connected: {} (session={})", addr, session.id);

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(idle_timeout) => {
                    if session.idle_duration() > idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }
            }

            // Process any complete requests
            while let Some(frame) = decoder.decode_frame()? {
                stats.requests_total.fetch_add(1, Ordering::Relaxed);

                let request = match parse_request(&frame.payload) {
                    Ok(request) => request,
                    Err(response) => {
                        tracing::warn!("[{}] Rejected malformed request (id={})", addr, response.id);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        let (_, bytes) = encode_reply(response, Encoder::encode_response)?;
                        stream.write_all(&bytes).await?;
                        continue;
                    }
                };

                tracing::info!(
                    "[{}] Request: {} (id={})",
                    addr,
                    request.op.as_str(),
                    request.id
                );

                if request.op.is_streaming() {
                    let end = stream_list(&mut stream, addr, &service, session, &request).await?;
                    if end.is_error() {
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }

                let response = service.handle(session, &request);
                let (response, response_bytes) = encode_reply(response, Encoder::encode_response)?;
                if response.is_error() {
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }

                tracing::info!(
                    "[{}] Response: {} (id={})",
                    addr,
                    if response.is_ok() { "OK" } else { "ERROR" },
                    response.id
                );

                tracing::debug!("[{}] Writing {} bytes", addr, response_bytes.len());
                stream.write_all(&response_bytes).await?;

                if session.state() == SessionState::Closing {
                    tracing::debug!("[{}] Session closing", addr);
                    return Ok(());
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns a receiver that turns true once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn service(&self) -> &Arc<BlogService> {
        &self.service
    }
}

/// Parses a frame payload into a request. Anything that is not a well-formed
/// request is answered with BAD_REQUEST, echoing the id when one is readable.
fn parse_request(payload: &[u8]) -> Result<Request, Response> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| error_response("", &ServerError::InvalidRequest(e.to_string())))?;

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match value.get("type").and_then(Value::as_str) {
        Some("request") => {}
        other => {
            return Err(error_response(
                &id,
                &ServerError::InvalidRequest(format!(
                    "expected a request message, got {}",
                    other.unwrap_or("no type")
                )),
            ))
        }
    }

    serde_json::from_value(value)
        .map_err(|e| error_response(&id, &ServerError::InvalidRequest(e.to_string())))
}

/// Encodes a response frame. A response that cannot be framed, such as one
/// larger than the payload limit, is replaced by an INTERNAL error for the
/// same request, so every request still gets an answer. Returns the response
/// actually sent.
fn encode_reply(
    response: Response,
    encode: fn(&Response) -> Result<BytesMut, ProtocolError>,
) -> Result<(Response, BytesMut), ServerError> {
    let error = match encode(&response) {
        Ok(bytes) => return Ok((response, bytes)),
        Err(e) => e,
    };

    tracing::warn!("Can't send response (id={}): {}", response.id, error);
    let mut replacement = error_response(
        &response.id,
        &ServerError::Internal(format!("can't send response: {}", error)),
    );
    if let ProtocolError::FrameTooLarge { size, max } = error {
        replacement.error = replacement
            .error
            .map(|body| body.with_detail("size", size).with_detail("max_size", max));
    }

    let bytes = encode(&replacement)?;
    Ok((replacement, bytes))
}

/// Streams every blog post as an item frame, then closes the stream with an
/// end frame. Returns the closing response.
///
/// A write failure drops the stream, which releases its cursor.
async fn stream_list(
    stream: &mut TcpStream,
    addr: SocketAddr,
    service: &BlogService,
    session: &mut Session,
    request: &Request,
) -> Result<Response, ServerError> {
    let mut blogs = match service.open_list(session, request) {
        Ok(blogs) => blogs,
        Err(response) => {
            let (response, bytes) = encode_reply(response, Encoder::encode_stream_end)?;
            stream.write_all(&bytes).await?;
            return Ok(response);
        }
    };

    let mut sent = 0u64;
    let mut outcome = Ok(());
    for next in &mut blogs {
        let blog = match next {
            Ok(blog) => blog,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        let bytes = match Encoder::encode_stream_item(&StreamItem::new(&request.id, blog)) {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome = Err(ServerError::Internal(format!(
                    "unknown internal error: {}",
                    e
                )));
                break;
            }
        };
        stream.write_all(&bytes).await?;
        sent += 1;
    }
    drop(blogs);

    let response = service.finish_list(&request.id, sent, outcome);
    let (response, bytes) = encode_reply(response, Encoder::encode_stream_end)?;
    tracing::info!(
        "[{}] Stream closed: {} items, {} (id={})",
        addr,
        sent,
        if response.is_ok() { "OK" } else { "ERROR" },
        request.id
    );
    stream.write_all(&bytes).await?;
    Ok(response)
}
