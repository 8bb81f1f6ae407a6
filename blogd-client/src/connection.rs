//! Connection management.

use crate::error::ClientError;
use crate::stream::{ListStream, StreamMessage};
use blogd_protocol::message::*;
use blogd_protocol::{Decoder, Encoder, Message, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// A connection to a blogd server.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half of the stream (for receiving responses).
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Decoder for parsing responses.
    decoder: Mutex<Decoder>,
    /// Unary requests waiting for responses.
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    /// Open streams waiting for items and their closing response. Unbounded
    /// so a slow consumer never stalls routing for other request ids.
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<StreamMessage>>>,
    /// Next request ID.
    next_id: AtomicU64,
    /// Is the connection established?
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(Decoder::new()),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the server and performs the HELLO handshake.
    pub async fn connect(&self) -> Result<HelloResult, ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        let (read_half, write_half) = tcp_stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.decoder.lock().await.clear();

        let hello = self.handshake().await?;
        tracing::debug!(
            "Handshake complete: {} {} (session {})",
            hello.server_name,
            hello.server_version,
            hello.session_id
        );

        // Mark as connected only after successful handshake
        self.connected.store(true, Ordering::SeqCst);
        Ok(hello)
    }

    /// Performs the HELLO handshake.
    /// This reads the response directly from the stream since read_loop isn't running yet.
    async fn handshake(&self) -> Result<HelloResult, ClientError> {
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        };

        let id = self.next_request_id();
        let request = Request::new(&id, Operation::Hello).with_params(serde_json::to_value(hello)?);
        self.write(&Encoder::encode_request(&request)?).await?;

        let response = self.read_single_response().await?;
        if let Some(error) = response.error {
            return Err(error.into());
        }
        Ok(serde_json::from_value(
            response.result.unwrap_or_default(),
        )?)
    }

    /// Reads a single response from the stream with timeout.
    /// Used during handshake before read_loop is started.
    async fn read_single_response(&self) -> Result<Response, ClientError> {
        let buffer_size = self.config.read_buffer_size;
        let timeout = self.config.request_timeout;

        tokio::time::timeout(timeout, async {
            let mut buf = vec![0u8; buffer_size];

            loop {
                let n = {
                    let mut reader_guard = self.reader.lock().await;
                    let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                    reader.read(&mut buf).await.map_err(ClientError::Io)?
                };

                if n == 0 {
                    tracing::debug!("Connection closed (0 bytes)");
                    return Err(ClientError::ConnectionClosed);
                }

                let mut decoder = self.decoder.lock().await;
                decoder.extend(&buf[..n]);
                if let Some(response) = decoder.decode_response()? {
                    tracing::debug!("Decoded response id={}", response.id);
                    return Ok(response);
                }
            }
        })
        .await
        .map_err(|_| {
            tracing::debug!("Read timeout");
            ClientError::Timeout
        })?
    }

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await.map_err(ClientError::Io)
    }

    /// Sends a request and waits for response.
    pub async fn request(
        &self,
        op: Operation,
        params: serde_json::Value,
    ) -> Result<Response, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_request_id();
        tracing::debug!("Sending request id={} op={}", id, op.as_str());
        let request = Request::new(&id, op).with_params(params);
        let encoded = Encoder::encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        // The read loop may have ended between the check above and the insert.
        if !self.is_connected() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }
        if let Err(e) = self.write(&encoded).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                tracing::debug!("Request id={} channel closed", id);
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a streaming request. Items and the closing response arrive on
    /// the returned stream.
    pub async fn open_stream(
        &self,
        op: Operation,
        params: serde_json::Value,
    ) -> Result<ListStream, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_request_id();
        tracing::debug!("Opening stream id={} op={}", id, op.as_str());
        let request = Request::new(&id, op).with_params(params);
        let encoded = Encoder::encode_request(&request)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().await.insert(id.clone(), tx);

        if !self.is_connected() {
            self.streams.lock().await.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }
        if let Err(e) = self.write(&encoded).await {
            self.streams.lock().await.remove(&id);
            return Err(e);
        }

        Ok(ListStream::new(id, rx))
    }

    /// Reads and dispatches responses and stream items (call this in a
    /// background task). Pending requests and open streams fail with
    /// `ConnectionClosed` once the loop ends.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let result = self.dispatch_incoming().await;
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending().await;
        result
    }

    async fn dispatch_incoming(&self) -> Result<(), ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read(&mut buf).await.map_err(ClientError::Io)?
            };

            tracing::debug!("read_loop: received {} bytes", n);

            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                return Err(ClientError::ConnectionClosed);
            }

            self.decoder.lock().await.extend(&buf[..n]);

            loop {
                let next = self.decoder.lock().await.decode_message()?;
                match next {
                    Some((_, Message::Response(response))) => self.dispatch_response(response).await,
                    Some((_, Message::Item(item))) => self.dispatch_item(item).await,
                    Some((_, Message::Request(request))) => {
                        tracing::warn!("read_loop: unexpected request id={}", request.id);
                    }
                    None => break,
                }
            }
        }
    }

    async fn dispatch_response(&self, response: Response) {
        let pending = self.pending.lock().await.remove(&response.id);
        if let Some(tx) = pending {
            let _ = tx.send(response);
            return;
        }

        let stream = self.streams.lock().await.remove(&response.id);
        match stream {
            Some(tx) => {
                let _ = tx.send(StreamMessage::End(response));
            }
            None => tracing::debug!("read_loop: no pending request for id={}", response.id),
        }
    }

    async fn dispatch_item(&self, item: StreamItem) {
        let stream = self.streams.lock().await.get(&item.id).cloned();
        let Some(tx) = stream else {
            tracing::debug!("read_loop: item for unknown stream id={}", item.id);
            return;
        };

        if tx.send(StreamMessage::Item(item.blog)).is_err() {
            tracing::debug!("read_loop: stream id={} dropped by consumer", item.id);
            self.streams.lock().await.remove(&item.id);
        }
    }

    async fn fail_pending(&self) {
        self.pending.lock().await.clear();
        self.streams.lock().await.clear();
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        // Mark as disconnected first to stop any new requests
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // The reader will get EOF when writer is closed
        let _ = self.reader.lock().await.take();
        self.fail_pending().await;

        tracing::debug!("Connection closed");
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }
}
