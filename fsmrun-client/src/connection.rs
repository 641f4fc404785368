//! A single TCP connection to a running machine.

use crate::error::ClientError;
use fsmrun_protocol::{encode_line, Command, Event, LineDecoder, DEFAULT_PORT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

/// Bytes read from the socket per call, by default.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

pub const MIN_READ_BUFFER_SIZE: usize = 1024;

pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Where and how long to wait.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long request helpers wait for their answer.
    pub request_timeout: Duration,
    /// Clamped to `MIN_READ_BUFFER_SIZE..=MAX_READ_BUFFER_SIZE`.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
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

/// Default capacity for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A connection to an fsmrun instance.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending commands).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half of the stream (owned by the read loop).
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Cleared by `close` and on EOF.
    connected: AtomicBool,
    /// Every event received from the server except `ping`.
    events: broadcast::Sender<Event>,
}

impl Connection {
    /// Call [`connect`](Self::connect) before sending.
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Subscribes to server events.
    ///
    /// Only events received after subscribing are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Opens the socket, failing after `connect_timeout`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Dialing {}", self.config.addr);

        let stream = tokio::time::timeout(
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

        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);

        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Sends one command.
    pub async fn send(&self, command: &Command) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let line = encode_line(&command.to_xml());
        tracing::debug!("-> {}", command.type_name());

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = writer.write_all(&line).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ClientError::Io(e));
        }
        Ok(())
    }

    /// Reads and dispatches server events (call this in a background task).
    ///
    /// Answers `ping` with `pong` and publishes every other event to
    /// subscribers. Returns when the server closes the connection.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        tracing::debug!("read_loop started");
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(ClientError::Io(e));
                }
            };

            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                self.connected.store(false, Ordering::SeqCst);
                return Ok(());
            }

            decoder.extend(&buf[..n]);
            loop {
                let line = match decoder.decode_line() {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("read_loop: discarding line: {}", e);
                        continue;
                    }
                };

                match Event::parse(&line) {
                    Ok(Event::Ping) => {
                        tracing::debug!("read_loop: ping");
                        self.send(&Command::Pong).await?;
                    }
                    Ok(event) => {
                        tracing::debug!("read_loop: {} event", event.type_name());
                        // No subscribers is fine.
                        let _ = self.events.send(event);
                    }
                    Err(e) => {
                        tracing::warn!("read_loop: skipping unreadable event: {}", e);
                    }
                }
            }
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection to {}", self.config.addr);
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        tracing::debug!("Connection closed");
        Ok(())
    }
}
