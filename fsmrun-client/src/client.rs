//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use fsmrun_protocol::{Command, Event, StatusReport, HELP_HEADING};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// High-level client for an fsmrun instance.
///
/// `connect` spawns the connection's read loop; commands that expect an
/// answer wait for the matching event on the event stream.
pub struct Client {
    conn: Arc<Connection>,
    reader: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            reader: Mutex::new(None),
        }
    }

    /// Connects to the server and starts reading events.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let conn = Arc::clone(&self.conn);
        let handle = tokio::spawn(async move {
            let result = conn.read_loop().await;
            if let Err(ref e) = result {
                tracing::debug!("read loop ended: {}", e);
            }
            result
        });
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Subscribes to every event pushed by the server.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.conn.subscribe()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Sends `command` and returns the first event accepted by `pick`.
    ///
    /// An `error` event received first is returned as `ClientError::ServerError`.
    async fn request<T>(
        &self,
        command: Command,
        pick: impl Fn(Event) -> Option<T>,
    ) -> Result<T, ClientError> {
        let mut events = self.conn.subscribe();
        self.conn.send(&command).await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(Event::Error { code, message }) => {
                        return Err(ClientError::ServerError { code, message })
                    }
                    Ok(event) => {
                        if let Some(value) = pick(event) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("event stream lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::ConnectionClosed)
                    }
                }
            }
        };

        tokio::time::timeout(self.conn.config().request_timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Writes an input or variable. Resulting events arrive on the event stream.
    pub async fn set(&self, name: &str, value: &str) -> Result<(), ClientError> {
        self.conn
            .send(&Command::Set {
                name: name.to_string(),
                value: value.to_string(),
            })
            .await
    }

    /// Pulses an input.
    pub async fn call(&self, name: &str) -> Result<(), ClientError> {
        self.conn
            .send(&Command::Call {
                name: name.to_string(),
            })
            .await
    }

    /// Requests a snapshot of the running machine.
    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        self.request(Command::Status, |event| match event {
            Event::Status(report) => Some(report),
            _ => None,
        })
        .await
    }

    /// Requests the usage text.
    ///
    /// Machine logs broadcast meanwhile are skipped.
    pub async fn help(&self) -> Result<String, ClientError> {
        self.request(Command::Help, |event| match event {
            Event::Log { message } if message.starts_with(HELP_HEADING) => Some(message),
            _ => None,
        })
        .await
    }

    /// Requests the running model document.
    pub async fn request_model(&self) -> Result<String, ClientError> {
        self.request(Command::RequestModel, |event| match event {
            Event::Fsm { model } => Some(model),
            _ => None,
        })
        .await
    }

    /// Restarts the machine from its initial state.
    pub async fn reset(&self) -> Result<(), ClientError> {
        self.conn.send(&Command::Reset).await
    }

    /// Asks the server to close this connection, then closes it locally.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let acknowledged = self
            .request(Command::Disconnect, |event| match event {
                Event::Disconnect { .. } => Some(()),
                _ => None,
            })
            .await;
        if let Err(ref e) = acknowledged {
            tracing::debug!("disconnect not acknowledged: {}", e);
        }
        self.close().await
    }

    /// Stops the runtime.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.conn.send(&Command::Shutdown).await
    }
}
