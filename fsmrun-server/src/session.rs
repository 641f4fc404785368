//! Per-connection session state.
//!
//! A `Session` is owned by its connection task; the runtime loop only knows
//! the connection by id through the [`ClientRegistry`](crate::ClientRegistry).

use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique connection identifier.
pub type ClientId = Uuid;

/// A connected controller.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: ClientId,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Commands received on this connection.
    command_count: u64,

    /// Session creation time.
    created_at: Instant,

    /// Last time anything was received.
    last_activity: Instant,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            command_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Records a received command (including `pong`).
    pub fn record_command(&mut self) {
        self.command_count += 1;
        self.touch();
    }

    /// Records inbound traffic that did not decode to a command.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Returns the command count.
    pub fn command_count(&self) -> u64 {
        self.command_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Instant at which the session counts as idle, if a timeout applies.
    pub fn idle_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|t| self.last_activity + t)
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
