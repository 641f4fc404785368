//! Registry of connected controllers and their outbound queues.

use crate::session::ClientId;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Outbound side of one connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub addr: SocketAddr,
    pub outbox: mpsc::Sender<Bytes>,
}

/// Connected controllers, keyed by session id.
///
/// Owned by the runtime loop. Sends never wait: a client whose queue is full
/// or closed is removed.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client. Replaces any handle already registered under `id`.
    pub fn register(&mut self, id: ClientId, handle: ClientHandle) {
        debug!("Registered client {} ({})", id, handle.addr);
        self.clients.insert(id, handle);
    }

    /// Removes a client, closing its outbox.
    pub fn unregister(&mut self, id: &ClientId) -> Option<ClientHandle> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Queues `line` for every client.
    ///
    /// Returns the ids of clients that were dropped because they could not
    /// accept it.
    pub fn broadcast(&mut self, line: &Bytes) -> Vec<ClientId> {
        let mut dropped = Vec::new();
        for (id, handle) in &self.clients {
            if let Err(e) = handle.outbox.try_send(line.clone()) {
                log_send_failure(id, handle, &e);
                dropped.push(*id);
            }
        }
        for id in &dropped {
            self.clients.remove(id);
        }
        dropped
    }

    /// Queues `line` for one client. Returns false (and drops the client) if
    /// it could not accept it, or if it is not registered.
    pub fn send_to(&mut self, id: &ClientId, line: Bytes) -> bool {
        let Some(handle) = self.clients.get(id) else {
            return false;
        };
        match handle.outbox.try_send(line) {
            Ok(()) => true,
            Err(e) => {
                log_send_failure(id, handle, &e);
                self.clients.remove(id);
                false
            }
        }
    }

    /// Removes every client, closing all outboxes.
    pub fn clear(&mut self) {
        self.clients.clear();
    }
}

fn log_send_failure(id: &ClientId, handle: &ClientHandle, error: &TrySendError<Bytes>) {
    match error {
        TrySendError::Full(_) => {
            warn!("Dropping slow client {} ({}): outbox full", id, handle.addr)
        }
        TrySendError::Closed(_) => {
            debug!("Dropping client {} ({}): connection closed", id, handle.addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn handle(capacity: usize) -> (ClientHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = ClientHandle {
            addr: "127.0.0.1:40000".parse().unwrap(),
            outbox: tx,
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let mut registry = ClientRegistry::new();
        let (h1, mut rx1) = handle(4);
        let (h2, mut rx2) = handle(4);
        registry.register(Uuid::new_v4(), h1);
        registry.register(Uuid::new_v4(), h2);

        let dropped = registry.broadcast(&Bytes::from_static(b"hello\n"));
        assert!(dropped.is_empty());
        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"hello\n"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"hello\n"));
    }

    #[tokio::test]
    async fn test_full_outbox_drops_client() {
        let mut registry = ClientRegistry::new();
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let (h1, _rx1) = handle(1);
        let (h2, mut rx2) = handle(4);
        registry.register(slow, h1);
        registry.register(fast, h2);

        assert!(registry.broadcast(&Bytes::from_static(b"a\n")).is_empty());
        let dropped = registry.broadcast(&Bytes::from_static(b"b\n"));
        assert_eq!(dropped, vec![slow]);
        assert!(!registry.contains(&slow));
        assert!(registry.contains(&fast));

        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"a\n"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"b\n"));
    }

    #[test]
    fn test_closed_outbox_drops_client() {
        let mut registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (h, rx) = handle(4);
        registry.register(id, h);
        drop(rx);

        assert!(!registry.send_to(&id, Bytes::from_static(b"x\n")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_to_unknown_client() {
        let mut registry = ClientRegistry::new();
        assert!(!registry.send_to(&Uuid::new_v4(), Bytes::from_static(b"x\n")));
    }

    #[test]
    fn test_unregister_and_clear() {
        let mut registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (h, _rx) = handle(1);
        registry.register(id, h.clone());
        registry.register(Uuid::new_v4(), h);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        registry.clear();
        assert!(registry.is_empty());
    }
}
