//! Negotiator registry — who is registered and how to reach their connection.
//!
//! Maps peer name to the PeerRecord built at registration plus a relay handle
//! for pushing offers onto that peer's still-open registration connection.
//! One mutex guards the whole map so a by-name read-modify-write is atomic.
//! The map itself is never handed out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use punch_core::wire::{PeerRecord, Reply};

/// Identifies one accepted negotiator connection.
pub type ConnId = u64;

/// Back-reference to a registration connection.
///
/// Replies sent through it are queued for the connection's writer task; the
/// handle never owns or closes the connection itself.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<Reply>,
}

/// The connection behind a relay handle has stopped writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct RelayClosed(pub ConnId);

impl RelayHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<Reply>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue a reply for the connection's writer.
    pub fn send(&self, reply: Reply) -> Result<(), RelayClosed> {
        self.tx.send(reply).map_err(|_| RelayClosed(self.conn_id))
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub record: PeerRecord,
    pub relay: RelayHandle,
}

/// Shared registry handle.
pub type SharedRegistry = Arc<Registry>;

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Self::new())
    }

    /// Store `entry` under its record's name, replacing any previous entry.
    /// Returns the replaced entry.
    pub async fn insert_or_replace(&self, entry: RegistryEntry) -> Option<RegistryEntry> {
        let name = entry.record.name().to_owned();
        self.entries.lock().await.insert(name, entry)
    }

    pub async fn lookup(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.lock().await.get(name).cloned()
    }

    /// Remove `name` only if it is still owned by `conn_id`.
    ///
    /// A newer registration under the same name from another connection is
    /// left alone. Returns true if an entry was removed.
    pub async fn evict(&self, name: &str, conn_id: ConnId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) if entry.relay.conn_id() == conn_id => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
