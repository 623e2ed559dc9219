//! Coordination Store
//!
//! The hierarchical, versioned key-value tree that every WolfPool process
//! shares. Paths hold opaque byte payloads plus store-maintained metadata,
//! can be ephemeral (bound to the creating session) and sequential
//! (store-assigned, monotonically increasing suffix).
//!
//! `Store` is the seam the rest of the crate talks to. `MemoryStore` runs
//! a session against an in-process `DataTree`; `RemoteStore` talks to a
//! `StoreServer` over TLS.

pub mod protocol;
pub mod tree;
mod memory;
mod remote;
mod server;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use remote::{BoxedStream, ClientOptions, Dialer, RemoteStore, TlsDialer, Transport};
pub use server::StoreServer;
pub use tree::DataTree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::Endpoint;
use crate::error::{Error, Result};
use crate::paths;

/// Store-maintained metadata of a single path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Data version, bumped on every write
    pub version: u32,
    /// Creation time (epoch milliseconds)
    pub created_ms: i64,
    /// Last modification time (epoch milliseconds)
    pub modified_ms: i64,
    /// Transaction that created the path
    pub czxid: u64,
    /// Transaction that last modified the path
    pub mzxid: u64,
    /// Owning session of an ephemeral path
    pub ephemeral_owner: Option<u64>,
    /// Number of direct children
    pub num_children: u32,
    /// Payload size in bytes
    pub data_length: u32,
}

/// How a path is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMode {
    /// Removed when the creating session ends
    pub ephemeral: bool,
    /// Append a store-assigned sequence suffix to the name
    pub sequential: bool,
}

impl CreateMode {
    pub const PERSISTENT: CreateMode = CreateMode { ephemeral: false, sequential: false };
    pub const EPHEMERAL: CreateMode = CreateMode { ephemeral: true, sequential: false };
    pub const PERSISTENT_SEQUENTIAL: CreateMode = CreateMode { ephemeral: false, sequential: true };
    pub const EPHEMERAL_SEQUENTIAL: CreateMode = CreateMode { ephemeral: true, sequential: true };
}

/// Kind of structural change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Changed,
    Deleted,
    /// Events may have been missed; consumers should rescan
    Resync,
}

/// A change notification for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub path: String,
    pub data: Option<Vec<u8>>,
    pub stat: Option<Stat>,
}

impl StoreEvent {
    pub fn created(path: &str, data: &[u8], stat: &Stat) -> Self {
        Self {
            kind: EventKind::Created,
            path: path.to_string(),
            data: Some(data.to_vec()),
            stat: Some(stat.clone()),
        }
    }

    pub fn changed(path: &str, data: &[u8], stat: &Stat) -> Self {
        Self {
            kind: EventKind::Changed,
            path: path.to_string(),
            data: Some(data.to_vec()),
            stat: Some(stat.clone()),
        }
    }

    pub fn deleted(path: &str) -> Self {
        Self {
            kind: EventKind::Deleted,
            path: path.to_string(),
            data: None,
            stat: None,
        }
    }

    pub fn resync(prefix: &str) -> Self {
        Self {
            kind: EventKind::Resync,
            path: prefix.to_string(),
            data: None,
            stat: None,
        }
    }
}

/// Health of the session with the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session established and reachable
    Connected,
    /// Temporarily unreachable, ephemeral data still alive
    Suspended,
    /// Session expired, ephemeral data (locks, registrations) is gone
    Lost,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Suspended => write!(f, "SUSPENDED"),
            SessionState::Lost => write!(f, "LOST"),
        }
    }
}

/// Runs a cleanup action when the owning watcher is dropped
struct CancelGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

enum WatchSource {
    Broadcast(broadcast::Receiver<StoreEvent>),
    Channel(mpsc::UnboundedReceiver<StoreEvent>),
}

/// Subscription to every change at or below a path prefix
pub struct Watcher {
    prefix: String,
    source: WatchSource,
    _cancel: Option<CancelGuard>,
}

impl Watcher {
    pub(crate) fn from_broadcast(prefix: &str, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            prefix: prefix.to_string(),
            source: WatchSource::Broadcast(rx),
            _cancel: None,
        }
    }

    pub(crate) fn from_channel(
        prefix: &str,
        rx: mpsc::UnboundedReceiver<StoreEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            source: WatchSource::Channel(rx),
            _cancel: Some(CancelGuard(Some(Box::new(cancel)))),
        }
    }

    /// Watched prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next event under the prefix; `None` once the subscription is gone
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            let event = match &mut self.source {
                WatchSource::Broadcast(rx) => match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Watch on {} missed {} events", self.prefix, missed);
                        return Some(StoreEvent::resync(&self.prefix));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                WatchSource::Channel(rx) => rx.recv().await?,
            };

            if event.kind == EventKind::Resync || paths::is_under(&event.path, &self.prefix) {
                return Some(event);
            }
        }
    }
}

/// Session-scoped access to the coordination tree
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a path and return its final name (sequence suffix included)
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> Result<String>;

    /// Read a payload and its metadata
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// Metadata of a path, `None` if absent
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Replace a payload, optionally only at an expected version
    async fn set(&self, path: &str, data: Vec<u8>, version: Option<u32>) -> Result<Stat>;

    /// Remove a path, optionally together with everything below it
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    /// Names of the direct children of a path
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to changes at or below a prefix
    async fn watch(&self, prefix: &str) -> Result<Watcher>;

    /// Identifier of the current session
    fn session_id(&self) -> u64;

    /// Session health, updated as it changes
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Replace the server list without dropping the session
    fn set_endpoints(&self, _endpoints: Vec<Endpoint>) -> Result<()> {
        Ok(())
    }

    /// End the session; ephemeral paths go away
    async fn close(&self) -> Result<()>;

    /// Create a persistent path and its parents if missing
    async fn ensure_path(&self, path: &str) -> Result<()> {
        match self.create(path, Vec::new(), CreateMode::PERSISTENT, true).await {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
