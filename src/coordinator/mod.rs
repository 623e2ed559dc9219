//! Coordinator
//!
//! The API builders, launchers and schedulers use to share state: CRUD
//! and queries for every entity, entity locks, and elections. Paths come
//! from `paths`, documents from `model`, I/O goes through the session
//! held by the `ConnectionManager`.
//!
//! Reads of missing entities return `None` or an empty collection.
//! Connectivity errors propagate; nothing here retries data operations.

mod images;
mod launchers;
mod nodes;
mod requests;

pub use images::ProviderUploads;
pub use launchers::STATS_ELECTION;
pub use requests::DEFAULT_PRIORITY;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::cache::TreeCache;
use crate::config::CoordinationConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::lock::{Lock, LockHandle};
use crate::model::{from_json, Node, NodeRequest, Stateful};
use crate::paths;
use crate::store::{Stat, Store};

/// Window in which a DELETING node blocks further unused-node deletes
pub const DEFAULT_MAX_DELETE_AGE: Duration = Duration::from_secs(5 * 60);

struct Caches {
    nodes: TreeCache<Node>,
    requests: TreeCache<NodeRequest>,
}

impl Caches {
    fn is_running(&self) -> bool {
        !self.nodes.cancel_token().is_cancelled() && !self.requests.cancel_token().is_cancelled()
    }
}

/// Entry point for everything stored in the coordination tree
pub struct Coordinator {
    conn: Arc<ConnectionManager>,
    enable_cache: bool,
    max_delete_age: Duration,
    caches: Mutex<Option<Arc<Caches>>>,
    node_stats: Mutex<Option<Arc<Notify>>>,
}

impl Coordinator {
    pub fn new(conn: Arc<ConnectionManager>, enable_cache: bool, max_delete_age: Duration) -> Self {
        Self {
            conn,
            enable_cache,
            max_delete_age,
            caches: Mutex::new(None),
            node_stats: Mutex::new(None),
        }
    }

    /// Coordinator for a connection; with caching enabled and a session
    /// already established the caches start right away
    pub fn from_config(conn: Arc<ConnectionManager>, config: &CoordinationConfig) -> Self {
        let coordinator = Self::new(conn, config.enable_cache, config.max_delete_age());
        coordinator.start_caches();
        coordinator
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    fn store(&self) -> Result<Arc<dyn Store>> {
        self.conn.store()
    }

    fn caches_slot(&self) -> MutexGuard<'_, Option<Arc<Caches>>> {
        self.caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Running caches, started on first use of the current session
    fn caches(&self) -> Option<Arc<Caches>> {
        if !self.enable_cache {
            return None;
        }
        let mut slot = self.caches_slot();
        if let Some(caches) = slot.as_ref() {
            if caches.is_running() {
                return Some(caches.clone());
            }
        }

        let store = self.conn.store().ok()?;
        let caches = Arc::new(Caches {
            nodes: TreeCache::start(store.clone(), paths::NODE_ROOT),
            requests: TreeCache::start(store, paths::REQUEST_ROOT),
        });
        caches.nodes.set_signal(self.stats_signal());
        self.conn.register_cache(caches.nodes.cancel_token());
        self.conn.register_cache(caches.requests.cancel_token());
        tracing::debug!("Started node and request caches");

        *slot = Some(caches.clone());
        Some(caches)
    }

    /// Caches already running, without starting them
    fn started_caches(&self) -> Option<Arc<Caches>> {
        self.caches_slot().clone()
    }

    fn stats_signal(&self) -> Option<Arc<Notify>> {
        self.node_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Start mirroring nodes and requests now rather than on the first
    /// cached read. Returns whether caches are running; false when they
    /// are disabled or there is no session yet.
    pub fn start_caches(&self) -> bool {
        self.caches().is_some()
    }

    /// Signal poked on every change to the node cache. Starts the caches
    /// when they are enabled, so the signal fires without cached reads.
    pub fn set_node_stats_event(&self, signal: Option<Arc<Notify>>) {
        *self
            .node_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = signal.clone();
        if let Some(caches) = self.caches() {
            caches.nodes.set_signal(signal);
        }
    }

    /// Stop the caches; they restart on the next cached read
    pub fn stop_caches(&self) {
        if let Some(caches) = self.caches_slot().take() {
            caches.nodes.stop();
            caches.requests.stop();
        }
    }

    // ========== Shared plumbing ==========

    /// Payload and stat of a path, `None` when absent
    async fn read(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>> {
        match self.store()?.get(path).await {
            Ok(found) => Ok(Some(found)),
            Err(Error::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Children of a path, empty when it does not exist
    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.store()?.children(path).await {
            Ok(children) => Ok(children),
            Err(Error::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Children of a collection, without its lock entry
    async fn entries(&self, path: &str) -> Result<Vec<String>> {
        let mut children = self.children(path).await?;
        children.retain(|child| child != paths::LOCK_NAME);
        Ok(children)
    }

    /// Remove a path and everything below it, ignoring absence
    async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        match self.store()?.delete(path, recursive).await {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Acquire the lock at `path`, logging when its target is gone
    async fn lock_path(
        &self,
        path: &str,
        create_parents: bool,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        let lock = Lock::new(self.store()?, path).create_parents(create_parents);
        match lock.acquire(blocking, timeout).await {
            Err(Error::LockTargetMissing(target)) => {
                tracing::error!("Lock target not found: {}", target);
                Err(Error::LockTargetMissing(target))
            }
            other => other,
        }
    }
}

fn required_id(kind: &'static str, id: Option<&str>) -> Result<String> {
    id.map(str::to_string).ok_or(Error::MissingId(kind))
}

/// Decode a stored document; failures are logged and read as absent
fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Option<T> {
    match from_json(path, data) {
        Ok(entity) => Some(entity),
        Err(e) => {
            tracing::error!("{}", e);
            None
        }
    }
}

/// Newest first by state time, at most `count`
fn most_recent<T: Stateful>(mut entities: Vec<T>, count: Option<usize>) -> Vec<T> {
    entities.sort_by(|a, b| {
        let a = a.state_time().unwrap_or(f64::MIN);
        let b = b.state_time().unwrap_or(f64::MIN);
        b.total_cmp(&a)
    });
    if let Some(count) = count {
        entities.truncate(count);
    }
    entities
}

/// Lazy walk over a listing; each id is fetched only when polled and
/// ids that vanished in between are skipped
fn lazy_entities<'a, T, L, F, Fut>(listing: L, fetch: F) -> BoxStream<'a, Result<T>>
where
    T: Send + 'a,
    L: Future<Output = Result<Vec<String>>> + Send + 'a,
    F: Fn(String) -> Fut + Send + Sync + 'a,
    Fut: Future<Output = Result<Option<T>>> + Send + 'a,
{
    let fetch = Arc::new(fetch);
    stream::once(listing)
        .map(move |listing| match listing {
            Ok(ids) => {
                let fetch = fetch.clone();
                stream::iter(ids)
                    .then(move |id| (*fetch)(id))
                    .filter_map(|entity| futures::future::ready(entity.transpose()))
                    .boxed()
            }
            Err(e) => stream::once(futures::future::ready(Err(e))).boxed(),
        })
        .flatten()
        .boxed()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::MemoryStore;

    /// A coordinator on its own session of `store`'s tree
    pub(crate) fn coordinator_on(store: Arc<MemoryStore>, enable_cache: bool) -> Coordinator {
        let conn = Arc::new(ConnectionManager::new());
        conn.attach(store);
        Coordinator::new(conn, enable_cache, DEFAULT_MAX_DELETE_AGE)
    }

    pub(crate) fn coordinator() -> (Coordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (coordinator_on(store.clone(), false), store)
    }
}
