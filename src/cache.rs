//! Tree Cache
//!
//! In-process mirror of one collection (nodes or requests), keyed by
//! entity id. A single background task owns every write to the mirror:
//! it subscribes to the collection, loads it, then applies change events
//! as they arrive. Readers only ever get clones.
//!
//! The mirror may lag behind the store; callers that need the
//! authoritative value read through the coordinator without the cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{from_json, Node, NodeRequest, Stateful};
use crate::paths;
use crate::store::{EventKind, Stat, Store, StoreEvent};

/// Pause before resubscribing after the watch failed
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// An entity that can live in a tree cache
pub trait CacheEntry: Clone + Send + Sync + 'static {
    /// Decode the document stored at `path`
    fn decode(id: &str, path: &str, data: &[u8], stat: Stat) -> Result<Self>;

    /// Store version the entry was read at
    fn version(&self) -> Option<u32>;

    /// Take the stored fields of a newer copy in place
    fn refresh_from(&mut self, fresh: Self);
}

impl CacheEntry for Node {
    fn decode(id: &str, path: &str, data: &[u8], stat: Stat) -> Result<Self> {
        let mut node: Node = from_json(path, data)?;
        node.set_id(id);
        node.set_stat(stat);
        Ok(node)
    }

    fn version(&self) -> Option<u32> {
        self.stat().map(|stat| stat.version)
    }

    fn refresh_from(&mut self, fresh: Self) {
        self.update_from(fresh);
    }
}

impl CacheEntry for NodeRequest {
    fn decode(id: &str, path: &str, data: &[u8], stat: Stat) -> Result<Self> {
        let mut request: NodeRequest = from_json(path, data)?;
        request.set_id(id);
        request.set_stat(stat);
        Ok(request)
    }

    fn version(&self) -> Option<u32> {
        self.stat().map(|stat| stat.version)
    }

    fn refresh_from(&mut self, fresh: Self) {
        self.update_from(fresh);
    }
}

/// What an event did to the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// Not about an entry of this collection
    Ignored,
    Inserted,
    Updated,
    /// Stale version, or the entry is locked here
    Skipped,
    Removed,
}

/// Fold one change event into the mirror
pub(crate) fn apply_event<T: CacheEntry>(
    entries: &mut HashMap<String, T>,
    held: &HashSet<String>,
    root: &str,
    event: &StoreEvent,
) -> Applied {
    let Some(id) = paths::direct_child(root, &event.path) else {
        return Applied::Ignored;
    };

    match event.kind {
        EventKind::Deleted => match entries.remove(id) {
            Some(_) => Applied::Removed,
            None => Applied::Ignored,
        },
        EventKind::Created | EventKind::Changed => {
            let (Some(data), Some(stat)) = (&event.data, &event.stat) else {
                return Applied::Ignored;
            };
            if data.is_empty() {
                return Applied::Ignored;
            }
            let fresh = match T::decode(id, &event.path, data, stat.clone()) {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::error!("Unable to cache entry: {}", e);
                    return Applied::Ignored;
                }
            };

            match entries.get_mut(id) {
                Some(cached) => {
                    let newer = match (fresh.version(), cached.version()) {
                        (Some(incoming), Some(current)) => incoming > current,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if newer && !held.contains(id) {
                        cached.refresh_from(fresh);
                        Applied::Updated
                    } else {
                        Applied::Skipped
                    }
                }
                None => {
                    entries.insert(id.to_string(), fresh);
                    Applied::Inserted
                }
            }
        }
        EventKind::Resync => Applied::Ignored,
    }
}

enum Control {
    /// Re-read one entry from the store
    Refresh(String),
}

struct Mirror<T> {
    root: String,
    entries: RwLock<HashMap<String, T>>,
    held: Mutex<HashSet<String>>,
    signal: Mutex<Option<Arc<Notify>>>,
}

impl<T: CacheEntry> Mirror<T> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, T>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, T>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self) -> MutexGuard<'_, Option<Arc<Notify>>> {
        self.signal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, event: &StoreEvent) {
        let applied = {
            let held = self.held().clone();
            apply_event(&mut self.write(), &held, &self.root, event)
        };
        if applied != Applied::Ignored {
            if let Some(signal) = self.signal().as_ref() {
                signal.notify_one();
            }
        }
    }

    /// Replace the mirror contents with a full listing of the collection
    async fn load(&self, store: &dyn Store) -> Result<()> {
        let children = match store.children(&self.root).await {
            Ok(children) => children,
            Err(Error::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut present = HashSet::with_capacity(children.len());
        for child in children {
            if child == paths::LOCK_NAME {
                continue;
            }
            let path = paths::join(&self.root, &child);
            match store.get(&path).await {
                Ok((data, stat)) => {
                    self.apply(&StoreEvent::changed(&path, &data, &stat));
                    present.insert(child);
                }
                Err(Error::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        self.write().retain(|id, _| present.contains(id));
        tracing::debug!("Loaded {} cached entries under {}", present.len(), self.root);
        Ok(())
    }

    async fn refresh(&self, store: &dyn Store, id: &str) {
        let path = paths::join(&self.root, id);
        match store.get(&path).await {
            Ok((data, stat)) => self.apply(&StoreEvent::changed(&path, &data, &stat)),
            Err(Error::NoNode(_)) => self.apply(&StoreEvent::deleted(&path)),
            Err(e) => tracing::error!("Unable to refresh cached entry {}: {}", path, e),
        }
    }
}

/// Mirror of one collection, kept current by a background task
pub struct TreeCache<T> {
    mirror: Arc<Mirror<T>>,
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
}

impl<T: CacheEntry> TreeCache<T> {
    /// Start mirroring the collection under `root`
    pub fn start(store: Arc<dyn Store>, root: &str) -> Self {
        let mirror = Arc::new(Mirror {
            root: root.to_string(),
            entries: RwLock::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            signal: Mutex::new(None),
        });
        let (control, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(Self::listener_task(store, mirror.clone(), control_rx, cancel.clone()));

        Self {
            mirror,
            control,
            cancel,
        }
    }

    async fn listener_task(
        store: Arc<dyn Store>,
        mirror: Arc<Mirror<T>>,
        mut control: mpsc::UnboundedReceiver<Control>,
        cancel: CancellationToken,
    ) {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
            first = false;

            // Subscribe before loading so nothing slips in between
            let mut watcher = match store.watch(&mirror.root).await {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::error!("Unable to watch {}: {}", mirror.root, e);
                    continue;
                }
            };
            if let Err(e) = mirror.load(store.as_ref()).await {
                tracing::error!("Unable to load {}: {}", mirror.root, e);
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    Some(Control::Refresh(id)) = control.recv() => {
                        mirror.refresh(store.as_ref(), &id).await;
                    }
                    event = watcher.recv() => match event {
                        Some(event) if event.kind == EventKind::Resync => {
                            if let Err(e) = mirror.load(store.as_ref()).await {
                                tracing::error!("Unable to reload {}: {}", mirror.root, e);
                            }
                        }
                        Some(event) => mirror.apply(&event),
                        None => {
                            tracing::warn!("Watch on {} ended, resubscribing", mirror.root);
                            break;
                        }
                    },
                }
            }
        }
    }

    /// Token that stops the background task
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.mirror.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.mirror.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.mirror.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mirror.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.read().is_empty()
    }

    /// Freeze an entry while this process holds its lock
    pub fn hold(&self, id: &str) {
        self.mirror.held().insert(id.to_string());
    }

    /// Unfreeze an entry and catch up with the store
    pub fn release(&self, id: &str) {
        if self.mirror.held().remove(id) {
            let _ = self.control.send(Control::Refresh(id.to_string()));
        }
    }

    /// Signal poked whenever an entry is added, updated or removed
    pub fn set_signal(&self, signal: Option<Arc<Notify>>) {
        *self.mirror.signal() = signal;
    }
}

impl<T> Drop for TreeCache<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
