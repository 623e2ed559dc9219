//! Distributed Locks
//!
//! Exclusive locks built from ephemeral sequential contender entries under
//! a lock path. The contender with the lowest sequence holds the lock;
//! everyone else waits for the deletion of the contender directly ahead
//! of them. A lost session drops its contenders with it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::paths;
use crate::store::{CreateMode, EventKind, Store};

/// Marker separating the random prefix from the sequence in contender names
const CONTENDER_MARKER: &str = "__lock__";

/// Sequence suffix width assigned by the store
const SEQUENCE_WIDTH: usize = 10;

fn sequence_of(name: &str) -> &str {
    name.get(name.len().saturating_sub(SEQUENCE_WIDTH)..)
        .unwrap_or(name)
}

/// Contender names under a lock path, in acquisition order
fn sort_contenders(children: Vec<String>) -> Vec<String> {
    let mut contenders: Vec<String> = children
        .into_iter()
        .filter(|name| name.contains(CONTENDER_MARKER))
        .collect();
    contenders.sort_by(|a, b| sequence_of(a).cmp(sequence_of(b)));
    contenders
}

fn delete_in_background(store: Arc<dyn Store>, path: String) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        match store.delete(&path, false).await {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => tracing::warn!("Failed to remove lock contender {}: {}", path, e),
        }
    });
}

/// Our contender entry, removed unless handed over to a `LockHandle`
struct Contender {
    store: Arc<dyn Store>,
    path: Option<String>,
}

impl Contender {
    async fn withdraw(mut self) -> Result<()> {
        match self.path.take() {
            Some(path) => match self.store.delete(&path, false).await {
                Ok(()) | Err(Error::NoNode(_)) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }

    fn into_path(mut self) -> Option<String> {
        self.path.take()
    }
}

impl Drop for Contender {
    fn drop(&mut self) {
        // Acquisition was abandoned mid-way
        if let Some(path) = self.path.take() {
            delete_in_background(self.store.clone(), path);
        }
    }
}

/// Lock recipe bound to one path
pub struct Lock {
    store: Arc<dyn Store>,
    path: String,
    identifier: String,
    create_parents: bool,
}

impl Lock {
    pub fn new(store: Arc<dyn Store>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            identifier: String::new(),
            create_parents: false,
        }
    }

    /// Data stored in our contender entry
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Create missing ancestors of the lock path instead of treating
    /// them as a vanished lock target
    pub fn create_parents(mut self, create: bool) -> Self {
        self.create_parents = create;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn ensure_lock_path(&self) -> Result<()> {
        if self.create_parents {
            return self.store.ensure_path(&self.path).await;
        }
        match self
            .store
            .create(&self.path, Vec::new(), CreateMode::PERSISTENT, false)
            .await
        {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(Error::NoNode(_)) => Err(Error::LockTargetMissing(
                paths::parent(&self.path).to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Acquire the lock.
    ///
    /// Non-blocking attempts fail with `LockUnavailable` when another
    /// session holds it. Blocking attempts wait at most `timeout` (forever
    /// for `None`) and fail with `Timeout`. A missing lock target fails with
    /// `LockTargetMissing`.
    pub async fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<LockHandle> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.ensure_lock_path().await?;

        // Watch before queueing so no predecessor deletion goes unseen
        let mut watcher = self.store.watch(&self.path).await?;

        let prefix = format!("{}/{}{}", self.path, Uuid::new_v4().simple(), CONTENDER_MARKER);
        let node = match self
            .store
            .create(
                &prefix,
                self.identifier.as_bytes().to_vec(),
                CreateMode::EPHEMERAL_SEQUENTIAL,
                false,
            )
            .await
        {
            Ok(node) => node,
            Err(Error::NoNode(_)) => return Err(Error::LockTargetMissing(self.path.clone())),
            Err(e) => return Err(e),
        };
        let name = paths::basename(&node).to_string();
        let contender = Contender {
            store: self.store.clone(),
            path: Some(node.clone()),
        };

        loop {
            let children = match self.store.children(&self.path).await {
                Ok(children) => sort_contenders(children),
                Err(Error::NoNode(_)) => {
                    contender.withdraw().await?;
                    return Err(Error::LockTargetMissing(self.path.clone()));
                }
                Err(e) => return Err(e),
            };

            let position = match children.iter().position(|c| *c == name) {
                Some(position) => position,
                // Our ephemeral entry is gone with the session
                None => return Err(Error::SessionExpired),
            };

            if position == 0 {
                tracing::debug!("Acquired lock {}", self.path);
                let node = contender.into_path();
                return Ok(LockHandle::new(self.store.clone(), self.path.clone(), node));
            }

            if !blocking {
                contender.withdraw().await?;
                return Err(Error::LockUnavailable(self.path.clone()));
            }

            let predecessor = paths::join(&self.path, &children[position - 1]);
            if self.store.exists(&predecessor).await?.is_none() {
                continue;
            }

            loop {
                let event = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, watcher.recv()).await {
                        Ok(event) => event,
                        Err(_) => {
                            contender.withdraw().await?;
                            return Err(Error::Timeout(self.path.clone()));
                        }
                    },
                    None => watcher.recv().await,
                };
                match event {
                    Some(event) if event.kind == EventKind::Resync => break,
                    Some(event) if event.kind == EventKind::Deleted && event.path == predecessor => {
                        break
                    }
                    Some(_) => continue,
                    None => return Err(Error::ConnectionLoss),
                }
            }
        }
    }

    /// Identifiers of every contender, holder first
    pub async fn contenders(&self) -> Result<Vec<String>> {
        let children = match self.store.children(&self.path).await {
            Ok(children) => sort_contenders(children),
            Err(Error::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut identifiers = Vec::with_capacity(children.len());
        for child in children {
            match self.store.get(&paths::join(&self.path, &child)).await {
                Ok((data, _)) => identifiers.push(String::from_utf8_lossy(&data).into_owned()),
                // Released while we were looking
                Err(Error::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(identifiers)
    }
}

struct HandleInner {
    store: Arc<dyn Store>,
    path: String,
    node: Mutex<Option<String>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let node = self
            .node
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(node) = node {
            delete_in_background(self.store.clone(), node);
        }
    }
}

/// A held lock. Clones share the same hold; the lock is released by
/// `release()` or when the last clone is dropped.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

impl LockHandle {
    fn new(store: Arc<dyn Store>, path: String, node: Option<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                store,
                path,
                node: Mutex::new(node),
            }),
        }
    }

    /// The locked path
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_held(&self) -> bool {
        self.take_or_peek(false).is_some()
    }

    fn take_or_peek(&self, take: bool) -> Option<String> {
        let mut node = self
            .inner
            .node
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if take {
            node.take()
        } else {
            node.clone()
        }
    }

    /// Release the lock; releasing twice is a no-op
    pub async fn release(&self) -> Result<()> {
        let Some(node) = self.take_or_peek(true) else {
            return Ok(());
        };
        match self.inner.store.delete(&node, false).await {
            Ok(()) | Err(Error::NoNode(_)) => {
                tracing::debug!("Released lock {}", self.inner.path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.inner.path)
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::eventually;
    use crate::store::{DataTree, MemoryStore};

    fn sessions() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        let tree = Arc::new(DataTree::new());
        (
            Arc::new(MemoryStore::with_tree(tree.clone())),
            Arc::new(MemoryStore::with_tree(tree)),
        )
    }

    const LOCK_PATH: &str = "/nodepool/images/fake/builds/lock";

    #[tokio::test]
    async fn test_non_blocking_contention() {
        let (a, b) = sessions();
        let first = Lock::new(a, LOCK_PATH).create_parents(true);
        let second = Lock::new(b, LOCK_PATH).create_parents(true);

        let handle = first.acquire(false, None).await.unwrap();
        assert!(handle.is_held());
        let err = second.acquire(false, None).await.unwrap_err();
        assert!(matches!(err, Error::LockUnavailable(p) if p == LOCK_PATH));

        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert!(!handle.is_held());

        let handle = second.acquire(false, None).await.unwrap();
        assert!(handle.is_held());
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let (a, b) = sessions();
        let handle = Lock::new(a, LOCK_PATH)
            .create_parents(true)
            .acquire(true, None)
            .await
            .unwrap();

        let waiter = tokio::spawn(async move {
            Lock::new(b, LOCK_PATH)
                .create_parents(true)
                .acquire(true, Some(Duration::from_secs(5)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        handle.release().await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_held());
    }

    #[tokio::test]
    async fn test_timeout_withdraws_contender() {
        let (a, b) = sessions();
        let _held = Lock::new(a.clone(), LOCK_PATH)
            .create_parents(true)
            .acquire(true, None)
            .await
            .unwrap();

        let err = Lock::new(b, LOCK_PATH)
            .create_parents(true)
            .acquire(true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(a.children(LOCK_PATH).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_target() {
        let (a, _) = sessions();
        let err = Lock::new(a, paths::node_lock("0000000009"))
            .acquire(true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTargetMissing(p) if p == "/nodepool/nodes/0000000009"));
    }

    #[tokio::test]
    async fn test_session_loss_frees_lock() {
        let (a, b) = sessions();
        let _held = Lock::new(a.clone(), LOCK_PATH)
            .create_parents(true)
            .acquire(true, None)
            .await
            .unwrap();

        let waiter = tokio::spawn(async move {
            Lock::new(b, LOCK_PATH).create_parents(true).acquire(true, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.expire();

        assert!(waiter.await.unwrap().unwrap().is_held());
    }

    #[tokio::test]
    async fn test_dropped_handle_releases() {
        let (a, b) = sessions();
        let handle = Lock::new(a, LOCK_PATH)
            .create_parents(true)
            .acquire(false, None)
            .await
            .unwrap();
        drop(handle);

        let observer = b.clone();
        eventually(move || {
            let children = observer.tree().children(observer.session_id(), LOCK_PATH);
            children.map(|c| c.is_empty()).unwrap_or(false)
        })
        .await;
        assert!(Lock::new(b, LOCK_PATH).acquire(false, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_contenders_in_order() {
        let (a, b) = sessions();
        let first = Lock::new(a, LOCK_PATH)
            .create_parents(true)
            .with_identifier("builder-1");
        let second = Lock::new(b, LOCK_PATH)
            .create_parents(true)
            .with_identifier("builder-2");

        let _handle = first.acquire(true, None).await.unwrap();
        let pending = tokio::spawn(async move { second.acquire(true, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first.contenders().await.unwrap(), vec!["builder-1", "builder-2"]);
        pending.abort();
    }

    #[test]
    fn test_sort_contenders() {
        let sorted = sort_contenders(vec![
            "bbb__lock__0000000003".into(),
            "aaa__lock__0000000010".into(),
            "ccc__lock__0000000001".into(),
            "stray".into(),
        ]);
        assert_eq!(
            sorted,
            vec![
                "ccc__lock__0000000001",
                "bbb__lock__0000000003",
                "aaa__lock__0000000010"
            ]
        );
    }
}
