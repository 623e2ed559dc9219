//! In-process Store
//!
//! A single session against a `DataTree` living in the same process.
//! Several `MemoryStore`s sharing one tree behave like several processes
//! sharing one coordination cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{CreateMode, DataTree, SessionState, Stat, Store, Watcher};
use crate::error::Result;

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Session on an in-process tree
pub struct MemoryStore {
    tree: Arc<DataTree>,
    session: u64,
    state: watch::Sender<SessionState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Open a session on a fresh, private tree
    pub fn new() -> Self {
        Self::with_tree(Arc::new(DataTree::new()))
    }

    /// Open a session on a shared tree
    pub fn with_tree(tree: Arc<DataTree>) -> Self {
        Self::open(tree, false)
    }

    /// Open a read-only session on a shared tree
    pub fn read_only(tree: Arc<DataTree>) -> Self {
        Self::open(tree, true)
    }

    fn open(tree: Arc<DataTree>, read_only: bool) -> Self {
        let session = tree.open_session(read_only, DEFAULT_SESSION_TIMEOUT);
        let (state, _) = watch::channel(SessionState::Connected);
        Self { tree, session, state }
    }

    /// The tree this session runs against
    pub fn tree(&self) -> &Arc<DataTree> {
        &self.tree
    }

    /// Expire the session as if the store had given up on it
    pub fn expire(&self) {
        self.tree.close_session(self.session);
        self.state.send_replace(SessionState::Lost);
    }

    /// Flip between SUSPENDED and CONNECTED without touching the session
    pub fn set_suspended(&self, suspended: bool) {
        let state = if suspended {
            SessionState::Suspended
        } else {
            SessionState::Connected
        };
        self.state.send_replace(state);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> Result<String> {
        self.tree.create(self.session, path, data, mode, make_parents)
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.tree.get(self.session, path)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.tree.exists(self.session, path)
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: Option<u32>) -> Result<Stat> {
        self.tree.set(self.session, path, data, version)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.tree.delete(self.session, path, recursive)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.tree.children(self.session, path)
    }

    async fn watch(&self, prefix: &str) -> Result<Watcher> {
        Ok(Watcher::from_broadcast(prefix, self.tree.subscribe()))
    }

    fn session_id(&self) -> u64 {
        self.session
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.tree.close_session(self.session);
        self.state.send_replace(SessionState::Lost);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::EventKind;

    #[tokio::test]
    async fn test_shared_tree_sessions() {
        let tree = Arc::new(DataTree::new());
        let a = MemoryStore::with_tree(tree.clone());
        let b = MemoryStore::with_tree(tree);

        a.create("/launchers/l1", b"{}".to_vec(), CreateMode::EPHEMERAL, true)
            .await
            .unwrap();
        assert!(b.exists("/launchers/l1").await.unwrap().is_some());

        a.expire();
        assert!(b.exists("/launchers/l1").await.unwrap().is_none());
        assert_eq!(*a.session_state().borrow(), SessionState::Lost);
        assert!(matches!(a.get("/launchers").await, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_watch_filters_prefix() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("/nodepool/nodes").await.unwrap();

        store.ensure_path("/nodepool/requests").await.unwrap();
        store
            .create("/nodepool/nodes/", b"{}".to_vec(), CreateMode::PERSISTENT_SEQUENTIAL, true)
            .await
            .unwrap();

        // Creating the parent chain reports /nodepool/nodes itself first
        let event = watcher.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.path, "/nodepool/nodes");

        let event = watcher.recv().await.unwrap();
        assert_eq!(event.path, "/nodepool/nodes/0000000001");
        assert_eq!(event.data.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_read_only_session() {
        let tree = Arc::new(DataTree::new());
        let store = MemoryStore::read_only(tree);
        assert!(matches!(
            store.ensure_path("/nodepool").await,
            Err(Error::ReadOnly)
        ));
    }
}
