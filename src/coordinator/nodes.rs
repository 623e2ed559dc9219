//! Nodes

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;

use super::{decode, lazy_entities, required_id, Coordinator};
use crate::error::{Error, Result};
use crate::model::{from_json, now, to_json, Node, NodeState, Stateful};
use crate::paths;
use crate::store::{CreateMode, EventKind, Stat};

/// Take a watched node's stored fields; undecodable data keeps the old ones
fn refresh_watched(node: &mut Node, path: &str, data: &[u8], stat: Stat) {
    if !data.is_empty() {
        match from_json::<Node>(path, data) {
            Ok(fresh) => node.update_from(fresh),
            Err(e) => tracing::error!("{}", e),
        }
    }
    node.set_stat(stat);
}

/// Render an age in seconds as `DD:HH:MM:SS`
fn format_age(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (minutes, secs) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    let (days, hours) = (hours / 24, hours % 24);
    format!("{:02}:{:02}:{:02}:{:02}", days, hours, minutes, secs)
}

impl Coordinator {
    /// Ids of every node
    pub async fn node_ids(&self) -> Result<Vec<String>> {
        self.children(paths::NODE_ROOT).await
    }

    /// A node by id. With `cached`, the mirror is consulted first and the
    /// store only when the mirror has not seen the node yet.
    pub async fn get_node(&self, id: &str, cached: bool) -> Result<Option<Node>> {
        if cached {
            let hit = self.caches().and_then(|caches| caches.nodes.get(id));
            if hit.is_some() {
                return Ok(hit);
            }
        }

        let path = paths::node(id);
        let Some((data, stat)) = self.read(&path).await? else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(decode::<Node>(&path, &data).map(|mut node| {
            node.set_id(id);
            node.set_stat(stat);
            node
        }))
    }

    /// Refresh a node in place from the store
    pub async fn update_node(&self, node: &mut Node) -> Result<()> {
        let id = required_id("node", node.id())?;
        let path = paths::node(&id);
        let (data, stat) = self.store()?.get(&path).await?;
        let fresh = if data.is_empty() {
            Node::default()
        } else {
            from_json(&path, &data)?
        };
        node.update_from(fresh);
        node.set_stat(stat);
        Ok(())
    }

    /// Create a node (allocating its id) or overwrite an existing one
    pub async fn store_node(&self, node: &mut Node) -> Result<String> {
        let store = self.store()?;
        match node.id().map(str::to_string) {
            None => {
                node.created_time = Some(node.state_time().unwrap_or_else(now));
                let path = store
                    .create(
                        &format!("{}/", paths::NODE_ROOT),
                        to_json(&*node)?,
                        CreateMode::PERSISTENT_SEQUENTIAL,
                        true,
                    )
                    .await?;
                let id = paths::basename(&path).to_string();
                node.set_id(id.clone());
                Ok(id)
            }
            Some(id) => {
                let stat = store.set(&paths::node(&id), to_json(&*node)?, None).await?;
                node.set_stat(stat);
                Ok(id)
            }
        }
    }

    /// Lock a node and refresh it, so the holder sees post-lock state
    pub async fn lock_node(
        &self,
        node: &mut Node,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let id = required_id("node", node.id())?;
        let handle = self
            .lock_path(&paths::node_lock(&id), false, blocking, timeout)
            .await?;
        node.lock = Some(handle);
        if let Some(caches) = self.started_caches() {
            caches.nodes.hold(&id);
        }

        if let Err(e) = self.update_node(node).await {
            if let Err(unlock) = self.unlock_node(node).await {
                tracing::warn!("Failed to release lock on node {}: {}", id, unlock);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Release the lock taken by `lock_node`
    pub async fn unlock_node(&self, node: &mut Node) -> Result<()> {
        let Some(handle) = node.lock.take() else {
            return Err(Error::LockNotHeld(format!(
                "Node {}",
                node.id().unwrap_or("<unstored>")
            )));
        };
        handle.release().await?;
        if let (Some(id), Some(caches)) = (node.id(), self.started_caches()) {
            caches.nodes.release(id);
        }
        Ok(())
    }

    /// Follow a node. `callback(node, deleted)` runs once with the current
    /// state, then after every change, with the node refreshed in place;
    /// returning `false` ends the watch. A node that is already gone gets
    /// a single `deleted` call. The task yields the node as last seen.
    pub async fn watch_node<F>(&self, mut node: Node, mut callback: F) -> Result<JoinHandle<Node>>
    where
        F: FnMut(&Node, bool) -> bool + Send + 'static,
    {
        let id = required_id("node", node.id())?;
        let path = paths::node(&id);
        let store = self.store()?;
        let mut watcher = store.watch(&path).await?;

        Ok(tokio::spawn(async move {
            // Subscribed first, so nothing between this read and the
            // first event is lost
            match store.get(&path).await {
                Ok((data, stat)) => {
                    refresh_watched(&mut node, &path, &data, stat);
                    if !callback(&node, false) {
                        return node;
                    }
                }
                Err(Error::NoNode(_)) => {
                    callback(&node, true);
                    return node;
                }
                Err(e) => tracing::warn!("Unable to read watched node {}: {}", path, e),
            }

            while let Some(event) = watcher.recv().await {
                let deleted = match event.kind {
                    _ if event.kind != EventKind::Resync && event.path != path => continue,
                    EventKind::Deleted => true,
                    EventKind::Created | EventKind::Changed => {
                        let data = event.data.unwrap_or_default();
                        let Some(stat) = event.stat else { continue };
                        // Already seen by the initial read
                        if node.stat().is_some_and(|seen| seen.version >= stat.version)
                            && event.kind == EventKind::Changed
                        {
                            continue;
                        }
                        refresh_watched(&mut node, &path, &data, stat);
                        false
                    }
                    EventKind::Resync => match store.get(&path).await {
                        Ok((data, stat)) => {
                            refresh_watched(&mut node, &path, &data, stat);
                            false
                        }
                        Err(Error::NoNode(_)) => true,
                        Err(e) => {
                            tracing::warn!("Unable to re-read watched node {}: {}", path, e);
                            continue;
                        }
                    },
                };

                if !callback(&node, deleted) {
                    break;
                }
            }
            node
        }))
    }

    /// Remove a node path and anything below it, skipping the DELETED
    /// transition. For nodes left without usable data.
    pub async fn delete_raw_node(&self, id: &str) -> Result<()> {
        self.remove(&paths::node(id), true).await
    }

    /// Mark a node DELETED, persist that, then remove it
    pub async fn delete_node(&self, node: &mut Node) -> Result<()> {
        let Some(id) = node.id().map(str::to_string) else {
            return Ok(());
        };
        node.set_state(NodeState::Deleted);
        self.store()?
            .set(&paths::node(&id), to_json(&*node)?, None)
            .await?;
        self.delete_raw_node(&id).await
    }

    /// Lazily walk every node; nodes that vanish or fail to decode are skipped
    pub fn node_iterator(&self, cached: bool) -> BoxStream<'_, Result<Node>> {
        lazy_entities(self.node_ids(), move |id| async move {
            self.get_node(&id, cached).await
        })
    }

    /// READY, unallocated nodes per requested label. A node carrying
    /// several requested labels is listed under each of them.
    pub async fn ready_nodes_of_types<L: AsRef<str>>(
        &self,
        labels: &[L],
        cached: bool,
    ) -> Result<HashMap<String, Vec<Node>>> {
        let mut ready: HashMap<String, Vec<Node>> = HashMap::new();
        let mut nodes = self.node_iterator(cached);
        while let Some(node) = nodes.next().await {
            let node = node?;
            if node.state() != Some(NodeState::Ready) || node.allocated_to.is_some() {
                continue;
            }
            for label in labels {
                let label = label.as_ref();
                if node.has_label(label) {
                    ready.entry(label.to_string()).or_default().push(node.clone());
                }
            }
        }
        Ok(ready)
    }

    /// Move the oldest unused node of a provider pool to DELETING.
    ///
    /// Does nothing while the pool already has a node that entered
    /// DELETING within the configured window. Returns whether a node was
    /// marked.
    pub async fn delete_oldest_unused_node(&self, provider: &str, pool: &str) -> Result<bool> {
        let window = self.max_delete_age.as_secs_f64();
        let mut candidates = Vec::new();
        {
            let mut nodes = self.node_iterator(true);
            while let Some(node) = nodes.next().await {
                let node = node?;
                if node.provider.as_deref() != Some(provider) || node.pool.as_deref() != Some(pool) {
                    continue;
                }
                match node.state() {
                    Some(NodeState::Ready) if node.allocated_to.is_none() => candidates.push(node),
                    Some(NodeState::Deleting)
                        if now() - node.state_time().unwrap_or(0.0) < window =>
                    {
                        return Ok(false);
                    }
                    _ => {}
                }
            }
        }

        candidates.sort_by(|a, b| {
            let a = a.state_time().unwrap_or(0.0);
            let b = b.state_time().unwrap_or(0.0);
            a.total_cmp(&b)
        });

        for mut node in candidates {
            match self.lock_node(&mut node, false, None).await {
                Ok(()) => {}
                Err(e) if e.is_lock_failure() || e.is_no_node() => continue,
                Err(e) => return Err(e),
            }

            // Someone may have claimed it before we got the lock
            if node.state() != Some(NodeState::Ready) {
                self.unlock_node(&mut node).await?;
                continue;
            }

            let id = node.id().unwrap_or_default().to_string();
            tracing::debug!(
                "Deleting unused node {} (age: {})",
                id,
                format_age(now() - node.state_time().unwrap_or(0.0))
            );
            node.set_state(NodeState::Deleting);
            let stored = self.store_node(&mut node).await;
            self.unlock_node(&mut node).await?;
            match stored {
                Ok(_) => return Ok(true),
                Err(e) => tracing::error!("Error attempting to update unused node {}: {}", id, e),
            }
        }
        Ok(false)
    }

    /// Number of nodes in a provider pool
    pub async fn count_pool_nodes(&self, provider: &str, pool: &str) -> Result<usize> {
        let mut count = 0;
        let mut nodes = self.node_iterator(true);
        while let Some(node) = nodes.next().await {
            let node = node?;
            if node.provider.as_deref() == Some(provider) && node.pool.as_deref() == Some(pool) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every node of a provider
    pub async fn provider_nodes(&self, provider: &str) -> Result<Vec<Node>> {
        let mut found = Vec::new();
        let mut nodes = self.node_iterator(true);
        while let Some(node) = nodes.next().await {
            let node = node?;
            if node.provider.as_deref() == Some(provider) {
                found.push(node);
            }
        }
        Ok(found)
    }

    /// Delete the nodes returned by `provider_nodes`
    pub async fn remove_provider_nodes(&self, provider: &str, nodes: Vec<Node>) -> Result<()> {
        tracing::info!("Removing {} nodes of provider {}", nodes.len(), provider);
        for mut node in nodes {
            self.delete_node(&mut node).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::{coordinator, coordinator_on};
    use crate::store::testing::eventually;
    use crate::store::{MemoryStore, Store};
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};

    fn pool_node(provider: &str, pool: &str, state: NodeState, state_time: f64) -> Node {
        let mut node = Node::new("");
        node.provider = Some(provider.into());
        node.pool = Some(pool.into());
        node.set_state(state);
        node.set_state_time(state_time);
        node
    }

    #[tokio::test]
    async fn test_store_lock_unlock_scenario() {
        let (coord, store) = coordinator();
        let other = coordinator_on(Arc::new(MemoryStore::with_tree(store.tree().clone())), false);

        let mut node = Node::new("").with_type(["small"]);
        node.set_state(NodeState::Building);
        let id = coord.store_node(&mut node).await.unwrap();
        assert_eq!(id, "0000000001");
        assert_eq!(node.created_time, node.state_time());

        let fetched = coord.get_node(&id, false).await.unwrap().unwrap();
        assert_eq!(fetched.state(), Some(NodeState::Building));
        assert_eq!(fetched.id(), Some("0000000001"));

        coord.lock_node(&mut node, true, None).await.unwrap();
        assert!(node.lock.is_some());

        let mut rival = other.get_node(&id, false).await.unwrap().unwrap();
        let err = other.lock_node(&mut rival, false, None).await.unwrap_err();
        assert!(matches!(err, Error::LockUnavailable(_)));
        assert!(rival.lock.is_none());

        coord.unlock_node(&mut node).await.unwrap();
        other.lock_node(&mut rival, false, None).await.unwrap();
        other.unlock_node(&mut rival).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_requires_lock() {
        let (coord, _store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Ready);
        coord.store_node(&mut node).await.unwrap();

        assert!(matches!(coord.unlock_node(&mut node).await, Err(Error::LockNotHeld(_))));
        coord.lock_node(&mut node, true, None).await.unwrap();
        coord.unlock_node(&mut node).await.unwrap();
        let err = coord.unlock_node(&mut node).await.unwrap_err();
        assert!(err.to_string().contains("0000000001"));
    }

    #[tokio::test]
    async fn test_lock_refreshes_stale_copy() {
        let (coord, _store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Ready);
        coord.store_node(&mut node).await.unwrap();
        let mut stale = node.clone();

        node.set_state(NodeState::InUse);
        node.allocated_to = Some("100-0000000001".into());
        coord.store_node(&mut node).await.unwrap();

        coord.lock_node(&mut stale, true, None).await.unwrap();
        assert_eq!(stale.state(), Some(NodeState::InUse));
        assert_eq!(stale.allocated_to.as_deref(), Some("100-0000000001"));
        assert_eq!(stale.stat().unwrap().version, 1);
        coord.unlock_node(&mut stale).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_missing_node() {
        let (coord, _store) = coordinator();
        let mut ghost = Node::new("0000000009");
        let err = coord.lock_node(&mut ghost, true, None).await.unwrap_err();
        assert!(matches!(err, Error::LockTargetMissing(ref p) if p == "/nodepool/nodes/0000000009"));

        let err = coord.lock_node(&mut Node::new(""), true, None).await.unwrap_err();
        assert!(matches!(err, Error::MissingId("node")));
    }

    #[tokio::test]
    async fn test_delete_node_two_phase() {
        let (coord, store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Used);
        let id = coord.store_node(&mut node).await.unwrap();
        coord.lock_node(&mut node, true, None).await.unwrap();

        let mut events = store.watch(&paths::node(&id)).await.unwrap();
        coord.delete_node(&mut node).await.unwrap();
        assert_eq!(node.state(), Some(NodeState::Deleted));

        // Observers see the terminal state before the path disappears
        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Changed);
        let seen: Node = from_json(&first.path, first.data.as_deref().unwrap()).unwrap();
        assert_eq!(seen.state(), Some(NodeState::Deleted));

        assert!(coord.get_node(&id, false).await.unwrap().is_none());
        assert!(coord.node_ids().await.unwrap().is_empty());
        coord.delete_raw_node(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_oldest_unused_node() {
        let (coord, _store) = coordinator();
        let mut older = pool_node("p1", "pool1", NodeState::Ready, 100.0);
        let mut newer = pool_node("p1", "pool1", NodeState::Ready, 200.0);
        let mut elsewhere = pool_node("p2", "pool1", NodeState::Ready, 50.0);
        let older_id = coord.store_node(&mut older).await.unwrap();
        let newer_id = coord.store_node(&mut newer).await.unwrap();
        coord.store_node(&mut elsewhere).await.unwrap();

        assert!(coord.delete_oldest_unused_node("p1", "pool1").await.unwrap());
        let older = coord.get_node(&older_id, false).await.unwrap().unwrap();
        let newer = coord.get_node(&newer_id, false).await.unwrap().unwrap();
        assert_eq!(older.state(), Some(NodeState::Deleting));
        assert_eq!(newer.state(), Some(NodeState::Ready));

        // A fresh DELETING node in the pool holds off further deletes
        assert!(!coord.delete_oldest_unused_node("p1", "pool1").await.unwrap());
        let newer = coord.get_node(&newer_id, false).await.unwrap().unwrap();
        assert_eq!(newer.state(), Some(NodeState::Ready));
        assert_eq!(coord.count_pool_nodes("p1", "pool1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_deleting_node_does_not_block() {
        let (coord, store) = coordinator();
        let other = coordinator_on(Arc::new(MemoryStore::with_tree(store.tree().clone())), false);
        let mut stuck = pool_node("p1", "pool1", NodeState::Deleting, 100.0);
        let mut locked = pool_node("p1", "pool1", NodeState::Ready, 150.0);
        let mut free = pool_node("p1", "pool1", NodeState::Ready, 200.0);
        coord.store_node(&mut stuck).await.unwrap();
        coord.store_node(&mut locked).await.unwrap();
        let free_id = coord.store_node(&mut free).await.unwrap();

        // The oldest candidate is locked elsewhere; the next one is taken
        other.lock_node(&mut locked, true, None).await.unwrap();
        assert!(coord.delete_oldest_unused_node("p1", "pool1").await.unwrap());
        let free = coord.get_node(&free_id, false).await.unwrap().unwrap();
        assert_eq!(free.state(), Some(NodeState::Deleting));
        assert!(free.lock.is_none());
    }

    #[tokio::test]
    async fn test_ready_nodes_of_types() {
        let (coord, _store) = coordinator();
        let mut both = Node::new("").with_type(["small", "large"]);
        both.set_state(NodeState::Ready);
        let mut allocated = Node::new("").with_type(["small"]);
        allocated.set_state(NodeState::Ready);
        allocated.allocated_to = Some("100-0000000001".into());
        let mut building = Node::new("").with_type(["large"]);
        building.set_state(NodeState::Building);
        let both_id = coord.store_node(&mut both).await.unwrap();
        coord.store_node(&mut allocated).await.unwrap();
        coord.store_node(&mut building).await.unwrap();

        let ready = coord
            .ready_nodes_of_types(&["small", "large", "gpu"], false)
            .await
            .unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready["small"].len(), 1);
        assert_eq!(ready["small"][0].id(), Some(both_id.as_str()));
        assert_eq!(ready["large"][0].id(), Some(both_id.as_str()));
        assert!(!ready.contains_key("gpu"));
    }

    #[tokio::test]
    async fn test_iterator_skips_unreadable_nodes() {
        let (coord, store) = coordinator();
        let mut good = Node::new("");
        good.set_state(NodeState::Ready);
        coord.store_node(&mut good).await.unwrap();
        store
            .create(&paths::node("0000000050"), b"{corrupt".to_vec(), CreateMode::PERSISTENT, false)
            .await
            .unwrap();
        store
            .create(&paths::node("0000000051"), Vec::new(), CreateMode::PERSISTENT, false)
            .await
            .unwrap();

        let nodes: Vec<Node> = coord
            .node_iterator(false)
            .map(|node| node.unwrap())
            .collect()
            .await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id(), Some("0000000001"));

        // Empty nodes are removed with the raw delete
        coord.delete_raw_node("0000000051").await.unwrap();
        assert_eq!(coord.node_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cached_reads() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator_on(store, true);
        let mut node = Node::new("");
        node.set_state(NodeState::Ready);
        let id = coord.store_node(&mut node).await.unwrap();

        // Falls back to the store until the mirror catches up
        assert!(coord.get_node(&id, true).await.unwrap().is_some());
        let caches = coord.started_caches().unwrap();
        eventually(|| caches.nodes.get(&id).is_some()).await;

        coord.lock_node(&mut node, true, None).await.unwrap();
        node.set_state(NodeState::InUse);
        coord.store_node(&mut node).await.unwrap();
        coord.unlock_node(&mut node).await.unwrap();
        eventually(|| caches.nodes.get(&id).and_then(|n| n.state()) == Some(NodeState::InUse)).await;

        coord.connection().disconnect().await.unwrap();
        assert!(caches.nodes.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_node() {
        let (coord, _store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Ready);
        coord.store_node(&mut node).await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let watch = coord
            .watch_node(node.clone(), move |node, deleted| {
                let _ = seen_tx.send((node.state(), deleted));
                !deleted
            })
            .await
            .unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), (Some(NodeState::Ready), false));

        let mut update = node.clone();
        update.set_state(NodeState::InUse);
        coord.store_node(&mut update).await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), (Some(NodeState::InUse), false));

        // Lock entries below the node are not changes of the node
        coord.lock_node(&mut update, true, None).await.unwrap();
        coord.delete_node(&mut update).await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), (Some(NodeState::Deleted), false));
        assert_eq!(seen_rx.recv().await.unwrap(), (Some(NodeState::Deleted), true));

        let last = watch.await.unwrap();
        assert_eq!(last.id(), Some("0000000001"));
        assert_eq!(last.state(), Some(NodeState::Deleted));
    }

    #[tokio::test]
    async fn test_watch_vanished_node() {
        let (coord, _store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Ready);
        coord.store_node(&mut node).await.unwrap();
        let stale = node.clone();
        coord.delete_node(&mut node).await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let watch = coord
            .watch_node(stale, move |node, deleted| {
                let _ = seen_tx.send((node.state(), deleted));
                true
            })
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(seen, Some((Some(NodeState::Ready), true)));
        let last = tokio::time::timeout(Duration::from_secs(2), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id(), Some("0000000001"));
    }

    #[tokio::test]
    async fn test_watch_stops_on_first_call() {
        let (coord, _store) = coordinator();
        let mut node = Node::new("");
        node.set_state(NodeState::Building);
        coord.store_node(&mut node).await.unwrap();

        let mut stored = node.clone();
        stored.set_state(NodeState::Ready);
        coord.store_node(&mut stored).await.unwrap();

        // The copy handed in is stale; the first call sees the stored state
        let watch = coord.watch_node(node, |_, _| false).await.unwrap();
        let last = tokio::time::timeout(Duration::from_secs(2), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.state(), Some(NodeState::Ready));
        assert_eq!(last.stat().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stats_signal_without_cached_reads() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator_on(store, true);
        let signal = Arc::new(Notify::new());
        coord.set_node_stats_event(Some(signal.clone()));
        assert!(coord.started_caches().is_some());

        let mut node = Node::new("");
        node.set_state(NodeState::Building);
        coord.store_node(&mut node).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), signal.notified())
            .await
            .unwrap();

        // Disabled caches never start
        let (plain, _store) = coordinator();
        plain.set_node_stats_event(Some(Arc::new(Notify::new())));
        assert!(!plain.start_caches());
        assert!(plain.started_caches().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_get_distinct_ids() {
        let (first, store) = coordinator();
        let second = coordinator_on(Arc::new(MemoryStore::with_tree(store.tree().clone())), false);
        let sessions = [Arc::new(first), Arc::new(second)];

        let stores = (0..32).map(|i| {
            let coord = sessions[i % 2].clone();
            tokio::spawn(async move {
                let hostname = format!("node-{}.example.com", i);
                let mut node = Node::new("");
                node.hostname = Some(hostname.clone());
                node.set_state(NodeState::Building);
                (coord.store_node(&mut node).await.unwrap(), hostname)
            })
        });
        let stored: Vec<(String, String)> = futures::future::join_all(stores)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let ids: HashSet<&String> = stored.iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 32);
        for (id, hostname) in &stored {
            let node = sessions[1].get_node(id, false).await.unwrap().unwrap();
            assert_eq!(node.hostname.as_ref(), Some(hostname));
        }
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0.0), "00:00:00:00");
        assert_eq!(format_age(90_061.5), "01:01:01:01");
    }
}
