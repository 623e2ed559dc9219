//! Node Requests

use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use uuid::Uuid;

use super::{decode, lazy_entities, most_recent, required_id, Coordinator};
use crate::error::{Error, Result};
use crate::model::{from_json, to_json, NodeRequest, NodeRequestLockStats, RequestState, Stateful};
use crate::paths;
use crate::store::CreateMode;

/// Priority prefix of new requests when the caller has no preference
pub const DEFAULT_PRIORITY: &str = "100";

impl Coordinator {
    /// Ids of every request, highest priority first
    pub async fn node_request_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.children(paths::REQUEST_ROOT).await?;
        ids.sort();
        Ok(ids)
    }

    /// A request by id, from the mirror first when `cached`
    pub async fn get_node_request(&self, id: &str, cached: bool) -> Result<Option<NodeRequest>> {
        if cached {
            let hit = self.caches().and_then(|caches| caches.requests.get(id));
            if hit.is_some() {
                return Ok(hit);
            }
        }

        let path = paths::request(id);
        let Some((data, stat)) = self.read(&path).await? else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(decode::<NodeRequest>(&path, &data).map(|mut request| {
            request.set_id(id);
            request.set_stat(stat);
            request
        }))
    }

    /// Refresh a request in place from the store
    pub async fn update_node_request(&self, request: &mut NodeRequest) -> Result<()> {
        let id = required_id("node request", request.id())?;
        let path = paths::request(&id);
        let (data, stat) = self.store()?.get(&path).await?;
        let fresh = if data.is_empty() {
            NodeRequest::default()
        } else {
            from_json(&path, &data)?
        };
        request.update_from(fresh);
        request.set_stat(stat);
        Ok(())
    }

    /// Submit a new request under `priority` (lower is served first) or
    /// overwrite an existing one. New requests live only as long as the
    /// submitting session.
    pub async fn store_node_request(&self, request: &mut NodeRequest, priority: &str) -> Result<String> {
        let store = self.store()?;
        match request.id().map(str::to_string) {
            None => {
                if request.event_id.is_none() {
                    request.event_id = Some(Uuid::new_v4().simple().to_string());
                }
                let path = store
                    .create(
                        &format!("{}/{}-", paths::REQUEST_ROOT, priority),
                        to_json(&*request)?,
                        CreateMode::EPHEMERAL_SEQUENTIAL,
                        true,
                    )
                    .await?;
                let id = paths::basename(&path).to_string();
                request.set_id(id.clone());
                Ok(id)
            }
            Some(id) => {
                if self.get_node_request(&id, false).await?.is_none() {
                    return Err(Error::NotFound {
                        kind: "node request",
                        id,
                    });
                }
                let stat = store
                    .set(&paths::request(&id), to_json(&*request)?, None)
                    .await?;
                request.set_stat(stat);
                Ok(id)
            }
        }
    }

    pub async fn delete_node_request(&self, request: &NodeRequest) -> Result<()> {
        match request.id() {
            Some(id) => self.remove(&paths::request(id), false).await,
            None => Ok(()),
        }
    }

    /// Lock a request and refresh it, so the holder sees post-lock state
    pub async fn lock_node_request(
        &self,
        request: &mut NodeRequest,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let id = required_id("node request", request.id())?;
        let handle = self
            .lock_path(&paths::request_lock(&id), true, blocking, timeout)
            .await?;
        request.lock = Some(handle);
        if let Some(caches) = self.started_caches() {
            caches.requests.hold(&id);
        }

        if let Err(e) = self.update_node_request(request).await {
            if let Err(unlock) = self.unlock_node_request(request).await {
                tracing::warn!(
                    event_id = request.event_id.as_deref().unwrap_or_default(),
                    "Failed to release lock on request {}: {}",
                    id,
                    unlock
                );
            }
            tracing::error!(
                event_id = request.event_id.as_deref().unwrap_or_default(),
                "Request {} not readable after locking: {}",
                id,
                e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Release the lock taken by `lock_node_request`
    pub async fn unlock_node_request(&self, request: &mut NodeRequest) -> Result<()> {
        let Some(handle) = request.lock.take() else {
            return Err(Error::LockNotHeld(format!(
                "Request {}",
                request.id().unwrap_or("<unstored>")
            )));
        };
        handle.release().await?;
        if let (Some(id), Some(caches)) = (request.id(), self.started_caches()) {
            caches.requests.release(id);
        }
        Ok(())
    }

    /// Lazily walk every request in priority order
    pub fn node_request_iterator(&self, cached: bool) -> BoxStream<'_, Result<NodeRequest>> {
        lazy_entities(self.node_request_ids(), move |id| async move {
            self.get_node_request(&id, cached).await
        })
    }

    /// Most recently changed requests, optionally only in `state`
    pub async fn most_recent_node_requests(
        &self,
        count: Option<usize>,
        state: Option<RequestState>,
    ) -> Result<Vec<NodeRequest>> {
        let mut requests = Vec::new();
        let mut all = self.node_request_iterator(false);
        while let Some(request) = all.next().await {
            let request = request?;
            if state.is_none() || request.state() == state {
                requests.push(request);
            }
        }
        Ok(most_recent(requests, count))
    }

    // ========== Request locks ==========

    /// Ids of every request lock, including those of vanished requests
    pub async fn node_request_lock_ids(&self) -> Result<Vec<String>> {
        self.children(paths::REQUEST_LOCK_ROOT).await
    }

    /// Store metadata of a request lock entry
    pub async fn node_request_lock_stats(&self, lock_id: &str) -> Result<Option<NodeRequestLockStats>> {
        Ok(self
            .read(&paths::request_lock(lock_id))
            .await?
            .map(|(_, stat)| NodeRequestLockStats {
                lock_id: lock_id.to_string(),
                stat: Some(stat),
            }))
    }

    pub async fn delete_node_request_lock(&self, lock_id: &str) -> Result<()> {
        self.remove(&paths::request_lock(lock_id), true).await
    }

    /// Lazily walk every request lock entry
    pub fn node_request_lock_stats_iterator(&self) -> BoxStream<'_, Result<NodeRequestLockStats>> {
        lazy_entities(self.node_request_lock_ids(), move |lock_id| async move {
            self.node_request_lock_stats(&lock_id).await
        })
    }
}
