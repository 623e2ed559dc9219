//! Leader Election
//!
//! A named election is a lock under the election root whose contenders
//! carry their participant identifier. Whoever holds the lock leads.

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::lock::{Lock, LockHandle};
use crate::paths;
use crate::store::Store;

pub struct Election {
    lock: Lock,
    identifier: String,
}

impl Election {
    pub fn new(store: Arc<dyn Store>, name: &str, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let lock = Lock::new(store, paths::election(name))
            .with_identifier(identifier.clone())
            .create_parents(true);
        Self { lock, identifier }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Block until elected; leadership lasts until the handle is released
    pub async fn campaign(&self) -> Result<LockHandle> {
        let handle = self.lock.acquire(true, None).await?;
        tracing::info!("{} elected leader of {}", self.identifier, self.lock.path());
        Ok(handle)
    }

    /// Wait for leadership, run `leader` and step down once it returns
    pub async fn run<F, Fut, T>(&self, leader: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.campaign().await?;
        let output = leader().await;
        handle.release().await?;
        Ok(output)
    }

    /// Participant identifiers, current leader first
    pub async fn contenders(&self) -> Result<Vec<String>> {
        self.lock.contenders().await
    }
}
