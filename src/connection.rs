//! Connection Manager
//!
//! Owns the one session a process holds with the coordination store.
//! Constructed by the process entry point and handed to the `Coordinator`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{build_hosts, CoordinationConfig, Endpoint, TlsConfig};
use crate::error::{Error, Result};
use crate::store::{ClientOptions, Dialer, RemoteStore, SessionState, Store, TlsDialer};

/// Minimum time between two "retrying connection" warnings
const RETRY_LOG_RATE: Duration = Duration::from_secs(10);

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session owner and connection-state tracker
pub struct ConnectionManager {
    client: RwLock<Option<Arc<dyn Store>>>,
    became_lost: Arc<AtomicBool>,
    last_retry_log: Mutex<Option<Instant>>,
    caches: Mutex<Vec<CancellationToken>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
            became_lost: Arc::new(AtomicBool::new(false)),
            last_retry_log: Mutex::new(None),
            caches: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    fn client(&self) -> Option<Arc<dyn Store>> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Connect over mutual TLS; a no-op when already connected
    pub async fn connect(&self, endpoints: &[Endpoint], read_only: bool, tls: &TlsConfig) -> Result<()> {
        let options = ClientOptions {
            read_only,
            ..ClientOptions::default()
        };
        self.connect_with_options(endpoints, tls, options).await
    }

    /// Connect using every setting of a coordination config section
    pub async fn connect_with_config(&self, config: &CoordinationConfig) -> Result<()> {
        self.connect_with_options(&config.servers, &config.tls, ClientOptions::from_config(config))
            .await
    }

    async fn connect_with_options(
        &self,
        endpoints: &[Endpoint],
        tls: &TlsConfig,
        options: ClientOptions,
    ) -> Result<()> {
        if self.client().is_some() {
            return Ok(());
        }
        tls.require()?;
        let dialer = TlsDialer::new(tls, options.connect_timeout)?;
        self.connect_with_dialer(endpoints, Arc::new(dialer), options).await
    }

    /// Connect through an arbitrary dialer, retrying transient failures
    /// until a session is established
    pub async fn connect_with_dialer(
        &self,
        endpoints: &[Endpoint],
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
    ) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.client().is_some() {
            return Ok(());
        }
        if endpoints.is_empty() {
            return Err(Error::Config("no coordination servers configured".into()));
        }

        tracing::info!("Connecting to coordination store at {}", build_hosts(endpoints));
        let retry_pause = options.connect_timeout;
        let store = loop {
            match RemoteStore::connect(endpoints.to_vec(), dialer.clone(), options.clone()).await {
                Ok(store) => break store,
                Err(e) if e.is_retryable() => {
                    self.log_connection_retry(&e);
                    tokio::time::sleep(retry_pause).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.attach(Arc::new(store));
        Ok(())
    }

    /// Adopt an already established store session
    pub fn attach(&self, store: Arc<dyn Store>) {
        let mut state = store.session_state();
        let became_lost = self.became_lost.clone();
        let listener = tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    SessionState::Lost => {
                        tracing::debug!("Coordination store connection: LOST");
                        became_lost.store(true, Ordering::SeqCst);
                    }
                    SessionState::Suspended => {
                        tracing::debug!("Coordination store connection: SUSPENDED");
                    }
                    SessionState::Connected => {
                        tracing::debug!("Coordination store connection: CONNECTED");
                    }
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = guard(&self.listener).replace(listener) {
            previous.abort();
        }
        *self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(store);
    }

    fn log_connection_retry(&self, err: &Error) {
        let mut last = guard(&self.last_retry_log);
        let due = last.map_or(true, |at| at.elapsed() >= RETRY_LOG_RATE);
        if due {
            tracing::warn!("Retrying coordination store connection: {}", err);
            *last = Some(Instant::now());
        }
    }

    /// Stop tree caches, then end the session. Safe when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        for cache in guard(&self.caches).drain(..) {
            cache.cancel();
        }

        let client = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = guard(&self.listener).take() {
            listener.abort();
        }

        if let Some(client) = client {
            client.close().await?;
            tracing::info!("Disconnected from coordination store");
        }
        Ok(())
    }

    /// Live-replace the server list without dropping the session
    pub fn reset_hosts(&self, endpoints: &[Endpoint]) -> Result<()> {
        match self.client() {
            Some(client) => {
                tracing::info!("Resetting coordination hosts to {}", build_hosts(endpoints));
                client.set_endpoints(endpoints.to_vec())
            }
            None => Ok(()),
        }
    }

    fn state(&self) -> Option<SessionState> {
        self.client().map(|client| *client.session_state().borrow())
    }

    /// Session established and healthy
    pub fn connected(&self) -> bool {
        self.state() == Some(SessionState::Connected)
    }

    /// Session temporarily unreachable (or no session at all)
    pub fn suspended(&self) -> bool {
        matches!(self.state(), None | Some(SessionState::Suspended))
    }

    /// Session expired (or no session at all)
    pub fn lost(&self) -> bool {
        matches!(self.state(), None | Some(SessionState::Lost))
    }

    /// Whether a LOST transition happened since the last reset
    pub fn did_lose_connection(&self) -> bool {
        self.became_lost.load(Ordering::SeqCst)
    }

    pub fn reset_lost_flag(&self) {
        self.became_lost.store(false, Ordering::SeqCst);
    }

    /// Current session handle
    pub fn store(&self) -> Result<Arc<dyn Store>> {
        self.client().ok_or(Error::NotConnected)
    }

    /// Tie a background cache to the session; cancelled on disconnect
    pub fn register_cache(&self, token: CancellationToken) {
        guard(&self.caches).push(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{eventually, LocalDialer};
    use crate::store::MemoryStore;

    fn fast_options() -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_millis(20),
            ..ClientOptions::default()
        }
    }

    #[tokio::test]
    async fn test_tls_material_required() {
        let manager = ConnectionManager::new();
        let tls = TlsConfig {
            cert: Some("/etc/wolfpool/client.pem".into()),
            key: None,
            ca: Some("/etc/wolfpool/ca.pem".into()),
        };
        let err = manager
            .connect(&[Endpoint::new("zk1", 2281)], false, &tls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("TLS")));
        assert!(!manager.connected());
    }

    #[tokio::test]
    async fn test_not_connected_predicates() {
        let manager = ConnectionManager::new();
        assert!(!manager.connected());
        assert!(manager.suspended());
        assert!(manager.lost());
        assert!(matches!(manager.store(), Err(Error::NotConnected)));
        assert!(manager.reset_hosts(&[Endpoint::new("zk1", 2181)]).is_ok());
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_latch() {
        let manager = ConnectionManager::new();
        let store = Arc::new(MemoryStore::new());
        manager.attach(store.clone());
        assert!(manager.connected());
        assert!(!manager.did_lose_connection());

        store.set_suspended(true);
        assert!(manager.suspended());
        store.set_suspended(false);

        store.expire();
        assert!(manager.lost());
        eventually(|| manager.did_lose_connection()).await;

        manager.reset_lost_flag();
        assert!(!manager.did_lose_connection());
    }

    #[tokio::test]
    async fn test_connect_retries_until_reachable() {
        let dialer = LocalDialer::new();
        dialer.set_refuse(true);
        let manager = Arc::new(ConnectionManager::new());

        let connecting = {
            let manager = manager.clone();
            let dialer = dialer.clone();
            tokio::spawn(async move {
                manager
                    .connect_with_dialer(&[Endpoint::new("zk1", 2281)], dialer, fast_options())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.connected());
        dialer.set_refuse(false);

        connecting.await.unwrap().unwrap();
        assert!(manager.connected());

        // Already connected: no further dial
        let dials = dialer.dial_count();
        manager
            .connect_with_dialer(&[Endpoint::new("zk1", 2281)], dialer.clone(), fast_options())
            .await
            .unwrap();
        assert_eq!(dialer.dial_count(), dials);
    }

    #[tokio::test]
    async fn test_disconnect_stops_caches_first() {
        let dialer = LocalDialer::new();
        let manager = ConnectionManager::new();
        manager
            .connect_with_dialer(&[Endpoint::new("zk1", 2281)], dialer.clone(), fast_options())
            .await
            .unwrap();
        let session = manager.store().unwrap().session_id();

        let cache = CancellationToken::new();
        manager.register_cache(cache.clone());
        manager.disconnect().await.unwrap();

        assert!(cache.is_cancelled());
        assert!(manager.lost());
        assert!(!dialer.tree.session_alive(session));
        manager.disconnect().await.unwrap();
    }
}
