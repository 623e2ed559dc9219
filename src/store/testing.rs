//! Test helpers: an in-process server reachable through duplex pipes

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BoxedStream, DataTree, Dialer, StoreServer};
use crate::config::Endpoint;
use crate::error::{Error, Result};

/// Dials an in-process server over duplex pipes
pub(crate) struct LocalDialer {
    pub tree: Arc<DataTree>,
    server: Mutex<StoreServer>,
    pub refuse: AtomicBool,
    pub dials: AtomicUsize,
}

impl LocalDialer {
    pub fn new() -> Arc<Self> {
        let tree = Arc::new(DataTree::new());
        let server = StoreServer::new(tree.clone(), Duration::from_secs(30));
        Arc::new(Self {
            tree,
            server: Mutex::new(server),
            refuse: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
        })
    }

    /// Drop every connection, as a server restart would
    pub fn restart(&self) {
        let mut server = self.server.lock().unwrap();
        server.stop();
        *server = StoreServer::new(self.tree.clone(), Duration::from_secs(30));
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                address: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (client, remote) = tokio::io::duplex(64 * 1024);
        let server = self.server.lock().unwrap().clone();
        tokio::spawn(async move {
            let _ = server.serve_connection(remote, "local").await;
        });
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(client))
    }
}

/// Poll until `check` holds, failing the test after five seconds
pub(crate) async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
