use serde::{Deserialize, Serialize};

use super::{Base, RequestState, Stateful};
use crate::lock::LockHandle;
use crate::store::Stat;

fn default_reuse() -> bool {
    true
}

/// A scheduler's request for a set of labelled nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    #[serde(flatten)]
    base: Base<RequestState>,
    /// Held while this process owns the request lock
    #[serde(skip)]
    pub lock: Option<LockHandle>,
    /// Launchers that refused the request
    #[serde(default)]
    pub declined_by: Vec<String>,
    /// Requested labels, in order
    #[serde(default)]
    pub node_types: Vec<String>,
    /// Fulfilled node ids, one per requested label
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_reuse")]
    pub reuse: bool,
    #[serde(default)]
    pub requestor: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Lower sorts first
    #[serde(default)]
    pub relative_priority: i64,
    /// Correlation id, generated when first stored
    #[serde(default)]
    pub event_id: Option<String>,
}

impl Default for NodeRequest {
    fn default() -> Self {
        Self::new("")
    }
}

impl NodeRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            base: Base::new(id),
            lock: None,
            declined_by: Vec::new(),
            node_types: Vec::new(),
            nodes: Vec::new(),
            reuse: true,
            requestor: None,
            provider: None,
            relative_priority: 0,
            event_id: None,
        }
    }

    /// Take every stored field from a freshly read copy, keeping identity
    /// and the lock handle
    pub fn update_from(&mut self, fresh: NodeRequest) {
        let NodeRequest {
            base,
            lock: _,
            declined_by,
            node_types,
            nodes,
            reuse,
            requestor,
            provider,
            relative_priority,
            event_id,
        } = fresh;
        self.base.state = base.state;
        self.base.state_time = base.state_time;
        if base.stat.is_some() {
            self.base.stat = base.stat;
        }
        self.declined_by = declined_by;
        self.node_types = node_types;
        self.nodes = nodes;
        self.reuse = reuse;
        self.requestor = requestor;
        self.provider = provider;
        self.relative_priority = relative_priority;
        self.event_id = event_id;
    }
}

impl Stateful for NodeRequest {
    type State = RequestState;

    fn base(&self) -> &Base<RequestState> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base<RequestState> {
        &mut self.base
    }
}

impl PartialEq for NodeRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
            && self.declined_by == other.declined_by
            && self.node_types == other.node_types
            && self.nodes == other.nodes
            && self.reuse == other.reuse
            && self.requestor == other.requestor
            && self.provider == other.provider
            && self.relative_priority == other.relative_priority
    }
}

/// Store metadata of one request lock entry
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRequestLockStats {
    pub lock_id: String,
    pub stat: Option<Stat>,
}

impl NodeRequestLockStats {
    pub fn new(lock_id: impl Into<String>) -> Self {
        Self {
            lock_id: lock_id.into(),
            stat: None,
        }
    }
}
