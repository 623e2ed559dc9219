use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{default_username, Base, NodeState, Stateful, DEFAULT_USERNAME};
use crate::lock::LockHandle;

/// Port used when a document names none
pub const DEFAULT_CONNECTION_PORT: u16 = 22;

/// A launched machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "NodeDocument", into = "NodeDocument")]
pub struct Node {
    base: Base<NodeState>,
    /// Held while this process owns the node lock
    pub lock: Option<LockHandle>,
    pub cloud: Option<String>,
    pub provider: Option<String>,
    pub pool: Option<String>,
    /// Labels this node carries
    pub node_type: Vec<String>,
    /// Request the node is allocated to
    pub allocated_to: Option<String>,
    pub az: Option<String>,
    pub region: Option<String>,
    pub public_ipv4: Option<String>,
    pub private_ipv4: Option<String>,
    pub public_ipv6: Option<String>,
    pub host_id: Option<String>,
    pub interface_ip: Option<String>,
    pub connection_type: Option<String>,
    pub connection_port: u16,
    pub shell_type: Option<String>,
    pub image_id: Option<String>,
    pub launcher: Option<String>,
    /// Set once when the node is first stored
    pub created_time: Option<f64>,
    pub external_id: Option<String>,
    pub hostname: Option<String>,
    pub comment: Option<String>,
    pub hold_job: Option<String>,
    pub username: Option<String>,
    pub host_keys: Vec<String>,
    /// Seconds a held node is kept; 0 means no expiration
    pub hold_expiration: Option<i64>,
    pub resources: Option<BTreeMap<String, Value>>,
    pub attributes: Option<BTreeMap<String, Value>>,
    pub python_path: Option<String>,
}

impl Default for Node {
    fn default() -> Self {
        Self::new("")
    }
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            base: Base::new(id),
            lock: None,
            cloud: None,
            provider: None,
            pool: None,
            node_type: Vec::new(),
            allocated_to: None,
            az: None,
            region: None,
            public_ipv4: None,
            private_ipv4: None,
            public_ipv6: None,
            host_id: None,
            interface_ip: None,
            connection_type: None,
            connection_port: DEFAULT_CONNECTION_PORT,
            shell_type: None,
            image_id: None,
            launcher: None,
            created_time: None,
            external_id: None,
            hostname: None,
            comment: None,
            hold_job: None,
            username: Some(DEFAULT_USERNAME.to_string()),
            host_keys: Vec::new(),
            hold_expiration: None,
            resources: None,
            attributes: None,
            python_path: None,
        }
    }

    pub fn with_type<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.node_type = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this node carries `label`
    pub fn has_label(&self, label: &str) -> bool {
        self.node_type.iter().any(|l| l == label)
    }

    /// Take every stored field from a freshly read copy, keeping identity
    /// and the lock handle
    pub fn update_from(&mut self, fresh: Node) {
        let id = self.base.id.take();
        let lock = self.lock.take();
        let stat = self.base.stat.take();
        *self = fresh;
        self.base.id = id;
        self.lock = lock;
        if self.base.stat.is_none() {
            self.base.stat = stat;
        }
    }
}

impl Stateful for Node {
    type State = NodeState;

    fn base(&self) -> &Base<NodeState> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base<NodeState> {
        &mut self.base
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && NodeDocument::from(self) == NodeDocument::from(other)
    }
}

/// Stored shape of a node, including the legacy spellings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeDocument {
    #[serde(default)]
    state: Option<NodeState>,
    #[serde(default)]
    state_time: Option<f64>,
    #[serde(default)]
    cloud: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "labels")]
    node_type: Vec<String>,
    #[serde(default)]
    allocated_to: Option<String>,
    #[serde(default)]
    az: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    public_ipv4: Option<String>,
    #[serde(default)]
    private_ipv4: Option<String>,
    #[serde(default)]
    public_ipv6: Option<String>,
    #[serde(default)]
    host_id: Option<String>,
    #[serde(default)]
    interface_ip: Option<String>,
    #[serde(default)]
    connection_type: Option<String>,
    #[serde(default, deserialize_with = "port")]
    connection_port: Option<u16>,
    /// Older readers only know this key
    #[serde(default, deserialize_with = "port")]
    ssh_port: Option<u16>,
    #[serde(default)]
    shell_type: Option<String>,
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    launcher: Option<String>,
    #[serde(default)]
    created_time: Option<f64>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    hold_job: Option<String>,
    #[serde(default = "default_username")]
    username: Option<String>,
    #[serde(default)]
    host_keys: Vec<String>,
    #[serde(default, deserialize_with = "hold_expiration")]
    hold_expiration: Option<i64>,
    #[serde(default)]
    resources: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    attributes: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    python_path: Option<String>,
}

/// Accept a bare label as well as a list; empty means none
fn labels<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Labels>::deserialize(deserializer)? {
        Some(Labels::One(label)) if !label.is_empty() => vec![label],
        Some(Labels::Many(labels)) => labels,
        _ => Vec::new(),
    })
}

/// Whole seconds; anything that is not a number counts as 0
fn hold_expiration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|value| match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(b) => i64::from(b),
        _ => 0,
    }))
}

/// A port number or numeric string; anything else reads as unset
fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl From<&Node> for NodeDocument {
    fn from(node: &Node) -> Self {
        Self {
            state: node.base.state,
            state_time: node.base.state_time,
            cloud: node.cloud.clone(),
            provider: node.provider.clone(),
            pool: node.pool.clone(),
            node_type: node.node_type.clone(),
            allocated_to: node.allocated_to.clone(),
            az: node.az.clone(),
            region: node.region.clone(),
            public_ipv4: node.public_ipv4.clone(),
            private_ipv4: node.private_ipv4.clone(),
            public_ipv6: node.public_ipv6.clone(),
            host_id: node.host_id.clone(),
            interface_ip: node.interface_ip.clone(),
            connection_type: node.connection_type.clone(),
            connection_port: Some(node.connection_port),
            ssh_port: Some(node.connection_port),
            shell_type: node.shell_type.clone(),
            image_id: node.image_id.clone(),
            launcher: node.launcher.clone(),
            created_time: node.created_time,
            external_id: node.external_id.clone(),
            hostname: node.hostname.clone(),
            comment: node.comment.clone(),
            hold_job: node.hold_job.clone(),
            username: node.username.clone(),
            host_keys: node.host_keys.clone(),
            hold_expiration: node.hold_expiration,
            resources: node.resources.clone(),
            attributes: node.attributes.clone(),
            python_path: node.python_path.clone(),
        }
    }
}

impl From<Node> for NodeDocument {
    fn from(node: Node) -> Self {
        NodeDocument::from(&node)
    }
}

impl From<NodeDocument> for Node {
    fn from(doc: NodeDocument) -> Self {
        Self {
            base: Base::from_parts(doc.state, doc.state_time),
            lock: None,
            cloud: doc.cloud,
            provider: doc.provider,
            pool: doc.pool,
            node_type: doc.node_type,
            allocated_to: doc.allocated_to,
            az: doc.az,
            region: doc.region,
            public_ipv4: doc.public_ipv4,
            private_ipv4: doc.private_ipv4,
            public_ipv6: doc.public_ipv6,
            host_id: doc.host_id,
            interface_ip: doc.interface_ip,
            connection_type: doc.connection_type,
            connection_port: doc
                .connection_port
                .or(doc.ssh_port)
                .unwrap_or(DEFAULT_CONNECTION_PORT),
            shell_type: doc.shell_type,
            image_id: doc.image_id,
            launcher: doc.launcher,
            created_time: doc.created_time,
            external_id: doc.external_id,
            hostname: doc.hostname,
            comment: doc.comment,
            hold_job: doc.hold_job,
            username: doc.username,
            host_keys: doc.host_keys,
            hold_expiration: doc.hold_expiration,
            resources: doc.resources,
            attributes: doc.attributes,
            python_path: doc.python_path,
        }
    }
}
