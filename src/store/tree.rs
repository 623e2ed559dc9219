//! Data Tree
//!
//! The authoritative in-memory tree behind both the in-process store and
//! the store server. All mutations happen under one mutex and publish
//! their change events while still holding it, so every subscriber sees
//! changes in commit order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use super::{CreateMode, Stat, StoreEvent};
use crate::error::{Error, Result};
use crate::paths;

/// Capacity of the change event channel
const EVENT_CAPACITY: usize = 4096;

struct TreeNode {
    data: Vec<u8>,
    stat: Stat,
    /// Next suffix handed out to a sequential child
    next_sequence: u64,
}

struct Session {
    read_only: bool,
    timeout: Duration,
    ephemerals: BTreeSet<String>,
    attached: bool,
    generation: u64,
}

struct TreeInner {
    nodes: BTreeMap<String, TreeNode>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    zxid: u64,
}

/// Shared hierarchical tree with sessions and change notification
pub struct DataTree {
    inner: Mutex<TreeInner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl DataTree {
    /// Create an empty tree containing only `/`
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            TreeNode {
                data: Vec::new(),
                stat: Stat::default(),
                next_sequence: 1,
            },
        );

        Self {
            inner: Mutex::new(TreeInner {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
                zxid: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to every change in the tree
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ========== Sessions ==========

    /// Open a new attached session
    pub fn open_session(&self, read_only: bool, timeout: Duration) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_session;
        inner.next_session += 1;
        inner.sessions.insert(
            id,
            Session {
                read_only,
                timeout,
                ephemerals: BTreeSet::new(),
                attached: true,
                generation: 0,
            },
        );
        tracing::debug!("Opened session {:#x}", id);
        id
    }

    /// Re-attach a detached session, returning its timeout
    pub fn attach_session(&self, id: u64) -> Result<Duration> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&id).ok_or(Error::SessionExpired)?;
        session.attached = true;
        session.generation += 1;
        Ok(session.timeout)
    }

    /// Mark a session as detached; returns the generation and timeout to
    /// schedule its expiry with
    pub fn detach_session(&self, id: u64) -> Option<(u64, Duration)> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&id)?;
        session.attached = false;
        session.generation += 1;
        Some((session.generation, session.timeout))
    }

    /// Expire a session if it is still detached at the given generation
    pub fn expire_detached(&self, id: u64, generation: u64) -> bool {
        let still_detached = {
            let inner = self.lock();
            matches!(
                inner.sessions.get(&id),
                Some(session) if !session.attached && session.generation == generation
            )
        };
        if still_detached {
            self.close_session(id);
        }
        still_detached
    }

    /// End a session and remove its ephemeral paths
    pub fn close_session(&self, id: u64) {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.remove(&id) else {
            return;
        };
        for path in session.ephemerals.iter().rev() {
            if inner.nodes.contains_key(path) {
                self.remove_node(&mut inner, path);
            }
        }
        tracing::debug!(
            "Closed session {:#x} ({} ephemeral paths removed)",
            id,
            session.ephemerals.len()
        );
    }

    /// Whether a session is still alive
    pub fn session_alive(&self, id: u64) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    fn check_session(inner: &TreeInner, id: u64, write: bool) -> Result<()> {
        let session = inner.sessions.get(&id).ok_or(Error::SessionExpired)?;
        if write && session.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    // ========== Reads ==========

    /// Read a payload and its metadata
    pub fn get(&self, session: u64, path: &str) -> Result<(Vec<u8>, Stat)> {
        let inner = self.lock();
        Self::check_session(&inner, session, false)?;
        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        Ok((node.data.clone(), node.stat.clone()))
    }

    /// Metadata of a path if present
    pub fn exists(&self, session: u64, path: &str) -> Result<Option<Stat>> {
        let inner = self.lock();
        Self::check_session(&inner, session, false)?;
        Ok(inner.nodes.get(path).map(|n| n.stat.clone()))
    }

    /// Direct children, in name order
    pub fn children(&self, session: u64, path: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        Self::check_session(&inner, session, false)?;
        if !inner.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(Self::child_names(&inner, path))
    }

    fn child_names(inner: &TreeInner, path: &str) -> Vec<String> {
        Self::descendants(inner, path)
            .into_iter()
            .filter_map(|p| {
                let name = paths::basename(&p);
                (paths::parent(&p) == path).then(|| name.to_string())
            })
            .collect()
    }

    fn descendants(inner: &TreeInner, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        inner
            .nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.as_str() != "/")
            .map(|(key, _)| key.clone())
            .collect()
    }

    // ========== Writes ==========

    fn next_stat(inner: &mut TreeInner, data_length: usize, owner: Option<u64>) -> Stat {
        inner.zxid += 1;
        let now = now_ms();
        Stat {
            version: 0,
            created_ms: now,
            modified_ms: now,
            czxid: inner.zxid,
            mzxid: inner.zxid,
            ephemeral_owner: owner,
            num_children: 0,
            data_length: data_length as u32,
        }
    }

    fn insert_node(&self, inner: &mut TreeInner, path: &str, data: Vec<u8>, owner: Option<u64>) {
        let stat = Self::next_stat(inner, data.len(), owner);
        let event = StoreEvent::created(path, &data, &stat);
        inner.nodes.insert(
            path.to_string(),
            TreeNode {
                data,
                stat,
                next_sequence: 1,
            },
        );
        if let Some(parent) = inner.nodes.get_mut(paths::parent(path)) {
            parent.stat.num_children += 1;
        }
        if let Some(owner) = owner {
            if let Some(session) = inner.sessions.get_mut(&owner) {
                session.ephemerals.insert(path.to_string());
            }
        }
        self.publish(event);
    }

    fn remove_node(&self, inner: &mut TreeInner, path: &str) {
        let Some(node) = inner.nodes.remove(path) else {
            return;
        };
        if let Some(parent) = inner.nodes.get_mut(paths::parent(path)) {
            parent.stat.num_children = parent.stat.num_children.saturating_sub(1);
        }
        if let Some(owner) = node.stat.ephemeral_owner {
            if let Some(session) = inner.sessions.get_mut(&owner) {
                session.ephemerals.remove(path);
            }
        }
        self.publish(StoreEvent::deleted(path));
    }

    fn make_parents(&self, inner: &mut TreeInner, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match inner.nodes.get(&current) {
                Some(node) if node.stat.ephemeral_owner.is_some() => {
                    return Err(Error::InvalidPath(format!(
                        "{} is ephemeral and cannot have children",
                        current
                    )));
                }
                Some(_) => {}
                None => self.insert_node(inner, &current, Vec::new(), None),
            }
        }
        Ok(())
    }

    /// Create a path; sequential creates treat `path` as a name prefix
    pub fn create(
        &self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> Result<String> {
        let mut inner = self.lock();
        Self::check_session(&inner, session, true)?;

        if path == "/" || !path.starts_with('/') {
            return Err(Error::InvalidPath(path.to_string()));
        }
        if !mode.sequential {
            validate_path(path)?;
        }

        let parent = paths::parent(path).to_string();
        validate_path(&parent)?;
        if !inner.nodes.contains_key(&parent) {
            if make_parents {
                self.make_parents(&mut inner, &parent)?;
            } else {
                return Err(Error::NoNode(parent));
            }
        }

        let parent_node = inner
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;
        if parent_node.stat.ephemeral_owner.is_some() {
            return Err(Error::InvalidPath(format!(
                "{} is ephemeral and cannot have children",
                parent
            )));
        }

        let final_path = if mode.sequential {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };
        validate_path(&final_path)?;

        if inner.nodes.contains_key(&final_path) {
            return Err(Error::NodeExists(final_path));
        }

        let owner = mode.ephemeral.then_some(session);
        self.insert_node(&mut inner, &final_path, data, owner);
        Ok(final_path)
    }

    /// Replace a payload, bumping its version
    pub fn set(
        &self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        version: Option<u32>,
    ) -> Result<Stat> {
        let mut inner = self.lock();
        Self::check_session(&inner, session, true)?;
        inner.zxid += 1;
        let zxid = inner.zxid;

        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }

        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.modified_ms = now_ms();
        node.stat.data_length = data.len() as u32;
        node.data = data;

        let stat = node.stat.clone();
        self.publish(StoreEvent::changed(path, &node.data, &stat));
        Ok(stat)
    }

    /// Remove a path; recursive removal deletes the deepest entries first
    pub fn delete(&self, session: u64, path: &str, recursive: bool) -> Result<()> {
        let mut inner = self.lock();
        Self::check_session(&inner, session, true)?;
        if path == "/" {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;

        if node.stat.num_children > 0 {
            if !recursive {
                return Err(Error::NotEmpty(path.to_string()));
            }
            let mut below = Self::descendants(&inner, path);
            below.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
            for child in below {
                self.remove_node(&mut inner, &child);
            }
        }

        self.remove_node(&mut inner, path);
        Ok(())
    }
}
