//! WolfPool - Distributed Coordination for Image and Node Lifecycles
//!
//! The shared state layer that image builders, node launchers and request
//! schedulers use to cooperate: a versioned hierarchical store, exclusive
//! locks and elections on top of it, and typed CRUD for image builds,
//! image uploads, nodes, node requests and launchers.
//!
//! # Architecture
//!
//! Every process holds one session against the coordination store
//! (`RemoteStore` in production, `MemoryStore` in tests), managed by a
//! `ConnectionManager`. The `Coordinator` maps entities onto paths in the
//! tree and keeps optional in-memory mirrors of the node and request
//! collections fresh from store watches.
//!
//! # Features
//!
//! - Sequential, collision free id allocation for builds, uploads, nodes
//!   and requests
//! - Blocking, non-blocking and timed locks that tell a vanished target
//!   apart from contention
//! - Lock-then-refresh semantics for nodes and node requests
//! - Watch driven node and request caches with monotonic versions
//! - Leader election
//! - Mutually authenticated TLS between clients and the store server

pub mod cache;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod lock;
pub mod model;
pub mod paths;
pub mod store;
pub mod tls;

pub use config::WolfPoolConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CoordinationConfig, Endpoint, WolfPoolConfig};
    pub use crate::connection::ConnectionManager;
    pub use crate::coordinator::Coordinator;
    pub use crate::election::Election;
    pub use crate::error::{Error, Result};
    pub use crate::lock::{Lock, LockHandle};
    pub use crate::model::{
        BuildState, ImageBuild, ImageUpload, Launcher, Node, NodeRequest, NodeState,
        RequestState, Stateful, UploadState,
    };
    pub use crate::store::{MemoryStore, RemoteStore, Store};
}
