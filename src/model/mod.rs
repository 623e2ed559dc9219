//! Entity Model
//!
//! Typed records for everything WolfPool keeps in the coordination tree.
//! Each payload is a JSON document; identity comes from the path and store
//! metadata is attached after reads, neither is part of the document.
//!
//! Missing keys fall back to documented defaults and unknown keys are
//! ignored, so older and newer writers can share a tree.

mod build;
mod launcher;
mod node;
mod request;
pub mod state;
mod upload;

pub use build::ImageBuild;
pub use launcher::Launcher;
pub use node::Node;
pub use request::{NodeRequest, NodeRequestLockStats};
pub use state::{BuildState, EntityState, NodeState, RequestState, UploadState};
pub use upload::ImageUpload;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Stat;

/// Default login user on launched machines
pub const DEFAULT_USERNAME: &str = "zuul";
/// Default interpreter path on launched machines
pub const DEFAULT_PYTHON_PATH: &str = "/usr/bin/python2";

pub(crate) fn default_username() -> Option<String> {
    Some(DEFAULT_USERNAME.to_string())
}

pub(crate) fn default_python_path() -> Option<String> {
    Some(DEFAULT_PYTHON_PATH.to_string())
}

/// Current wall-clock time as fractional epoch seconds
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Lifecycle fields shared by every stateful entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base<S> {
    #[serde(skip)]
    id: Option<String>,
    state: Option<S>,
    state_time: Option<f64>,
    #[serde(skip)]
    stat: Option<Stat>,
}

impl<S> Default for Base<S> {
    fn default() -> Self {
        Self {
            id: None,
            state: None,
            state_time: None,
            stat: None,
        }
    }
}

impl<S: EntityState> Base<S> {
    /// An empty id means "not yet assigned"
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: (!id.is_empty()).then_some(id),
            ..Self::default()
        }
    }

    pub(crate) fn from_parts(state: Option<S>, state_time: Option<f64>) -> Self {
        Self {
            state,
            state_time,
            ..Self::default()
        }
    }
}

/// Shared behaviour of the stateful entities
pub trait Stateful {
    type State: EntityState;

    fn base(&self) -> &Base<Self::State>;
    fn base_mut(&mut self) -> &mut Base<Self::State>;

    fn id(&self) -> Option<&str> {
        self.base().id.as_deref()
    }

    fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.base_mut().id = (!id.is_empty()).then_some(id);
    }

    fn state(&self) -> Option<Self::State> {
        self.base().state
    }

    /// Change state, stamping the transition time
    fn set_state(&mut self, state: Self::State) {
        let base = self.base_mut();
        base.state = Some(state);
        base.state_time = Some(now());
    }

    /// Change state from its wire name
    fn set_state_str(&mut self, state: &str) -> Result<()> {
        let state = state.parse::<Self::State>()?;
        self.set_state(state);
        Ok(())
    }

    fn state_time(&self) -> Option<f64> {
        self.base().state_time
    }

    fn set_state_time(&mut self, state_time: f64) {
        self.base_mut().state_time = Some(state_time);
    }

    /// Store metadata from the last read or write
    fn stat(&self) -> Option<&Stat> {
        self.base().stat.as_ref()
    }

    fn set_stat(&mut self, stat: Stat) {
        self.base_mut().stat = Some(stat);
    }
}

/// Encode an entity document
pub fn to_json<T: Serialize>(entity: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entity)?)
}

/// Decode the entity document stored at `path`
pub fn from_json<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|source| Error::Decode {
        path: path.to_string(),
        source,
    })
}
