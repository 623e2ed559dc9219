//! WolfPool Error Types

use thiserror::Error;

/// Result type alias for WolfPool operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfPool error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    // Lock errors
    #[error("Timeout trying to acquire lock {0}")]
    Timeout(String),

    #[error("Did not get lock on {0}")]
    LockUnavailable(String),

    #[error("Lock target does not exist: {0}")]
    LockTargetMissing(String),

    #[error("{0} does not hold a lock")]
    LockNotHeld(String),

    // Data errors
    #[error("Parent of {0} does not exist")]
    MissingParent(String),

    #[error("Error decoding data at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Error encoding data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("'{value}' is not a valid {kind} state")]
    InvalidState { kind: &'static str, value: String },

    #[error("{0} has no id; store it first")]
    MissingId(&'static str),

    #[error("Attempt to update non-existing {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    // Store errors
    #[error("No node at {0}")]
    NoNode(String),

    #[error("Node already exists at {0}")]
    NodeExists(String),

    #[error("Node {0} has children")]
    NotEmpty(String),

    #[error("Version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion { path: String, expected: u32, actual: u32 },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Session is read-only")]
    ReadOnly,

    #[error("Not connected to the coordination store")]
    NotConnected,

    // Network errors
    #[error("Connection lost to the coordination store")]
    ConnectionLoss,

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient connectivity failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error means the entity at the path is gone
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }

    /// Check if this error came from a failed lock acquisition
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::LockUnavailable(_) | Error::LockTargetMissing(_)
        )
    }
}
