//! Error types for the networking engine.
//!
//! # Design
//! Errors are split by who sees them. `OperationError` is what observers
//! receive and is `Clone` because one failed transfer fans out to every
//! deduplicated caller. `StoreError` belongs to the persistent cache and the
//! freeze store; it is logged and recovered from locally and never reaches an
//! observer. Cancellation is not an error and has its own observer channel.

use std::path::PathBuf;
use std::time::Duration;

/// Connection-level failures reported by a `Transport`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The host platform reports no network connectivity.
    #[error("not connected to the network")]
    Offline,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// The request could not be sent at all (bad URL, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The response arrived but could not be written to its download path.
    #[error("download failed: {0}")]
    Download(String),
}

impl TransportError {
    /// Whether the failure is attributable to missing connectivity.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::Offline
                | TransportError::HostNotFound(_)
                | TransportError::Connection(_)
                | TransportError::Io(_)
        )
    }
}

/// Terminal failure delivered to an operation's observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Non-2xx response. Headers and body are kept so callers can inspect
    /// what the server said.
    #[error("HTTP {status}")]
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request parameters could not be encoded into a body.
    #[error("request encoding failed: {0}")]
    Encoding(String),
}

impl OperationError {
    /// Transport connectivity failures and timeouts may be frozen for replay.
    pub fn is_freeze_eligible(&self) -> bool {
        match self {
            OperationError::Transport(err) => err.is_connectivity(),
            OperationError::Timeout(_) => true,
            OperationError::Http { .. } | OperationError::Encoding(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            OperationError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures inside the durable stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt entry at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures while building an `Engine`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no tokio runtime available: {0}")]
    Runtime(String),
}
