//! Error types for the control server library.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems. Every variant aborts startup with a
/// message naming the offending file and field.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON or does not match the schema.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The config parsed but violates a semantic rule.
    #[error("config error in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced to callers of [`crate::relay::manager::RelayManager`]
/// send operations. Transport faults never appear here — those are absorbed
/// by the connection and reported through status events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The target cube id is not in the routing table.
    #[error("cube {0} is not registered")]
    UnknownCube(String),

    /// The relay owning the target cube is not currently connected.
    #[error("relay {0} is not connected")]
    RelayUnavailable(String),

    /// The command itself is malformed (empty targets, out-of-range speed).
    #[error("{0}")]
    InvalidCommand(String),
}

/// Result type alias for relay send operations.
pub type RelayResult<T> = std::result::Result<T, RelayError>;
