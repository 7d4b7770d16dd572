//! Error types for the replication pipeline.
//!
//! One crate-wide error enum with a retriability classifier: transient
//! transport conditions are retried in place by the component that hit
//! them, everything else crosses the task boundary and reaches the root.

use thiserror::Error;

/// Replication pipeline errors.
#[derive(Error, Debug)]
pub enum EstuaryError {
    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecoverable replication error (server id conflict, purged logs)
    #[error("Replication error: {0}")]
    Replication(String),

    /// Transient transport failure (upstream disconnect, request timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bulk sink failure that exhausted its retry budget
    #[error("Sink error: {0}")]
    Sink(String),

    /// Position or counter store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A rule references a column the table does not have
    #[error("Schema mismatch: {schema}.{table} has no column {column}")]
    SchemaMismatch {
        schema: String,
        table: String,
        column: String,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML configuration parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EstuaryError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient conditions that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Storage(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::Replication(_)
            | Self::Sink(_)
            | Self::SchemaMismatch { .. }
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Other(_) => false,
        }
    }
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, EstuaryError>;
