//! Error types for Manifold

use crate::types::VersionStamp;
use thiserror::Error;

/// Main error type for Manifold
#[derive(Error, Debug)]
pub enum ManifoldError {
    // ============ Value Construction Errors ============
    #[error("Invalid key: keys must hold at least one byte")]
    InvalidKey,

    #[error("Invalid version stamp: expected 16 bytes, got {len}")]
    InvalidStamp { len: usize },

    // ============ Transaction Errors ============
    #[error("Transaction conflict")]
    Conflict,

    #[error("Transaction aborted")]
    Aborted,

    #[error("Access to key {0} outside any locked range")]
    UnlockedAccess(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ============ Scheduler Errors ============
    #[error("Task handle {0} completed more than once")]
    DoubleComplete(u64),

    #[error("Unknown task handle {0}")]
    UnknownHandle(u64),

    // ============ Replication Errors ============
    #[error("Unknown commit {0}")]
    UnknownCommit(VersionStamp),

    // ============ Datastore Errors ============
    #[error(transparent)]
    DbCreation(#[from] DbCreationError),

    // ============ Network Errors ============
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    Config(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ManifoldError {
    /// Conflicts and aborts are routine outcomes of optimistic concurrency.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ManifoldError::Conflict | ManifoldError::Aborted)
    }
}

/// Errors raised by the datastore lifecycle collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbCreationError {
    #[error("Datastore already exists: {0}")]
    AlreadyExists(String),

    #[error("Datastore not found: {0}")]
    NotFound(String),

    #[error("Datastore kind mismatch for {name}: expected {expected}, found {found}")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Datastore backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for ManifoldError {
    fn from(err: std::io::Error) -> Self {
        ManifoldError::Internal(err.to_string())
    }
}

impl From<bincode::Error> for ManifoldError {
    fn from(err: bincode::Error) -> Self {
        ManifoldError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ManifoldError {
    fn from(err: serde_json::Error) -> Self {
        ManifoldError::Serialization(err.to_string())
    }
}
