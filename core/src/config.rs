//! Configuration types for Manifold

use crate::error::ManifoldError;
use crate::traits::ManifoldResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Logging level
    pub log_level: String,

    /// Reactor configuration
    pub reactor: ReactorConfig,

    /// Transaction engine configuration
    pub transaction: TransactionConfig,

    /// State synchronisation configuration
    pub sync: SyncConfig,

    /// Datastore opened by every reactor
    pub datastore: DatastoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "manifold-node".to_string(),
            log_level: "info".to_string(),
            reactor: ReactorConfig::default(),
            transaction: TransactionConfig::default(),
            sync: SyncConfig::default(),
            datastore: DatastoreConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json(content: &str) -> ManifoldResult<Self> {
        let config: NodeConfig = serde_json::from_str(content)
            .map_err(|e| ManifoldError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> ManifoldResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> ManifoldResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ManifoldError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> ManifoldResult<()> {
        if self.name.is_empty() {
            return Err(ManifoldError::Config("name must not be empty".to_string()));
        }
        if self.reactor.idle_poll_ms == 0 {
            return Err(ManifoldError::Config(
                "reactor.idle_poll_ms must be positive".to_string(),
            ));
        }
        if self.sync.enabled && self.sync.gossip_interval_ms == 0 {
            return Err(ManifoldError::Config(
                "sync.gossip_interval_ms must be positive when sync is enabled".to_string(),
            ));
        }
        if self.datastore.name.is_empty() {
            return Err(ManifoldError::Config(
                "datastore.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Number of thread-class reactors; 0 derives it from the resource set
    pub threads: usize,

    /// Upper bound on ready tasks run per scheduler turn
    pub max_tasks_per_turn: usize,

    /// How long an idle reactor waits for a delivery before re-checking
    pub idle_poll_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_tasks_per_turn: 1024,
            idle_poll_ms: 50,
        }
    }
}

/// What `lock_range` does when the range is held by another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Queue until the range is released
    #[default]
    Wait,
    /// Fail fast with a conflict
    NoWait,
}

/// Transaction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransactionConfig {
    pub lock_policy: LockPolicy,
}

/// State synchronisation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Exchange known state with peer reactors
    pub enabled: bool,

    /// Interval between state requests to peers
    pub gossip_interval_ms: u64,

    /// Merge a peer's state as soon as its response arrives
    pub merge_on_receive: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gossip_interval_ms: 1000,
            merge_on_receive: true,
        }
    }
}

/// Datastore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Name passed to the datastore registry
    pub name: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}
