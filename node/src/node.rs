//! Full node: a runtime kept alive until Ctrl-C

use manifold_core::{LockPolicy, ManifoldError, NodeConfig};
use tokio::signal;
use tracing::{error, info};

use crate::runtime::NodeRuntime;

/// Full Manifold node
pub struct ManifoldNode {
    config: NodeConfig,
}

impl ManifoldNode {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start the reactors and run until a shutdown signal.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("Starting Manifold node {}...", self.config.name);
        let runtime = NodeRuntime::start(self.config.clone())?;
        for node in runtime.nodes() {
            info!("Reactor {} is up", node);
        }

        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping node..."),
            Err(e) => error!("Error waiting for shutdown signal: {}", e),
        }

        for status in runtime.status() {
            info!(
                "{}: {} keys at {}, {} commits, {} conflicts",
                status.node, status.keys, status.stamp, status.committed, status.conflicts
            );
        }
        tokio::task::spawn_blocking(move || runtime.shutdown())
            .await
            .map_err(|e| ManifoldError::Internal(e.to_string()))??;

        info!("Node stopped");
        Ok(())
    }
}

/// Node builder for easier configuration
pub struct NodeBuilder {
    config: NodeConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.config.reactor.threads = threads;
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.config.transaction.lock_policy = policy;
        self
    }

    pub fn gossip_interval_ms(mut self, interval: u64) -> Self {
        self.config.sync.gossip_interval_ms = interval;
        self
    }

    pub fn build(self) -> ManifoldNode {
        ManifoldNode::new(self.config)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let node = NodeBuilder::new()
            .name("n")
            .threads(2)
            .lock_policy(LockPolicy::NoWait)
            .gossip_interval_ms(25)
            .build();
        assert_eq!(node.config().name, "n");
        assert_eq!(node.config().reactor.threads, 2);
        assert_eq!(node.config().transaction.lock_policy, LockPolicy::NoWait);
        assert_eq!(node.config().sync.gossip_interval_ms, 25);
        assert!(node.config().validate().is_ok());
    }
}
