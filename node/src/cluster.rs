//! Several nodes driven by hand on the calling thread

use manifold_core::{ManifoldError, ManifoldResult, NodeConfig, NodeHandle};
use manifold_reactor::Fabric;
use manifold_sync::{DataManager, StateDigest};
use tracing::debug;

use crate::worker::ReactorNode;

/// Nodes sharing one fabric, stepped explicitly instead of by drivers.
pub struct LocalCluster {
    fabric: Fabric,
    nodes: Vec<ReactorNode>,
}

impl LocalCluster {
    pub fn new(count: usize, config: &NodeConfig) -> ManifoldResult<Self> {
        config.validate()?;
        if count == 0 {
            return Err(ManifoldError::InvalidState("a cluster needs at least one node".to_string()));
        }
        let fabric = Fabric::new();
        let nodes = (1..=count as u64)
            .map(|i| ReactorNode::new(fabric.join(NodeHandle::new(i))?, config))
            .collect::<ManifoldResult<Vec<_>>>()?;
        Ok(Self { fabric, nodes })
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&ReactorNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[ReactorNode] {
        &self.nodes
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|n| n.node()).collect()
    }

    /// Run every reactor until none has work left. Returns the tasks run.
    pub fn pump(&self) -> usize {
        let mut total = 0;
        loop {
            let ran: usize = self.nodes.iter().map(|n| n.reactor().run_until_idle()).sum();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Every node asks every other for its state, then the cluster is pumped.
    pub fn gossip_round(&self) -> usize {
        let peers = self.handles();
        for node in &self.nodes {
            node.gossip(&peers);
        }
        let ran = self.pump();
        debug!("Gossip round over {} nodes ran {} tasks", self.nodes.len(), ran);
        ran
    }

    /// Content digest of each node's known state.
    pub fn digests(&self) -> Vec<(NodeHandle, StateDigest)> {
        self.nodes
            .iter()
            .map(|n| (n.node(), n.manager().borrow().get_known_state().content_digest()))
            .collect()
    }

    /// True when every node holds the same entries.
    pub fn converged(&self) -> bool {
        let digests = self.digests();
        digests.windows(2).all(|w| w[0].1 == w[1].1)
    }
}
