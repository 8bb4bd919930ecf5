//! In-process message fabric
//!
//! Every reactor joins the fabric under a `NodeHandle` and receives an inbox.
//! Payloads travel as codec-encoded bytes; the fabric never looks inside them.

use dashmap::DashMap;
use manifold_core::{ByteKey, ManifoldError, ManifoldResult, NodeHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Encoded message in flight between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub port: ByteKey,
    pub sender: NodeHandle,
    pub receiver: NodeHandle,
    pub payload: Vec<u8>,
}

/// Item read from an inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Envelope),
    /// The node should stop its driver
    Shutdown,
}

/// Inbound message as seen by a port listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage<T> {
    pub payload: T,
    pub sender: NodeHandle,
}

/// Outbound message addressed to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage<T> {
    pub payload: T,
    pub receiver: NodeHandle,
}

impl<T> OutgoingMessage<T> {
    pub fn new(receiver: NodeHandle, payload: T) -> Self {
        Self { payload, receiver }
    }
}

/// Routing table shared by every node in one process.
#[derive(Clone, Default)]
pub struct Fabric {
    routes: Arc<DashMap<NodeHandle, mpsc::UnboundedSender<Delivery>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` and return its endpoint.
    pub fn join(&self, node: NodeHandle) -> ManifoldResult<FabricEndpoint> {
        if self.routes.contains_key(&node) {
            return Err(ManifoldError::Network(format!("{} already joined the fabric", node)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(node, tx);
        debug!("{} joined the fabric", node);
        Ok(FabricEndpoint {
            node,
            fabric: self.clone(),
            inbox: rx,
        })
    }

    pub fn leave(&self, node: NodeHandle) -> bool {
        let removed = self.routes.remove(&node).is_some();
        if removed {
            debug!("{} left the fabric", node);
        }
        removed
    }

    /// Joined nodes, ascending.
    pub fn nodes(&self) -> Vec<NodeHandle> {
        let mut nodes: Vec<_> = self.routes.iter().map(|r| *r.key()).collect();
        nodes.sort();
        nodes
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.routes.contains_key(&node)
    }

    /// Hand `envelope` to its receiver's inbox. Returns false if the receiver
    /// is unknown or gone; the message is dropped.
    pub fn send(&self, envelope: Envelope) -> bool {
        let receiver = envelope.receiver;
        let delivered = match self.routes.get(&receiver) {
            Some(route) => route.send(Delivery::Message(envelope)).is_ok(),
            None => false,
        };
        if !delivered {
            warn!("Dropping message for unreachable {}", receiver);
        }
        delivered
    }

    /// Ask every joined node to stop.
    pub fn shutdown_all(&self) {
        for route in self.routes.iter() {
            let _ = route.value().send(Delivery::Shutdown);
        }
    }
}

/// One node's attachment to the fabric.
pub struct FabricEndpoint {
    node: NodeHandle,
    fabric: Fabric,
    inbox: mpsc::UnboundedReceiver<Delivery>,
}

impl FabricEndpoint {
    pub fn node(&self) -> NodeHandle {
        self.node
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub(crate) fn into_parts(self) -> (NodeHandle, Fabric, mpsc::UnboundedReceiver<Delivery>) {
        (self.node, self.fabric, self.inbox)
    }
}
