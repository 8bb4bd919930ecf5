//! Node runtime: one OS thread per thread-class reactor

use manifold_core::{
    ByteKey, LocalResourceSet, ManifoldError, ManifoldResult, NodeConfig, NodeHandle, ReactorConfig,
    ResourceClass, StaticResourceSet, Value,
};
use manifold_reactor::{Codec, Envelope, Fabric, FabricEndpoint};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{error, info};

use crate::client::{client_port, ClientCodec, ClientRequest};
use crate::worker::{ReactorNode, ReactorStatus};

/// Latest status of every node, written by the reactor threads
pub type StatusTable = Arc<RwLock<HashMap<NodeHandle, ReactorStatus>>>;

/// Running set of reactor threads sharing one fabric.
pub struct NodeRuntime {
    config: NodeConfig,
    fabric: Fabric,
    nodes: Vec<NodeHandle>,
    /// Sender stamped on client requests; never joins the fabric
    client: NodeHandle,
    shutdown: watch::Sender<bool>,
    threads: Vec<JoinHandle<ManifoldResult<()>>>,
    status: StatusTable,
}

impl NodeRuntime {
    /// Number of reactors to start: `threads`, or one per CPU core.
    pub fn reactor_count(config: &ReactorConfig) -> usize {
        if config.threads > 0 {
            return config.threads;
        }
        StaticResourceSet::detect()
            .divide_by(ResourceClass::CpuCore)
            .len()
            .max(1)
    }

    /// Validate `config`, then start every reactor thread.
    pub fn start(config: NodeConfig) -> ManifoldResult<Self> {
        config.validate()?;
        let count = Self::reactor_count(&config.reactor);

        // random high half keeps handles distinct across processes
        let base = (rand::thread_rng().gen::<u32>() as u64) << 32;
        let fabric = Fabric::new();
        let endpoints = (1..=count as u64)
            .map(|i| fabric.join(NodeHandle::new(base | i)))
            .collect::<ManifoldResult<Vec<_>>>()?;
        let nodes = fabric.nodes();

        let (shutdown, _) = watch::channel(false);
        let status: StatusTable = Arc::new(RwLock::new(HashMap::new()));
        let mut threads = Vec::with_capacity(count);
        for endpoint in endpoints {
            threads.push(spawn_reactor(
                endpoint,
                config.clone(),
                nodes.clone(),
                shutdown.subscribe(),
                status.clone(),
            )?);
        }

        info!("{} started {} reactors", config.name, count);
        Ok(Self {
            config,
            fabric,
            nodes,
            client: NodeHandle::new(base),
            shutdown,
            threads,
            status,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn status(&self) -> Vec<ReactorStatus> {
        let table = self.status.read();
        self.nodes.iter().filter_map(|n| table.get(n).cloned()).collect()
    }

    pub fn status_of(&self, node: NodeHandle) -> Option<ReactorStatus> {
        self.status.read().get(&node).cloned()
    }

    /// Queue a client request on `node`. Returns false if the node is gone.
    pub fn submit(&self, node: NodeHandle, request: ClientRequest) -> ManifoldResult<bool> {
        let envelope = Envelope {
            port: client_port()?,
            sender: self.client,
            receiver: node,
            payload: ClientCodec::new().encode(&request)?,
        };
        Ok(self.fabric.send(envelope))
    }

    pub fn put(&self, node: NodeHandle, key: ByteKey, value: Value) -> ManifoldResult<bool> {
        self.submit(node, ClientRequest::Put { key, value })
    }

    pub fn delete(&self, node: NodeHandle, key: ByteKey) -> ManifoldResult<bool> {
        self.submit(node, ClientRequest::Delete { key })
    }

    /// Stop every reactor and wait for its thread.
    pub fn shutdown(mut self) -> ManifoldResult<()> {
        let threads = std::mem::take(&mut self.threads);
        info!("Stopping {} reactors", threads.len());
        let _ = self.shutdown.send(true);
        self.fabric.shutdown_all();

        let mut first_error = None;
        for thread in threads {
            let outcome = thread
                .join()
                .map_err(|_| ManifoldError::Internal("reactor thread panicked".to_string()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!("Reactor thread failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// True while a shutdown has not been requested.
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }
}

fn spawn_reactor(
    endpoint: FabricEndpoint,
    config: NodeConfig,
    peers: Vec<NodeHandle>,
    shutdown: watch::Receiver<bool>,
    status: StatusTable,
) -> ManifoldResult<JoinHandle<ManifoldResult<()>>> {
    let node = endpoint.node();
    let handle = std::thread::Builder::new()
        .name(format!("reactor-{:x}", node.id() & 0xffff_ffff))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let worker = ReactorNode::new(endpoint, &config)?;
            runtime.block_on(worker.run(peers, shutdown, status))?;
            Ok(())
        })?;
    Ok(handle)
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            // dropped without shutdown(); the threads still need a stop
            let _ = self.shutdown.send(true);
            self.fabric.shutdown_all();
        }
    }
}
