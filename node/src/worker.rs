//! One thread-class reactor and everything it owns

use manifold_core::{
    DatastoreKind, DbCreationContext, DbName, ManifoldResult, NodeConfig, NodeHandle, VersionStamp,
};
use manifold_reactor::{on_finished, FabricEndpoint, IncomingMessage, Reactor, ReactorDriver};
use manifold_state::{create_clock, KeyValueSnapshottingStore, MemoryDbRegistry, SharedClock, SharedStore};
use manifold_sync::{DataManager, StoreDataManager, SyncService};
use manifold_txn::TransactionEngine;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{client_port, serve_request, ClientCodec, ClientRequest};
use crate::runtime::StatusTable;

/// Snapshot of a node's progress, published across threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactorStatus {
    pub node: NodeHandle,
    /// Newest stamp applied to the node's store
    pub stamp: String,
    pub keys: usize,
    pub versions: usize,
    pub committed: u64,
    pub conflicts: u64,
    pub entries_merged: u64,
    pub running: bool,
}

/// A reactor with its datastore, transaction engine and sync service.
///
/// Built on the thread that drives it; none of its parts are `Send`.
pub struct ReactorNode {
    reactor: Reactor,
    registry: MemoryDbRegistry,
    store: SharedStore,
    clock: SharedClock,
    engine: TransactionEngine,
    manager: Rc<RefCell<StoreDataManager>>,
    sync: SyncService,
    config: NodeConfig,
}

impl ReactorNode {
    pub fn new(endpoint: FabricEndpoint, config: &NodeConfig) -> ManifoldResult<Self> {
        let reactor = Reactor::with_config(endpoint, &config.reactor);
        let node = reactor.node();

        let mut registry = MemoryDbRegistry::new();
        let store = registry.create_or_open(
            DatastoreKind::VersionedKv,
            &DbName::from(config.datastore.name.as_str()),
        )?;
        let clock = create_clock(node.id());
        let engine = TransactionEngine::new(store.clone(), clock.clone(), reactor.clone(), &config.transaction);

        let manager = Rc::new(RefCell::new(StoreDataManager::new(node, store.clone(), clock.clone())));
        let shared: Rc<RefCell<dyn DataManager>> = manager.clone();
        let sync = SyncService::install(&reactor, shared, clock.clone(), &config.sync)?;

        let client_engine = engine.clone();
        reactor.add_net_listener(
            client_port()?,
            on_finished(move |msg: IncomingMessage<ClientRequest>, _: &Reactor| {
                serve_request(&client_engine, msg.payload)
            }),
            ClientCodec::new(),
        );

        info!("Node {} ready on datastore {}", node, config.datastore.name);
        Ok(Self {
            reactor,
            registry,
            store,
            clock,
            engine,
            manager,
            sync,
            config: config.clone(),
        })
    }

    pub fn node(&self) -> NodeHandle {
        self.reactor.node()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn registry(&self) -> &MemoryDbRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub fn manager(&self) -> &Rc<RefCell<StoreDataManager>> {
        &self.manager
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn latest_stamp(&self) -> VersionStamp {
        self.store.borrow().latest_stamp()
    }

    pub fn status(&self) -> ReactorStatus {
        let store = self.store.borrow();
        let engine = self.engine.stats();
        ReactorStatus {
            node: self.node(),
            stamp: store.latest_stamp().to_string(),
            keys: store.key_count(),
            versions: store.version_count(),
            committed: engine.committed,
            conflicts: engine.conflicts,
            entries_merged: self.sync.stats().entries_merged,
            running: !self.reactor.is_shut_down(),
        }
    }

    /// Ask every peer but this node for its state.
    pub fn gossip(&self, peers: &[NodeHandle]) {
        for peer in peers.iter().copied().filter(|p| *p != self.node()) {
            if let Err(e) = self.sync.request_state(peer) {
                warn!("State request from {} to {} failed: {}", self.node(), peer, e);
            }
        }
    }

    /// Periodic housekeeping: gossip, deferred merges, garbage collection.
    pub fn tick(&self, peers: &[NodeHandle]) {
        if self.config.sync.enabled {
            self.gossip(peers);
        }
        if !self.config.sync.merge_on_receive {
            match self.sync.merge_received() {
                Ok(summary) if summary.adopted > 0 => {
                    debug!("{} merged {} deferred entries", self.node(), summary.adopted)
                }
                Ok(_) => {}
                Err(e) => warn!("Deferred merge on {} failed: {}", self.node(), e),
            }
        }
        let removed = self.engine.collect_garbage();
        if removed > 0 {
            debug!("{} collected {} obsolete versions", self.node(), removed);
        }
    }

    /// Drive the reactor until `shutdown` flips or the fabric says stop,
    /// publishing status into `table` on every tick.
    pub async fn run(
        &self,
        peers: Vec<NodeHandle>,
        shutdown: watch::Receiver<bool>,
        table: StatusTable,
    ) -> ManifoldResult<usize> {
        let tick = Duration::from_millis(self.config.sync.gossip_interval_ms.max(1));
        let driver = ReactorDriver::new(self.reactor.clone(), &self.config.reactor);
        table.write().insert(self.node(), self.status());

        let ran = driver
            .run(shutdown, tick, |_| {
                self.tick(&peers);
                table.write().insert(self.node(), self.status());
            })
            .await?;

        table.write().insert(self.node(), self.status());
        info!("Node {} stopped after {} tasks", self.node(), ran);
        Ok(ran)
    }
}

impl Drop for ReactorNode {
    fn drop(&mut self) {
        // the client listener holds the engine, which holds the reactor
        self.sync.uninstall();
        if let Ok(port) = client_port() {
            self.reactor.remove_net_listener(&port);
        }
    }
}
