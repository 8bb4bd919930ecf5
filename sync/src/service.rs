//! Sync service: port listeners for state exchange and remote commits

use manifold_core::{ByteKey, ManifoldError, ManifoldResult, NodeHandle, SyncConfig, VersionStamp};
use manifold_reactor::{on_finished, IncomingMessage, OutgoingMessage, Reactor, TaskHandle, TaskListener};
use manifold_state::{SharedClock, WriteOp};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

use crate::manager::{DataManager, KnownState, MergeSummary};
use crate::protocol::{SyncCodec, SyncMessage, SyncPorts};

/// Counters reported by `SyncService::stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub requests_served: u64,
    pub states_received: u64,
    pub entries_merged: u64,
    pub commits_staged: u64,
    pub commits_accepted: u64,
    pub commits_rolled_back: u64,
    pub proposals_rejected: u64,
}

struct Proposal {
    peer: NodeHandle,
    handle: TaskHandle<VersionStamp>,
}

/// State shared by the service handle and its port listeners
struct SyncShared {
    manager: Rc<RefCell<dyn DataManager>>,
    ports: SyncPorts,
    codec: SyncCodec,
    merge_on_receive: bool,
    /// Latest state per peer, kept when merging is deferred
    received: RefCell<HashMap<NodeHandle, KnownState>>,
    proposals: RefCell<HashMap<VersionStamp, Proposal>>,
    stats: Cell<SyncStats>,
}

impl SyncShared {
    fn bump(&self, f: impl FnOnce(&mut SyncStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn send(&self, reactor: &Reactor, port: &ByteKey, to: NodeHandle, message: SyncMessage) {
        let kind = message.message_type();
        if let Err(e) = reactor.net_send(port, OutgoingMessage::new(to, message), &self.codec) {
            error!("Failed to send {} to {}: {}", kind, to, e);
        }
    }

    fn merge(&self, state: &KnownState) -> ManifoldResult<MergeSummary> {
        let summary = self.manager.borrow_mut().merge_with(state)?;
        self.bump(|s| s.entries_merged += summary.adopted as u64);
        Ok(summary)
    }

    fn on_state(&self, msg: IncomingMessage<SyncMessage>, reactor: &Reactor) {
        let sender = msg.sender;
        match msg.payload {
            SyncMessage::StateRequest => {
                let state = self.manager.borrow().get_known_state();
                debug!("Serving {} entries at {} to {}", state.len(), state.stamp, sender);
                self.send(reactor, &self.ports.state, sender, SyncMessage::StateResponse(state));
                self.bump(|s| s.requests_served += 1);
            }
            SyncMessage::StateResponse(state) => {
                self.bump(|s| s.states_received += 1);
                if self.merge_on_receive {
                    if let Err(e) = self.merge(&state) {
                        warn!("Could not merge state from {}: {}", sender, e);
                    }
                } else {
                    self.received.borrow_mut().insert(sender, state);
                }
            }
            other => warn!("Unexpected {} from {} on the state port", other.message_type(), sender),
        }
    }

    fn on_commit(&self, msg: IncomingMessage<SyncMessage>, reactor: &Reactor) {
        let sender = msg.sender;
        match msg.payload {
            SyncMessage::Prepare { stamp, writes } => {
                let staged = self.manager.borrow_mut().stage_commit(stamp, writes);
                let reply = match staged {
                    Ok(()) => {
                        self.bump(|s| s.commits_staged += 1);
                        SyncMessage::Prepared { stamp }
                    }
                    Err(e) => SyncMessage::Rejected {
                        stamp,
                        reason: e.to_string(),
                    },
                };
                self.send(reactor, &self.ports.commit, sender, reply);
            }
            SyncMessage::Prepared { stamp } => {
                let Some(proposal) = self.proposals.borrow_mut().remove(&stamp) else {
                    debug!("{} prepared commit {} that is no longer proposed", sender, stamp);
                    return;
                };
                self.send(reactor, &self.ports.commit, proposal.peer, SyncMessage::Accept { stamp });
                if let Err(e) = reactor.complete(proposal.handle, stamp) {
                    warn!("Proposal {} completed twice: {}", stamp, e);
                }
            }
            SyncMessage::Rejected { stamp, reason } => {
                let Some(proposal) = self.proposals.borrow_mut().remove(&stamp) else {
                    return;
                };
                self.bump(|s| s.proposals_rejected += 1);
                let err = ManifoldError::Network(format!("{} rejected commit {}: {}", sender, stamp, reason));
                if let Err(e) = reactor.fail(proposal.handle, err) {
                    warn!("Proposal {} completed twice: {}", stamp, e);
                }
            }
            SyncMessage::Accept { stamp } => {
                let accepted = self.manager.borrow_mut().accept_commit(stamp);
                match accepted {
                    Ok(summary) => {
                        self.bump(|s| {
                            s.commits_accepted += 1;
                            s.entries_merged += summary.adopted as u64;
                        });
                    }
                    Err(e) => warn!("Cannot accept commit {} from {}: {}", stamp, sender, e),
                }
            }
            SyncMessage::Rollback { stamp } => {
                if self.manager.borrow_mut().rollback_commit(stamp) {
                    self.bump(|s| s.commits_rolled_back += 1);
                }
            }
            other => warn!("Unexpected {} from {} on the commit port", other.message_type(), sender),
        }
    }
}

/// Sync endpoint of one reactor.
pub struct SyncService {
    reactor: Reactor,
    clock: SharedClock,
    shared: Rc<SyncShared>,
}

impl SyncService {
    /// Register the sync listeners on `reactor`, replacing any already there.
    pub fn install(
        reactor: &Reactor,
        manager: Rc<RefCell<dyn DataManager>>,
        clock: SharedClock,
        config: &SyncConfig,
    ) -> ManifoldResult<Self> {
        let shared = Rc::new(SyncShared {
            manager,
            ports: SyncPorts::new()?,
            codec: SyncCodec::new(),
            merge_on_receive: config.merge_on_receive,
            received: RefCell::new(HashMap::new()),
            proposals: RefCell::new(HashMap::new()),
            stats: Cell::new(SyncStats::default()),
        });

        let state = shared.clone();
        reactor.add_net_listener(
            shared.ports.state.clone(),
            on_finished(move |msg: IncomingMessage<SyncMessage>, reactor| state.on_state(msg, reactor)),
            SyncCodec::new(),
        );
        let commit = shared.clone();
        reactor.add_net_listener(
            shared.ports.commit.clone(),
            on_finished(move |msg: IncomingMessage<SyncMessage>, reactor| commit.on_commit(msg, reactor)),
            SyncCodec::new(),
        );
        info!("Sync service installed on {}", reactor.node());

        Ok(Self {
            reactor: reactor.clone(),
            clock,
            shared,
        })
    }

    pub fn uninstall(&self) {
        self.reactor.remove_net_listener(&self.shared.ports.state);
        self.reactor.remove_net_listener(&self.shared.ports.commit);
    }

    pub fn ports(&self) -> &SyncPorts {
        &self.shared.ports
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.stats.get()
    }

    /// Ask `peer` for its known state; the response is merged, or kept for
    /// `merge_received`, when it arrives.
    pub fn request_state(&self, peer: NodeHandle) -> ManifoldResult<()> {
        self.reactor.net_send(
            &self.shared.ports.state,
            OutgoingMessage::new(peer, SyncMessage::StateRequest),
            &self.shared.codec,
        )
    }

    /// Propose `writes` to `peer` as a two-phase commit. `listener` receives
    /// the commit stamp once the peer has staged it and been told to accept,
    /// or an error if the peer rejects it.
    pub fn propose<L>(&self, peer: NodeHandle, writes: Vec<WriteOp>, listener: L) -> ManifoldResult<VersionStamp>
    where
        L: TaskListener<VersionStamp> + 'static,
    {
        let stamp = self.clock.borrow_mut().next();
        let handle = self.reactor.defer(listener);
        self.shared
            .proposals
            .borrow_mut()
            .insert(stamp, Proposal { peer, handle });
        debug!("Proposing commit {} with {} writes to {}", stamp, writes.len(), peer);
        self.reactor.net_send(
            &self.shared.ports.commit,
            OutgoingMessage::new(peer, SyncMessage::Prepare { stamp, writes }),
            &self.shared.codec,
        )?;
        Ok(stamp)
    }

    /// Withdraw an outstanding proposal. Its listener gets `Aborted`.
    pub fn rollback(&self, stamp: VersionStamp) -> ManifoldResult<bool> {
        let Some(proposal) = self.shared.proposals.borrow_mut().remove(&stamp) else {
            return Ok(false);
        };
        self.reactor.net_send(
            &self.shared.ports.commit,
            OutgoingMessage::new(proposal.peer, SyncMessage::Rollback { stamp }),
            &self.shared.codec,
        )?;
        self.reactor.fail(proposal.handle, ManifoldError::Aborted)?;
        Ok(true)
    }

    pub fn outstanding_proposals(&self) -> usize {
        self.shared.proposals.borrow().len()
    }

    /// Peers whose state was received but not merged yet.
    pub fn pending_states(&self) -> Vec<NodeHandle> {
        let mut peers: Vec<_> = self.shared.received.borrow().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Merge every state kept since the last call.
    ///
    /// A state that fails to merge is discarded without stopping the others;
    /// the first such failure is returned once every state has been tried.
    pub fn merge_received(&self) -> ManifoldResult<MergeSummary> {
        let mut states: Vec<_> = self.shared.received.borrow_mut().drain().collect();
        states.sort_by_key(|(peer, _)| *peer);

        let mut total = MergeSummary::default();
        let mut first_error = None;
        for (peer, state) in states {
            match self.shared.merge(&state) {
                Ok(summary) => {
                    total.adopted += summary.adopted;
                    total.kept_local += summary.kept_local;
                    total.stamp = summary.stamp.or(total.stamp);
                }
                Err(e) => {
                    warn!("Dropping state from {}: {}", peer, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}
