//! Scripted walk through transactions, a conflict, gossip and a remote commit

use manifold_core::{ByteKey, KeyRange, ManifoldError, ManifoldResult, NodeConfig, NodeHandle, VersionStamp};
use manifold_reactor::on_result;
use manifold_state::WriteOp;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::info;

use crate::cluster::LocalCluster;
use crate::worker::{ReactorNode, ReactorStatus};

/// Gossip rounds attempted before giving up on convergence
const MAX_GOSSIP_ROUNDS: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub committed: u64,
    pub conflicts: u64,
    pub merged: u64,
    /// Stamp of the two-phase commit, once the peer prepared it
    pub remote_commit: Option<String>,
    pub gossip_rounds: usize,
    pub digests: Vec<(NodeHandle, String)>,
    pub converged: bool,
    pub nodes: Vec<ReactorStatus>,
}

fn key(s: &str) -> ManifoldResult<ByteKey> {
    ByteKey::from_str_key(s)
}

fn first_two(cluster: &LocalCluster) -> ManifoldResult<(&ReactorNode, &ReactorNode)> {
    match (cluster.node(0), cluster.node(1)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ManifoldError::InvalidState("the demo needs two nodes".to_string())),
    }
}

/// Commit `pairs` on `node` in one transaction locking their whole span.
fn write_all(node: &ReactorNode, pairs: &[(&str, &str)]) -> ManifoldResult<bool> {
    let mut keys = pairs.iter().map(|(k, _)| key(k)).collect::<ManifoldResult<Vec<_>>>()?;
    keys.sort();
    let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
        return Ok(true);
    };
    let mut txn = node.engine().begin();
    txn.try_lock_range(KeyRange::new(first.clone(), last.clone())?)?;
    for (k, v) in pairs {
        txn.write(key(k)?, v.as_bytes().to_vec())?;
    }
    txn.commit()
}

/// Two transactions race for `key` on `node`; the second waits for the lock
/// and then loses validation. Returns the waiter's commit outcome.
fn contend(node: &ReactorNode, name: &str) -> ManifoldResult<Option<bool>> {
    let range = KeyRange::point(key(name)?);
    let reactor = node.reactor();

    let mut first = node.engine().begin();
    first.try_lock_range(range.clone())?;
    first.write(key(name)?, b"first".to_vec())?;

    let outcome = Rc::new(Cell::new(None));
    let second = node.engine().begin();
    let seen = outcome.clone();
    let contended = key(name)?;
    reactor.enqueue(move |_| {
        second.lock_range(range, move |mut second, locked, _| {
            let committed = locked
                .and_then(|_| second.write(contended, b"second".to_vec()))
                .and_then(|_| second.commit());
            seen.set(Some(committed.unwrap_or(false)));
        });
    });
    reactor.run_until_idle();
    first.commit()?;
    reactor.run_until_idle();
    Ok(outcome.get())
}

pub fn run_demo(node_count: usize) -> ManifoldResult<DemoReport> {
    let cluster = LocalCluster::new(node_count.max(2), &NodeConfig::default())?;
    let (a, b) = first_two(&cluster)?;

    write_all(a, &[("alpha", "1"), ("beta", "2")])?;
    let waiter = contend(a, "counter")?;
    info!("Waiting transaction committed: {:?}", waiter);
    write_all(b, &[("gamma", "3")])?;

    // two-phase commit of a write proposed by a to b
    let accepted: Rc<RefCell<Option<VersionStamp>>> = Rc::new(RefCell::new(None));
    let slot = accepted.clone();
    a.sync().propose(
        b.node(),
        vec![WriteOp::Put {
            key: key("delta")?,
            value: b"4".to_vec(),
        }],
        on_result(move |result: Result<VersionStamp, ManifoldError>, _| {
            *slot.borrow_mut() = result.ok();
        }),
    )?;
    cluster.pump();

    let mut gossip_rounds = 0;
    while gossip_rounds < MAX_GOSSIP_ROUNDS && (gossip_rounds == 0 || !cluster.converged()) {
        cluster.gossip_round();
        gossip_rounds += 1;
    }

    let nodes: Vec<ReactorStatus> = cluster.nodes().iter().map(|n| n.status()).collect();
    let remote_commit = accepted.borrow().map(|s| s.to_string());
    let report = DemoReport {
        committed: nodes.iter().map(|s| s.committed).sum(),
        conflicts: nodes.iter().map(|s| s.conflicts).sum(),
        merged: nodes.iter().map(|s| s.entries_merged).sum(),
        remote_commit,
        gossip_rounds,
        digests: cluster
            .digests()
            .into_iter()
            .map(|(node, digest)| (node, digest.to_hex()))
            .collect(),
        converged: cluster.converged(),
        nodes,
    };
    info!(
        "Demo finished: {} commits, {} conflicts, {} merged, converged={}",
        report.committed, report.conflicts, report.merged, report.converged
    );
    Ok(report)
}
