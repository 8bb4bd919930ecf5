//! Known state, merges and remote commit staging

use manifold_core::{ManifoldError, ManifoldResult, NodeHandle, Timestamp, VersionStamp};
use manifold_state::{KeyValueSnapshottingStore, SharedClock, SharedStore, StampedEntry, WriteOp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// BLAKE3 digest of a state summary
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateDigest(pub [u8; 32]);

impl StateDigest {
    /// Digest over the stamp and every entry, in order.
    pub fn compute(stamp: VersionStamp, entries: &[StampedEntry]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(stamp.as_bytes());
        for entry in entries {
            hasher.update(&(entry.key.len() as u64).to_be_bytes());
            hasher.update(entry.key.as_bytes());
            hasher.update(entry.origin.as_bytes());
            match &entry.value {
                Some(value) => {
                    hasher.update(&[1]);
                    hasher.update(&(value.len() as u64).to_be_bytes());
                    hasher.update(value);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        StateDigest(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateDigest({})", self)
    }
}

/// Copy of a node's data as of its local stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub node: NodeHandle,
    pub stamp: VersionStamp,
    pub captured_at: Timestamp,
    /// Newest version of every key, tombstones included, ascending by key
    pub entries: Vec<StampedEntry>,
    pub digest: StateDigest,
}

impl KnownState {
    pub fn new(node: NodeHandle, stamp: VersionStamp, entries: Vec<StampedEntry>) -> Self {
        let digest = StateDigest::compute(stamp, &entries);
        Self {
            node,
            stamp,
            captured_at: Timestamp::now(),
            entries,
            digest,
        }
    }

    /// True if the digest matches the contents.
    pub fn verify(&self) -> bool {
        StateDigest::compute(self.stamp, &self.entries) == self.digest
    }

    /// Digest of the entries alone. Nodes holding the same data agree on it
    /// whatever their local stamps.
    pub fn content_digest(&self) -> StateDigest {
        StateDigest::compute(VersionStamp::ZERO, &self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Remote entries adopted into the local store
    pub adopted: usize,
    /// Remote entries lost to a newer local version
    pub kept_local: usize,
    /// Local stamp the adopted entries were published at
    pub stamp: Option<VersionStamp>,
}

/// Reconciles a node's data with its peers'.
pub trait DataManager {
    fn get_known_state(&self) -> KnownState;

    fn get_local_stamp(&self) -> VersionStamp;

    /// Adopt every remote entry whose origin stamp is newer than the local
    /// version of its key.
    fn merge_with(&mut self, other: &KnownState) -> ManifoldResult<MergeSummary>;

    /// Hold a remote commit until it is accepted or rolled back.
    fn stage_commit(&mut self, stamp: VersionStamp, writes: Vec<WriteOp>) -> ManifoldResult<()>;

    /// Publish a staged commit. Fails with `UnknownCommit` if nothing is
    /// staged under `stamp`.
    fn accept_commit(&mut self, stamp: VersionStamp) -> ManifoldResult<MergeSummary>;

    /// Discard a staged commit. Returns false, and does nothing, if none is
    /// staged under `stamp`.
    fn rollback_commit(&mut self, stamp: VersionStamp) -> bool;
}

/// `DataManager` over one local store.
pub struct StoreDataManager {
    node: NodeHandle,
    store: SharedStore,
    clock: SharedClock,
    staged: BTreeMap<VersionStamp, Vec<WriteOp>>,
}

impl StoreDataManager {
    pub fn new(node: NodeHandle, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            node,
            store,
            clock,
            staged: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> NodeHandle {
        self.node
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn is_staged(&self, stamp: VersionStamp) -> bool {
        self.staged.contains_key(&stamp)
    }

    /// Split `entries` into those newer than the local store and a count of
    /// the rest, then publish the newer ones at a fresh local stamp.
    fn adopt(&mut self, entries: Vec<StampedEntry>) -> ManifoldResult<MergeSummary> {
        let (newer, kept_local) = {
            let store = self.store.borrow();
            let mut newer = Vec::new();
            let mut kept = 0;
            for entry in entries {
                let local_origin = store.latest_version(&entry.key).map(|v| v.origin);
                match local_origin {
                    Some(origin) if origin >= entry.origin => kept += 1,
                    _ => newer.push(entry),
                }
            }
            (newer, kept)
        };

        if newer.is_empty() {
            return Ok(MergeSummary {
                adopted: 0,
                kept_local,
                stamp: None,
            });
        }
        let adopted = newer.len();
        let stamp = self.clock.borrow_mut().next();
        self.store.borrow_mut().apply_merged(stamp, newer)?;
        Ok(MergeSummary {
            adopted,
            kept_local,
            stamp: Some(stamp),
        })
    }
}

impl DataManager for StoreDataManager {
    fn get_known_state(&self) -> KnownState {
        let store = self.store.borrow();
        KnownState::new(self.node, store.latest_stamp(), store.latest_entries())
    }

    fn get_local_stamp(&self) -> VersionStamp {
        self.store.borrow().latest_stamp()
    }

    fn merge_with(&mut self, other: &KnownState) -> ManifoldResult<MergeSummary> {
        if !other.verify() {
            return Err(ManifoldError::Codec(format!(
                "known state from {} fails its digest {}",
                other.node, other.digest
            )));
        }
        self.clock.borrow_mut().observe(other.stamp);
        for entry in &other.entries {
            self.clock.borrow_mut().observe(entry.origin);
        }

        let summary = self.adopt(other.entries.clone())?;
        if summary.adopted > 0 {
            info!(
                "{} merged {} entries from {} ({} kept local)",
                self.node, summary.adopted, other.node, summary.kept_local
            );
        } else {
            debug!("{} already up to date with {}", self.node, other.node);
        }
        Ok(summary)
    }

    fn stage_commit(&mut self, stamp: VersionStamp, writes: Vec<WriteOp>) -> ManifoldResult<()> {
        if self.staged.contains_key(&stamp) {
            return Err(ManifoldError::InvalidState(format!("commit {} is already staged", stamp)));
        }
        self.clock.borrow_mut().observe(stamp);
        debug!("{} staged {} writes of commit {}", self.node, writes.len(), stamp);
        self.staged.insert(stamp, writes);
        Ok(())
    }

    fn accept_commit(&mut self, stamp: VersionStamp) -> ManifoldResult<MergeSummary> {
        let writes = self
            .staged
            .remove(&stamp)
            .ok_or(ManifoldError::UnknownCommit(stamp))?;
        let entries = writes
            .into_iter()
            .map(|op| StampedEntry {
                key: op.key().clone(),
                origin: stamp,
                value: op.value().cloned(),
            })
            .collect();
        let summary = self.adopt(entries)?;
        if summary.kept_local > 0 {
            warn!(
                "{} accepted commit {} but kept {} newer local versions",
                self.node, stamp, summary.kept_local
            );
        }
        info!("{} accepted commit {}", self.node, stamp);
        Ok(summary)
    }

    fn rollback_commit(&mut self, stamp: VersionStamp) -> bool {
        let removed = self.staged.remove(&stamp).is_some();
        if removed {
            info!("{} rolled back commit {}", self.node, stamp);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::ByteKey;
    use manifold_state::{create_clock, create_memory_store, get_at};

    fn key(s: &str) -> ByteKey {
        ByteKey::from_str_key(s).unwrap()
    }

    fn manager(tag: u64) -> StoreDataManager {
        StoreDataManager::new(NodeHandle(tag), create_memory_store("m"), create_clock(tag))
    }

    fn commit(manager: &StoreDataManager, ops: &[WriteOp]) -> VersionStamp {
        let stamp = manager.clock().borrow_mut().next();
        manager.store().borrow_mut().apply(stamp, ops).unwrap();
        stamp
    }

    fn put(k: &str, v: &str) -> WriteOp {
        WriteOp::Put {
            key: key(k),
            value: v.as_bytes().to_vec(),
        }
    }

    fn latest(manager: &StoreDataManager, k: &str) -> Option<Vec<u8>> {
        let stamp = manager.get_local_stamp();
        get_at(manager.store(), &key(k), stamp)
    }

    #[test]
    fn test_known_state_digest() {
        let a = manager(1);
        commit(&a, &[put("x", "1"), put("y", "2")]);
        let mut state = a.get_known_state();
        assert!(state.verify());
        assert_eq!(state.len(), 2);

        state.entries[0].value = Some(b"tampered".to_vec());
        assert!(!state.verify());
        let mut b = manager(2);
        assert!(matches!(b.merge_with(&state), Err(ManifoldError::Codec(_))));
    }

    #[test]
    fn test_merge_adopts_missing_and_newer() {
        let a = manager(1);
        let mut b = manager(2);
        commit(&a, &[put("only-a", "a")]);
        commit(&b, &[put("shared", "b-old")]);
        commit(&a, &[put("shared", "a-new")]);
        commit(&a, &[put("shared", "a-newer")]);

        let summary = b.merge_with(&a.get_known_state()).unwrap();
        assert_eq!(summary.adopted, 2);
        assert_eq!(latest(&b, "only-a"), Some(b"a".to_vec()));
        assert_eq!(latest(&b, "shared"), Some(b"a-newer".to_vec()));

        // merging the same state again changes nothing
        let again = b.merge_with(&a.get_known_state()).unwrap();
        assert_eq!(again.adopted, 0);
        assert_eq!(again.stamp, None);
    }

    #[test]
    fn test_newer_local_tombstone_wins() {
        let a = manager(1);
        let mut b = manager(2);
        commit(&a, &[put("k", "a")]);
        b.merge_with(&a.get_known_state()).unwrap();
        commit(&b, &[WriteOp::Delete { key: key("k") }]);

        let summary = b.merge_with(&a.get_known_state()).unwrap();
        assert_eq!(summary.kept_local, 1);
        assert_eq!(latest(&b, "k"), None);

        // and the tombstone travels back
        let mut a = a;
        a.merge_with(&b.get_known_state()).unwrap();
        assert_eq!(latest(&a, "k"), None);
    }

    #[test]
    fn test_merge_converges() {
        let mut a = manager(1);
        let mut b = manager(2);
        commit(&a, &[put("k", "a"), put("p", "a")]);
        commit(&b, &[put("k", "b"), put("q", "b")]);

        let state_a = a.get_known_state();
        let state_b = b.get_known_state();
        a.merge_with(&state_b).unwrap();
        b.merge_with(&state_a).unwrap();

        for k in ["k", "p", "q"] {
            assert_eq!(latest(&a, k), latest(&b, k), "diverged at {}", k);
        }
        // equal counters tie-break on the node tag
        assert_eq!(latest(&a, "k"), Some(b"b".to_vec()));
    }

    #[test]
    fn test_local_commit_after_merge_orders_later() {
        let a = manager(1);
        let mut b = manager(2);
        for n in 0..5 {
            commit(&a, &[put("k", &n.to_string())]);
        }
        b.merge_with(&a.get_known_state()).unwrap();
        let stamp = commit(&b, &[put("k", "b")]);
        assert!(stamp > a.get_local_stamp());
    }

    #[test]
    fn test_accept_and_rollback() {
        let mut b = manager(2);
        let remote = VersionStamp::from_parts(10, 1);
        b.stage_commit(remote, vec![put("k", "remote")]).unwrap();
        assert!(b.stage_commit(remote, Vec::new()).is_err());
        assert_eq!(latest(&b, "k"), None);

        let summary = b.accept_commit(remote).unwrap();
        assert_eq!(summary.adopted, 1);
        assert_eq!(latest(&b, "k"), Some(b"remote".to_vec()));
        assert!(matches!(b.accept_commit(remote), Err(ManifoldError::UnknownCommit(s)) if s == remote));

        let other = VersionStamp::from_parts(11, 1);
        b.stage_commit(other, vec![put("k", "discarded")]).unwrap();
        assert!(b.rollback_commit(other));
        assert!(!b.rollback_commit(other));
        assert!(!b.rollback_commit(VersionStamp::from_parts(99, 9)));
        assert_eq!(latest(&b, "k"), Some(b"remote".to_vec()));
        assert_eq!(b.staged_count(), 0);
    }
}
