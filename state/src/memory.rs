//! In-memory multi-version store

use manifold_core::{ByteKey, KeyRange, ManifoldError, ManifoldResult, SequenceCounter, Value, VersionStamp};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::snapshot::{BlockingSnapshotMap, KeyValueSnapshot, SnapshotRange};
use crate::store::{KeyValueSnapshottingStore, ReadResult, StampedEntry, Version, WriteOp};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory store keeping every version of every key
#[derive(Debug)]
pub struct MemoryStore {
    id: u64,
    name: String,
    /// Versions per key, ascending by local stamp
    data: BTreeMap<ByteKey, Vec<Version>>,
    latest: VersionStamp,
    /// Highest horizon a collection removed versions below
    collected: VersionStamp,
    blocking: BlockingSnapshotMap,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            data: BTreeMap::new(),
            latest: VersionStamp::ZERO,
            collected: VersionStamp::ZERO,
            blocking: BlockingSnapshotMap::new(),
        }
    }

    /// Store seeded with the newest state of `entries`, each at its origin stamp.
    pub fn with_entries(name: &str, entries: Vec<StampedEntry>) -> Self {
        let mut store = Self::new(name);
        for entry in entries {
            store.latest = store.latest.max(entry.origin);
            store
                .data
                .insert(entry.key, vec![Version::local(entry.origin, entry.value)]);
        }
        store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of keys with at least one version, tombstones included.
    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// Oldest stamp still readable: reads below it may miss versions that
    /// garbage collection removed.
    pub fn gc_horizon(&self) -> VersionStamp {
        self.collected
    }

    pub fn version_count(&self) -> usize {
        self.data.values().map(|v| v.len()).sum()
    }

    /// Register a pinned snapshot at `stamp`.
    pub fn pin(&mut self, stamp: VersionStamp) -> KeyValueSnapshot {
        let mut snapshot = KeyValueSnapshot::ephemeral(self.id, stamp);
        let counter = self.blocking.insert(snapshot);
        snapshot.counter = Some(counter);
        snapshot
    }

    pub fn unpin(&mut self, counter: &SequenceCounter) -> bool {
        self.blocking.remove(counter).is_some()
    }

    /// Newest version of `key`, whatever its stamp.
    pub fn latest_version(&self, key: &ByteKey) -> Option<&Version> {
        self.data.get(key).and_then(|versions| versions.last())
    }

    /// Newest version of every key.
    pub fn latest_entries(&self) -> Vec<StampedEntry> {
        self.data
            .iter()
            .filter_map(|(key, versions)| {
                versions.last().map(|v| StampedEntry {
                    key: key.clone(),
                    origin: v.origin,
                    value: v.value.clone(),
                })
            })
            .collect()
    }

    /// Publish entries adopted from another node at local stamp `stamp`.
    /// Each keeps its origin stamp for later last-writer-wins comparisons.
    pub fn apply_merged(&mut self, stamp: VersionStamp, entries: Vec<StampedEntry>) -> ManifoldResult<()> {
        self.check_advances(stamp)?;
        let count = entries.len();
        for entry in entries {
            self.data.entry(entry.key).or_default().push(Version {
                stamp,
                origin: entry.origin,
                value: entry.value,
            });
        }
        self.latest = stamp;
        debug!("Store {} adopted {} merged entries at {}", self.name, count, stamp);
        Ok(())
    }

    fn check_advances(&self, stamp: VersionStamp) -> ManifoldResult<()> {
        if stamp <= self.latest {
            return Err(ManifoldError::InvalidState(format!(
                "commit stamp {} does not advance store {} past {}",
                stamp, self.name, self.latest
            )));
        }
        Ok(())
    }

    /// Drop versions no pinned reader, and no future reader, can observe.
    /// Returns the number of versions removed.
    ///
    /// The newest version of a key is always kept, tombstones included: merges
    /// compare against it.
    pub fn collect_garbage(&mut self) -> usize {
        let horizon = self.blocking.oldest_stamp().unwrap_or(self.latest);
        let mut removed = 0;
        for versions in self.data.values_mut() {
            let visible = versions.partition_point(|v| v.stamp <= horizon);
            if visible > 1 {
                versions.drain(..visible - 1);
                removed += visible - 1;
            }
        }
        if removed > 0 {
            self.collected = self.collected.max(horizon);
            debug!("Store {} collected {} versions below {}", self.name, removed, horizon);
        }
        removed
    }
}

impl KeyValueSnapshottingStore for MemoryStore {
    fn store_id(&self) -> u64 {
        self.id
    }

    fn latest_stamp(&self) -> VersionStamp {
        self.latest
    }

    fn open_ephemeral_snapshot(&self) -> KeyValueSnapshot {
        KeyValueSnapshot::ephemeral(self.id, self.latest)
    }

    fn blocking_snapshot_map(&self) -> &BlockingSnapshotMap {
        &self.blocking
    }

    fn resolve(&self, key: &ByteKey, stamp: VersionStamp) -> Option<ReadResult> {
        let versions = self.data.get(key)?;
        let idx = versions.partition_point(|v| v.stamp <= stamp);
        if idx == 0 {
            return None;
        }
        let version = &versions[idx - 1];
        let valid_until = versions.get(idx).map(|next| next.stamp);
        Some(ReadResult {
            range: SnapshotRange::for_key(key.clone(), version.stamp, valid_until),
            value: version.value.clone(),
        })
    }

    fn last_write_after(&self, range: &KeyRange, since: VersionStamp) -> Option<VersionStamp> {
        self.data
            .range(range.start().clone()..=range.end().clone())
            .filter_map(|(_, versions)| versions.last().map(|v| v.stamp))
            .filter(|stamp| *stamp > since)
            .max()
    }

    fn apply(&mut self, stamp: VersionStamp, ops: &[WriteOp]) -> ManifoldResult<()> {
        self.check_advances(stamp)?;
        for op in ops {
            let version = Version::local(stamp, op.value().cloned());
            let versions = self.data.entry(op.key().clone()).or_default();
            // a commit writing the same key twice keeps only its last write
            if versions.last().map_or(false, |v| v.stamp == stamp) {
                versions.pop();
            }
            versions.push(version);
        }
        self.latest = stamp;
        debug!("Store {} applied {} writes at {}", self.name, ops.len(), stamp);
        Ok(())
    }
}

/// Store shared between the components of one reactor thread
pub type SharedStore = Rc<RefCell<MemoryStore>>;

/// Create a shared memory store
pub fn create_memory_store(name: &str) -> SharedStore {
    Rc::new(RefCell::new(MemoryStore::new(name)))
}

/// Read the value of `key` visible at `stamp`.
pub fn get_at(store: &SharedStore, key: &ByteKey, stamp: VersionStamp) -> Option<Value> {
    store.borrow().resolve(key, stamp).and_then(|r| r.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::pin_snapshot_at;

    fn key(s: &str) -> ByteKey {
        ByteKey::from_str_key(s).unwrap()
    }

    fn stamp(n: u64) -> VersionStamp {
        VersionStamp::from_parts(n, 0)
    }

    fn put(k: &str, v: &str) -> WriteOp {
        WriteOp::Put {
            key: key(k),
            value: v.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_resolve_versions() {
        let mut store = MemoryStore::new("s");
        store.apply(stamp(1), &[put("a", "1")]).unwrap();
        store.apply(stamp(3), &[put("a", "3")]).unwrap();
        store.apply(stamp(5), &[WriteOp::Delete { key: key("a") }]).unwrap();

        assert!(store.resolve(&key("a"), stamp(0)).is_none());
        assert_eq!(store.resolve(&key("a"), stamp(2)).unwrap().value, Some(b"1".to_vec()));
        assert_eq!(store.resolve(&key("a"), stamp(3)).unwrap().value, Some(b"3".to_vec()));

        let deleted = store.resolve(&key("a"), stamp(9)).unwrap();
        assert_eq!(deleted.value, None);
        assert_eq!(deleted.range.valid_since, stamp(5));
        assert_eq!(deleted.range.valid_until, None);
        assert!(store.resolve(&key("b"), stamp(9)).is_none());
    }

    #[test]
    fn test_ranges_for_key_never_overlap() {
        let mut store = MemoryStore::new("s");
        for n in 1..6 {
            store.apply(stamp(n * 2), &[put("k", &n.to_string())]).unwrap();
        }
        let ranges: Vec<_> = (0..14)
            .filter_map(|n| store.resolve(&key("k"), stamp(n)))
            .map(|r| r.range)
            .collect();
        for a in &ranges {
            for b in &ranges {
                if a != b {
                    assert!(!a.overlaps(b));
                }
            }
        }
    }

    #[test]
    fn test_apply_requires_advancing_stamp() {
        let mut store = MemoryStore::new("s");
        store.apply(stamp(2), &[put("a", "x")]).unwrap();
        assert!(store.apply(stamp(2), &[put("a", "y")]).is_err());
        assert!(store.apply(stamp(1), &[put("a", "y")]).is_err());
        assert_eq!(store.latest_stamp(), stamp(2));
    }

    #[test]
    fn test_last_write_after() {
        let mut store = MemoryStore::new("s");
        store.apply(stamp(1), &[put("a", "x"), put("c", "x")]).unwrap();
        store.apply(stamp(4), &[put("b", "y")]).unwrap();

        let range = KeyRange::new(key("a"), key("c")).unwrap();
        assert_eq!(store.last_write_after(&range, stamp(1)), Some(stamp(4)));
        assert_eq!(store.last_write_after(&range, stamp(4)), None);
        assert_eq!(store.last_write_after(&KeyRange::point(key("a")), stamp(1)), None);
    }

    #[test]
    fn test_garbage_respects_pins() {
        let store = create_memory_store("s");
        for n in 1..=4 {
            store.borrow_mut().apply(stamp(n), &[put("k", &n.to_string())]).unwrap();
        }

        let pin = pin_snapshot_at(&store, stamp(2));
        assert_eq!(store.borrow_mut().collect_garbage(), 1);
        assert_eq!(get_at(&store, &key("k"), stamp(2)), Some(b"2".to_vec()));

        assert_eq!(store.borrow().gc_horizon(), stamp(2));

        drop(pin);
        assert_eq!(store.borrow_mut().collect_garbage(), 2);
        assert_eq!(store.borrow().version_count(), 1);
        assert_eq!(store.borrow().gc_horizon(), stamp(4));
        assert_eq!(get_at(&store, &key("k"), stamp(4)), Some(b"4".to_vec()));
    }

    #[test]
    fn test_merged_entries_keep_origin() {
        let mut store = MemoryStore::new("s");
        let remote = VersionStamp::from_parts(7, 2);
        store
            .apply_merged(
                stamp(9),
                vec![StampedEntry {
                    key: key("m"),
                    origin: remote,
                    value: Some(b"v".to_vec()),
                }],
            )
            .unwrap();

        let version = store.latest_version(&key("m")).unwrap();
        assert_eq!(version.stamp, stamp(9));
        assert_eq!(version.origin, remote);
        assert_eq!(store.latest_entries()[0].origin, remote);
    }
}
