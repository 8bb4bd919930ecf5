//! Snapshot functionality
//!
//! A snapshot pins a `VersionStamp`; reads under it resolve to the
//! `SnapshotRange` whose key interval holds the key and whose validity
//! interval holds the pinned stamp.

use manifold_core::{ByteKey, SequenceCounter, Value, VersionStamp};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

use crate::memory::SharedStore;
use crate::store::{KeyValueSnapshottingStore, ReadResult};

/// Key interval paired with the version interval over which one value holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRange {
    pub key_start: ByteKey,
    pub key_end: ByteKey,
    pub valid_since: VersionStamp,
    /// `None` while the value is still current
    pub valid_until: Option<VersionStamp>,
}

impl SnapshotRange {
    pub fn for_key(key: ByteKey, valid_since: VersionStamp, valid_until: Option<VersionStamp>) -> Self {
        Self {
            key_start: key.clone(),
            key_end: key,
            valid_since,
            valid_until,
        }
    }

    pub fn covers_key(&self, key: &ByteKey) -> bool {
        &self.key_start <= key && key <= &self.key_end
    }

    /// Half-open validity: `valid_since <= stamp < valid_until`.
    pub fn covers_stamp(&self, stamp: VersionStamp) -> bool {
        self.valid_since <= stamp && self.valid_until.map_or(true, |until| stamp < until)
    }

    /// True if this range's validity ends strictly before `other`'s.
    pub fn is_narrower_than(&self, other: &SnapshotRange) -> bool {
        match (self.valid_until, other.valid_until) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// True if both ranges share a key and a stamp.
    pub fn overlaps(&self, other: &SnapshotRange) -> bool {
        let keys = self.key_start <= other.key_end && other.key_start <= self.key_end;
        let self_end_after = other.valid_until.map_or(true, |until| self.valid_since < until);
        let other_end_after = self.valid_until.map_or(true, |until| other.valid_since < until);
        keys && self_end_after && other_end_after
    }
}

/// Point-in-time view of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyValueSnapshot {
    pub store_id: u64,
    pub stamp: VersionStamp,
    /// Set while the snapshot is registered in the blocking map
    pub counter: Option<SequenceCounter>,
}

impl KeyValueSnapshot {
    pub fn ephemeral(store_id: u64, stamp: VersionStamp) -> Self {
        Self {
            store_id,
            stamp,
            counter: None,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.counter.is_some()
    }
}

/// Snapshots pinned by in-flight readers, ordered by sequence counter.
///
/// Counters are issued in sequence and may wrap. Entries are kept in issue
/// order, so the oldest pin is the first entry whatever the counters read.
#[derive(Debug, Default)]
pub struct BlockingSnapshotMap {
    /// Issue position to pin
    entries: BTreeMap<u64, (SequenceCounter, KeyValueSnapshot)>,
    positions: HashMap<SequenceCounter, u64>,
    /// Pinned stamps with their pin counts
    stamps: BTreeMap<VersionStamp, usize>,
    next: SequenceCounter,
    issued: u64,
}

impl BlockingSnapshotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map whose first issued counter is `start`.
    pub fn starting_at(start: SequenceCounter) -> Self {
        Self {
            next: start,
            ..Self::default()
        }
    }

    /// Register `snapshot` and return its counter.
    pub fn insert(&mut self, mut snapshot: KeyValueSnapshot) -> SequenceCounter {
        let counter = self.next;
        self.next = self.next.inc();
        snapshot.counter = Some(counter);

        let position = self.issued;
        self.issued += 1;
        self.entries.insert(position, (counter, snapshot));
        self.positions.insert(counter, position);
        *self.stamps.entry(snapshot.stamp).or_default() += 1;
        counter
    }

    pub fn remove(&mut self, counter: &SequenceCounter) -> Option<KeyValueSnapshot> {
        let position = self.positions.remove(counter)?;
        let (_, snapshot) = self.entries.remove(&position)?;
        if let Some(count) = self.stamps.get_mut(&snapshot.stamp) {
            *count -= 1;
            if *count == 0 {
                self.stamps.remove(&snapshot.stamp);
            }
        }
        Some(snapshot)
    }

    pub fn get(&self, counter: &SequenceCounter) -> Option<&KeyValueSnapshot> {
        let position = self.positions.get(counter)?;
        self.entries.get(position).map(|(_, s)| s)
    }

    /// Pins ordered oldest first.
    pub fn ordered(&self) -> Vec<(SequenceCounter, KeyValueSnapshot)> {
        self.entries.values().copied().collect()
    }

    pub fn oldest(&self) -> Option<(SequenceCounter, KeyValueSnapshot)> {
        self.entries.first_key_value().map(|(_, pin)| *pin)
    }

    /// Smallest stamp any pinned reader can observe.
    pub fn oldest_stamp(&self) -> Option<VersionStamp> {
        self.stamps.first_key_value().map(|(stamp, _)| *stamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registration of a snapshot in its store's blocking map; released on drop.
pub struct SnapshotPin {
    store: SharedStore,
    snapshot: KeyValueSnapshot,
}

impl SnapshotPin {
    pub fn snapshot(&self) -> KeyValueSnapshot {
        self.snapshot
    }

    pub fn stamp(&self) -> VersionStamp {
        self.snapshot.stamp
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl fmt::Debug for SnapshotPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPin")
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let Some(counter) = self.snapshot.counter else {
            return;
        };
        match self.store.try_borrow_mut() {
            Ok(mut store) => {
                store.unpin(&counter);
            }
            Err(_) => warn!("Store busy while releasing snapshot pin {}", counter),
        }
    }
}

/// Pin the latest state of `store`.
pub fn pin_snapshot(store: &SharedStore) -> SnapshotPin {
    let stamp = store.borrow().latest_stamp();
    pin_snapshot_at(store, stamp)
}

/// Pin `store` at an explicit stamp.
pub fn pin_snapshot_at(store: &SharedStore, stamp: VersionStamp) -> SnapshotPin {
    let snapshot = store.borrow_mut().pin(stamp);
    SnapshotPin {
        store: store.clone(),
        snapshot,
    }
}

/// Read-only view composed from several local stores at one pinned stamp.
///
/// All stores must share a stamp clock, so no store can later publish a
/// commit at or below the pinned stamp.
pub struct ComboSnapshot {
    stamp: VersionStamp,
    stores: Vec<SharedStore>,
    pins: Vec<SnapshotPin>,
}

impl ComboSnapshot {
    /// Pin every store at the newest stamp any of them has applied.
    /// `stores` is in precedence order, highest first.
    pub fn open(stores: &[SharedStore]) -> Self {
        let stamp = stores
            .iter()
            .map(|s| s.borrow().latest_stamp())
            .max()
            .unwrap_or(VersionStamp::ZERO);
        Self::open_at(stores, stamp)
    }

    pub fn open_at(stores: &[SharedStore], stamp: VersionStamp) -> Self {
        let pins = stores.iter().map(|s| pin_snapshot_at(s, stamp)).collect();
        debug!("Opened combo snapshot {} over {} stores", stamp, stores.len());
        Self {
            stamp,
            stores: stores.to_vec(),
            pins,
        }
    }

    pub fn stamp(&self) -> VersionStamp {
        self.stamp
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn pins(&self) -> &[SnapshotPin] {
        &self.pins
    }

    /// Resolve `key` across all stores. The narrowest validity interval
    /// covering the pinned stamp wins; ties go to the earlier store.
    pub fn read(&self, key: &ByteKey) -> Option<ReadResult> {
        let mut best: Option<ReadResult> = None;
        for store in &self.stores {
            let Some(candidate) = store.borrow().resolve(key, self.stamp) else {
                continue;
            };
            let replace = match &best {
                None => true,
                Some(current) => candidate.range.is_narrower_than(&current.range),
            };
            if replace {
                best = Some(candidate);
            }
        }
        best
    }

    pub fn get_snapshot_for(&self, key: &ByteKey) -> Option<SnapshotRange> {
        self.read(key).map(|r| r.range)
    }

    /// Value of `key`, `None` if absent or deleted.
    pub fn get(&self, key: &ByteKey) -> Option<Value> {
        self.read(key).and_then(|r| r.value)
    }
}

impl fmt::Debug for ComboSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComboSnapshot")
            .field("stamp", &self.stamp)
            .field("stores", &self.stores.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::create_memory_store;
    use crate::store::WriteOp;

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
    fn test_range_coverage() {
        let range = SnapshotRange::for_key(key("a"), stamp(2), Some(stamp(5)));
        assert!(range.covers_key(&key("a")));
        assert!(!range.covers_key(&key("b")));
        assert!(!range.covers_stamp(stamp(1)));
        assert!(range.covers_stamp(stamp(2)));
        assert!(range.covers_stamp(stamp(4)));
        assert!(!range.covers_stamp(stamp(5)));

        let open = SnapshotRange::for_key(key("a"), stamp(5), None);
        assert!(open.covers_stamp(stamp(1_000)));
        assert!(range.is_narrower_than(&open));
        assert!(!open.is_narrower_than(&range));
        assert!(!range.overlaps(&open));
    }

    #[test]
    fn test_blocking_map_oldest() {
        let mut map = BlockingSnapshotMap::new();
        let a = map.insert(KeyValueSnapshot::ephemeral(1, stamp(1)));
        let b = map.insert(KeyValueSnapshot::ephemeral(1, stamp(2)));
        let _c = map.insert(KeyValueSnapshot::ephemeral(1, stamp(3)));

        assert_eq!(map.oldest().unwrap().0, a);
        map.remove(&a);
        assert_eq!(map.oldest().unwrap().0, b);
        assert_eq!(map.oldest_stamp(), Some(stamp(2)));
        assert_eq!(map.len(), 2);
        assert!(map.remove(&a).is_none());
    }

    #[test]
    fn test_blocking_map_stamp_independent_of_issue_order() {
        let mut map = BlockingSnapshotMap::new();
        let newer = map.insert(KeyValueSnapshot::ephemeral(1, stamp(9)));
        let older = map.insert(KeyValueSnapshot::ephemeral(1, stamp(4)));
        let twin = map.insert(KeyValueSnapshot::ephemeral(1, stamp(4)));

        assert_eq!(map.oldest().unwrap().0, newer);
        assert_eq!(map.oldest_stamp(), Some(stamp(4)));
        map.remove(&older);
        assert_eq!(map.oldest_stamp(), Some(stamp(4)));
        map.remove(&twin);
        assert_eq!(map.oldest_stamp(), Some(stamp(9)));
        assert_eq!(map.get(&newer).map(|s| s.stamp), Some(stamp(9)));
        map.remove(&newer);
        assert!(map.is_empty());
        assert_eq!(map.oldest_stamp(), None);
    }

    #[test]
    fn test_blocking_map_across_wraparound() {
        let mut map = BlockingSnapshotMap::starting_at(SequenceCounter::new(u64::MAX - 1));
        let first = map.insert(KeyValueSnapshot::ephemeral(1, stamp(1)));
        let second = map.insert(KeyValueSnapshot::ephemeral(1, stamp(2)));
        let third = map.insert(KeyValueSnapshot::ephemeral(1, stamp(3)));

        assert_eq!(second, SequenceCounter::MAX);
        assert_eq!(third, SequenceCounter::MIN);
        let order: Vec<_> = map.ordered().into_iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[test]
    fn test_pin_released_on_drop() {
        let store = create_memory_store("s");
        {
            let pin = pin_snapshot(&store);
            assert!(pin.snapshot().is_pinned());
            assert_eq!(store.borrow().blocking_snapshot_map().len(), 1);
        }
        assert!(store.borrow().blocking_snapshot_map().is_empty());
    }

    #[test]
    fn test_combo_snapshot_isolation() {
        let store = create_memory_store("s");
        store.borrow_mut().apply(stamp(1), &[put("k", "old")]).unwrap();

        let snapshot = ComboSnapshot::open(&[store.clone()]);
        store.borrow_mut().apply(stamp(2), &[put("k", "new")]).unwrap();

        assert_eq!(snapshot.get(&key("k")), Some(b"old".to_vec()));
        let range = snapshot.get_snapshot_for(&key("k")).unwrap();
        assert_eq!(range.valid_since, stamp(1));
        assert_eq!(range.valid_until, Some(stamp(2)));

        let fresh = ComboSnapshot::open(&[store.clone()]);
        assert_eq!(fresh.get(&key("k")), Some(b"new".to_vec()));
        assert_eq!(fresh.get(&key("missing")), None);
    }

    #[test]
    fn test_combo_prefers_narrowest_range() {
        let primary = create_memory_store("primary");
        let secondary = create_memory_store("secondary");

        primary.borrow_mut().apply(stamp(1), &[put("k", "primary")]).unwrap();
        secondary.borrow_mut().apply(stamp(2), &[put("k", "secondary-a")]).unwrap();
        secondary.borrow_mut().apply(stamp(4), &[put("k", "secondary-b")]).unwrap();

        // at stamp 3 the secondary's range ends at 4, the primary's is open
        let snapshot = ComboSnapshot::open_at(&[primary.clone(), secondary.clone()], stamp(3));
        assert_eq!(snapshot.get(&key("k")), Some(b"secondary-a".to_vec()));

        // both open-ended: precedence order decides
        let snapshot = ComboSnapshot::open_at(&[primary.clone(), secondary.clone()], stamp(4));
        assert_eq!(snapshot.get(&key("k")), Some(b"primary".to_vec()));
        let snapshot = ComboSnapshot::open_at(&[secondary, primary], stamp(4));
        assert_eq!(snapshot.get(&key("k")), Some(b"secondary-b".to_vec()));
    }

    #[test]
    fn test_combo_pins_every_store() {
        let a = create_memory_store("a");
        let b = create_memory_store("b");
        let snapshot = ComboSnapshot::open(&[a.clone(), b.clone()]);
        assert_eq!(snapshot.store_count(), 2);
        assert_eq!(a.borrow().blocking_snapshot_map().len(), 1);
        assert_eq!(b.borrow().blocking_snapshot_map().len(), 1);
        drop(snapshot);
        assert!(a.borrow().blocking_snapshot_map().is_empty());
    }
}
