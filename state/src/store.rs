//! Core store traits and types

use manifold_core::{ByteKey, KeyRange, ManifoldResult, Value, VersionStamp};
use serde::{Deserialize, Serialize};

use crate::snapshot::{BlockingSnapshotMap, KeyValueSnapshot, SnapshotRange};

/// One version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Local stamp at which this version became visible
    pub stamp: VersionStamp,
    /// Stamp of the commit that produced the value, possibly on another node
    pub origin: VersionStamp,
    /// `None` marks a deletion
    pub value: Option<Value>,
}

impl Version {
    pub fn local(stamp: VersionStamp, value: Option<Value>) -> Self {
        Self {
            stamp,
            origin: stamp,
            value,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Buffered write operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: ByteKey, value: Value },
    Delete { key: ByteKey },
}

impl WriteOp {
    pub fn key(&self) -> &ByteKey {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            WriteOp::Put { value, .. } => Some(value),
            WriteOp::Delete { .. } => None,
        }
    }
}

/// Value read under a snapshot, with the range that answered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub range: SnapshotRange,
    pub value: Option<Value>,
}

/// Newest known version of a key, as exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedEntry {
    pub key: ByteKey,
    pub origin: VersionStamp,
    pub value: Option<Value>,
}

/// A store that serves version-pinned reads.
pub trait KeyValueSnapshottingStore {
    /// Identifier distinguishing this store inside a combo snapshot
    fn store_id(&self) -> u64;

    /// Newest stamp applied to this store
    fn latest_stamp(&self) -> VersionStamp;

    /// Unpinned view at the latest stamp.
    fn open_ephemeral_snapshot(&self) -> KeyValueSnapshot;

    /// Snapshots currently pinned by in-flight readers.
    fn blocking_snapshot_map(&self) -> &BlockingSnapshotMap;

    /// Resolve the version of `key` visible at `stamp`.
    fn resolve(&self, key: &ByteKey, stamp: VersionStamp) -> Option<ReadResult>;

    /// Newest commit stamp in `range` that is later than `since`, if any.
    fn last_write_after(&self, range: &KeyRange, since: VersionStamp) -> Option<VersionStamp>;

    /// Publish a commit's writes at `stamp`.
    fn apply(&mut self, stamp: VersionStamp, ops: &[WriteOp]) -> ManifoldResult<()>;
}
