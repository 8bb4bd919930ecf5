//! Boundary traits for Manifold's external collaborators
//!
//! The core consumes an already-opened datastore handle and may partition
//! itself by local resources; these traits fix the shape of both.

use crate::error::DbCreationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for Manifold operations
pub type ManifoldResult<T> = Result<T, crate::error::ManifoldError>;

/// Name of a datastore: raw bytes or a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DbName {
    Bytes(Vec<u8>),
    Text(String),
}

impl DbName {
    /// Byte form used as the registry key; text names use their UTF-8 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DbName::Bytes(b) => b,
            DbName::Text(s) => s.as_bytes(),
        }
    }

    /// Child name used by `fork`: `parent/sub`.
    pub fn child(&self, sub: &DbName) -> DbName {
        let mut bytes = self.as_bytes().to_vec();
        bytes.push(b'/');
        bytes.extend_from_slice(sub.as_bytes());
        match String::from_utf8(bytes) {
            Ok(s) => DbName::Text(s),
            Err(e) => DbName::Bytes(e.into_bytes()),
        }
    }
}

impl From<&str> for DbName {
    fn from(s: &str) -> Self {
        DbName::Text(s.to_string())
    }
}

impl From<Vec<u8>> for DbName {
    fn from(b: Vec<u8>) -> Self {
        DbName::Bytes(b)
    }
}

impl fmt::Display for DbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbName::Text(s) => write!(f, "{}", s),
            DbName::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// Closed set of datastore kinds a registry can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreKind {
    /// Multi-version key-value store
    VersionedKv,
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatastoreKind::VersionedKv => write!(f, "versioned_kv"),
        }
    }
}

/// Datastore lifecycle collaborator. Fiat lux.
pub trait DbCreationContext {
    /// Handle to an opened store
    type Store;

    /// Open `name`, creating it first if needed.
    fn create_or_open(&mut self, kind: DatastoreKind, name: &DbName) -> Result<Self::Store, DbCreationError>;

    /// Open an existing store.
    fn open(&mut self, kind: DatastoreKind, name: &DbName) -> Result<Self::Store, DbCreationError>;

    fn destroy(&mut self, name: &DbName) -> Result<(), DbCreationError>;

    /// Create `parent/sub` holding a copy of `parent`'s committed state.
    fn fork(&mut self, parent: &DbName, sub: &DbName) -> Result<Self::Store, DbCreationError>;
}

/// Closed set of local resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    CpuCore,
    MemoryRegion,
    Disk,
}

/// One local resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub class: ResourceClass,
    pub index: usize,
}

/// A set of local resources a process may consume.
pub trait LocalResourceSet {
    /// Split this set into one subset per resource of `class`. Resources of
    /// other classes are shared round-robin across the subsets.
    fn divide_by(&self, class: ResourceClass) -> Vec<Box<dyn LocalResourceSet>>;

    fn resources(&self, class: ResourceClass) -> Vec<Resource>;
}

/// Resource set described by per-class counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticResourceSet {
    resources: Vec<Resource>,
}

impl StaticResourceSet {
    pub fn new(cpu_cores: usize, memory_regions: usize, disks: usize) -> Self {
        let mut resources = Vec::new();
        for (class, count) in [
            (ResourceClass::CpuCore, cpu_cores),
            (ResourceClass::MemoryRegion, memory_regions),
            (ResourceClass::Disk, disks),
        ] {
            resources.extend((0..count).map(|index| Resource { class, index }));
        }
        Self { resources }
    }

    /// Resources of the running machine: one core per available thread.
    pub fn detect() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores, 1, 1)
    }

    pub fn from_resources(resources: Vec<Resource>) -> Self {
        Self { resources }
    }
}

impl LocalResourceSet for StaticResourceSet {
    fn divide_by(&self, class: ResourceClass) -> Vec<Box<dyn LocalResourceSet>> {
        let pivots = self.resources(class);
        if pivots.is_empty() {
            return Vec::new();
        }

        let mut parts: Vec<Vec<Resource>> = pivots.into_iter().map(|r| vec![r]).collect();
        let others = self.resources.iter().filter(|r| r.class != class);
        for (i, resource) in others.enumerate() {
            let slot = i % parts.len();
            parts[slot].push(resource.clone());
        }

        parts
            .into_iter()
            .map(|resources| Box::new(StaticResourceSet { resources }) as Box<dyn LocalResourceSet>)
            .collect()
    }

    fn resources(&self, class: ResourceClass) -> Vec<Resource> {
        self.resources
            .iter()
            .filter(|r| r.class == class)
            .cloned()
            .collect()
    }
}
