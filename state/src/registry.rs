//! In-memory datastore registry

use manifold_core::{DatastoreKind, DbCreationContext, DbCreationError, DbName};
use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;
use tracing::info;

use crate::memory::{MemoryStore, SharedStore};

/// Registry of named stores living on one reactor thread.
#[derive(Default)]
pub struct MemoryDbRegistry {
    stores: HashMap<DbName, (DatastoreKind, SharedStore)>,
}

impl MemoryDbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &DbName) -> bool {
        self.stores.contains_key(name)
    }

    pub fn names(&self) -> Vec<DbName> {
        let mut names: Vec<_> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    fn checked(&self, kind: DatastoreKind, name: &DbName) -> Result<Option<SharedStore>, DbCreationError> {
        match self.stores.get(name) {
            Some((found, store)) if *found == kind => Ok(Some(store.clone())),
            Some((found, _)) => Err(DbCreationError::KindMismatch {
                name: name.to_string(),
                expected: kind.to_string(),
                found: found.to_string(),
            }),
            None => Ok(None),
        }
    }
}

impl DbCreationContext for MemoryDbRegistry {
    type Store = SharedStore;

    fn create_or_open(&mut self, kind: DatastoreKind, name: &DbName) -> Result<SharedStore, DbCreationError> {
        if let Some(store) = self.checked(kind, name)? {
            return Ok(store);
        }
        let store = Rc::new(RefCell::new(MemoryStore::new(&name.to_string())));
        self.stores.insert(name.clone(), (kind, store.clone()));
        info!("Created datastore {} ({})", name, kind);
        Ok(store)
    }

    fn open(&mut self, kind: DatastoreKind, name: &DbName) -> Result<SharedStore, DbCreationError> {
        self.checked(kind, name)?
            .ok_or_else(|| DbCreationError::NotFound(name.to_string()))
    }

    fn destroy(&mut self, name: &DbName) -> Result<(), DbCreationError> {
        self.stores
            .remove(name)
            .map(|_| info!("Destroyed datastore {}", name))
            .ok_or_else(|| DbCreationError::NotFound(name.to_string()))
    }

    fn fork(&mut self, parent: &DbName, sub: &DbName) -> Result<SharedStore, DbCreationError> {
        let (kind, source) = self
            .stores
            .get(parent)
            .cloned()
            .ok_or_else(|| DbCreationError::NotFound(parent.to_string()))?;
        let child = parent.child(sub);
        if self.stores.contains_key(&child) {
            return Err(DbCreationError::AlreadyExists(child.to_string()));
        }

        let entries = source.borrow().latest_entries();
        let store = Rc::new(RefCell::new(MemoryStore::with_entries(&child.to_string(), entries)));
        self.stores.insert(child.clone(), (kind, store.clone()));
        info!("Forked datastore {} into {}", parent, child);
        Ok(store)
    }
}
