//! Transaction engine
//!
//! One engine per reactor thread. It owns the lock table and the set of
//! active transactions, and is the only writer to its primary store.

use manifold_core::{
    ByteKey, KeyRange, LockPolicy, ManifoldError, ManifoldResult, Priority, TransactionConfig, VersionStamp,
};
use manifold_reactor::{Reactor, TaskHandle};
use manifold_state::{ComboSnapshot, KeyValueSnapshottingStore, SharedClock, SharedStore, WriteOp};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::lock::{LockTable, TxnId};
use crate::transaction::Transaction;

struct ActiveTxn {
    base: VersionStamp,
    priority: Priority,
    /// Set when a concurrent commit wrote a range this transaction locked or
    /// awaits
    doomed: bool,
}

/// Counters reported by `TransactionEngine::stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub begun: u64,
    pub committed: u64,
    pub conflicts: u64,
    pub aborted: u64,
}

struct EngineState {
    /// Primary (write) store first, then read-only stores by precedence
    stores: Vec<SharedStore>,
    clock: SharedClock,
    policy: LockPolicy,
    locks: LockTable,
    active: HashMap<TxnId, ActiveTxn>,
    next_txn: u64,
    stats: EngineStats,
}

/// Handle to the transaction engine of one reactor thread.
#[derive(Clone)]
pub struct TransactionEngine {
    state: Rc<RefCell<EngineState>>,
    reactor: Reactor,
}

impl TransactionEngine {
    pub fn new(store: SharedStore, clock: SharedClock, reactor: Reactor, config: &TransactionConfig) -> Self {
        Self::build(vec![store], clock, reactor, config.lock_policy)
    }

    /// Engine reading across `stores` in precedence order. Commits go to the
    /// first one.
    pub fn with_stores(
        stores: Vec<SharedStore>,
        clock: SharedClock,
        reactor: Reactor,
        policy: LockPolicy,
    ) -> ManifoldResult<Self> {
        if stores.is_empty() {
            return Err(ManifoldError::InvalidState("transaction engine needs a store".into()));
        }
        Ok(Self::build(stores, clock, reactor, policy))
    }

    fn build(stores: Vec<SharedStore>, clock: SharedClock, reactor: Reactor, policy: LockPolicy) -> Self {
        Self {
            state: Rc::new(RefCell::new(EngineState {
                stores,
                clock,
                policy,
                locks: LockTable::new(),
                active: HashMap::new(),
                next_txn: 1,
                stats: EngineStats::default(),
            })),
            reactor,
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn policy(&self) -> LockPolicy {
        self.state.borrow().policy
    }

    pub fn set_policy(&self, policy: LockPolicy) {
        self.state.borrow_mut().policy = policy;
    }

    pub fn primary_store(&self) -> SharedStore {
        self.state.borrow().stores[0].clone()
    }

    pub fn clock(&self) -> SharedClock {
        self.state.borrow().clock.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.borrow().stats
    }

    pub fn active_count(&self) -> usize {
        self.state.borrow().active.len()
    }

    pub fn held_lock_count(&self) -> usize {
        self.state.borrow().locks.held_count()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.borrow().locks.waiting_count()
    }

    /// Newest stamp visible to a transaction begun now.
    pub fn latest_stamp(&self) -> VersionStamp {
        self.state
            .borrow()
            .stores
            .iter()
            .map(|s| s.borrow().latest_stamp())
            .max()
            .unwrap_or(VersionStamp::ZERO)
    }

    /// Begin a transaction on the latest committed state.
    pub fn begin(&self) -> Transaction {
        self.begin_with_priority(Priority::NORMAL)
    }

    pub fn begin_with_priority(&self, priority: Priority) -> Transaction {
        let stamp = self.latest_stamp();
        self.open(stamp, priority)
    }

    /// Begin a transaction whose snapshot is pinned at `stamp`. Stamps older
    /// than a store's garbage-collection horizon are rejected.
    pub fn begin_at(&self, stamp: VersionStamp, priority: Priority) -> ManifoldResult<Transaction> {
        let horizon = self.gc_horizon();
        if stamp < horizon {
            return Err(ManifoldError::InvalidState(format!(
                "snapshot at {} predates the collected horizon {}",
                stamp, horizon
            )));
        }
        Ok(self.open(stamp, priority))
    }

    /// Oldest stamp every store can still serve.
    pub fn gc_horizon(&self) -> VersionStamp {
        self.state
            .borrow()
            .stores
            .iter()
            .map(|s| s.borrow().gc_horizon())
            .max()
            .unwrap_or(VersionStamp::ZERO)
    }

    fn open(&self, stamp: VersionStamp, priority: Priority) -> Transaction {
        let (id, snapshot) = {
            let mut state = self.state.borrow_mut();
            let id = TxnId(state.next_txn);
            state.next_txn += 1;
            state.stats.begun += 1;
            state.active.insert(
                id,
                ActiveTxn {
                    base: stamp,
                    priority,
                    doomed: false,
                },
            );
            (id, ComboSnapshot::open_at(&state.stores, stamp))
        };
        debug!("Began {} at {} with priority {}", id, stamp, priority);
        Transaction::new(id, self.clone(), snapshot, priority)
    }

    /// Drop versions no active snapshot can read. Returns the number removed.
    pub fn collect_garbage(&self) -> usize {
        let stores = self.state.borrow().stores.clone();
        stores.iter().map(|s| s.borrow_mut().collect_garbage()).sum()
    }

    // ---- Called by transactions ----

    pub(crate) fn is_doomed(&self, txn: TxnId) -> bool {
        self.state
            .borrow()
            .active
            .get(&txn)
            .map_or(false, |t| t.doomed)
    }

    pub(crate) fn covers(&self, txn: TxnId, key: &ByteKey) -> bool {
        self.state.borrow().locks.covers(txn, key)
    }

    pub(crate) fn try_lock(&self, txn: TxnId, range: &KeyRange) -> bool {
        let acquired = self.state.borrow_mut().locks.try_acquire(txn, range.clone());
        if acquired {
            debug!("{} locked {}", txn, range);
        }
        acquired
    }

    pub(crate) fn wait_for_lock(&self, txn: TxnId, range: &KeyRange, handle: TaskHandle<()>) {
        let mut state = self.state.borrow_mut();
        let holder = state.locks.holder_of(txn, range);
        state.locks.wait_for(txn, range.clone(), handle);
        match holder {
            Some(holder) => debug!("{} waits for {} held by {}", txn, range, holder),
            None => debug!("{} queued for {}", txn, range),
        }
    }

    /// Validate and publish. `Ok(None)` means a conflict was detected and the
    /// transaction is finished; nothing was written.
    pub(crate) fn commit(&self, txn: TxnId, writes: Vec<WriteOp>) -> ManifoldResult<Option<VersionStamp>> {
        let outcome = self.try_commit(txn, writes);
        self.release(txn);
        outcome
    }

    fn try_commit(&self, txn: TxnId, writes: Vec<WriteOp>) -> ManifoldResult<Option<VersionStamp>> {
        let mut state = self.state.borrow_mut();
        let Some(active) = state.active.remove(&txn) else {
            return Err(ManifoldError::InvalidState(format!("{} is not active", txn)));
        };

        if active.doomed {
            state.stats.conflicts += 1;
            info!("{} lost to a concurrent commit", txn);
            return Ok(None);
        }
        let locked = state.locks.held_by(txn).to_vec();
        for range in &locked {
            let newer = state
                .stores
                .iter()
                .filter_map(|s| s.borrow().last_write_after(range, active.base))
                .max();
            if let Some(stamp) = newer {
                state.stats.conflicts += 1;
                info!("{} conflicts with commit {} in {}", txn, stamp, range);
                return Ok(None);
            }
        }

        if writes.is_empty() {
            state.stats.committed += 1;
            debug!("{} committed without writes", txn);
            return Ok(Some(active.base));
        }

        let stamp = state.clock.borrow_mut().next();
        state.stores[0].borrow_mut().apply(stamp, &writes)?;
        state.stats.committed += 1;

        // anyone who locked or awaits a key written here can no longer commit
        let EngineState { active: others, locks, .. } = &mut *state;
        for (other, entry) in others.iter_mut() {
            if entry.doomed || entry.base >= stamp {
                continue;
            }
            let touched = writes.iter().any(|w| {
                locks.covers(*other, w.key()) || locks.awaited_by(*other).iter().any(|r| r.contains(w.key()))
            });
            if touched {
                entry.doomed = true;
                warn!("{} (priority {}) aborted by commit of {} at {}", other, entry.priority, txn, stamp);
            }
        }

        info!("{} committed {} writes at {} (priority {})", txn, writes.len(), stamp, active.priority);
        Ok(Some(stamp))
    }

    /// Abort `txn` and release its locks. Unknown ids are ignored.
    pub(crate) fn abort(&self, txn: TxnId) {
        let removed = {
            let mut state = self.state.borrow_mut();
            let removed = state.active.remove(&txn).is_some();
            if removed {
                state.stats.aborted += 1;
            }
            removed
        };
        if removed {
            debug!("{} aborted", txn);
        }
        self.release(txn);
    }

    /// Release every lock of `txn` and wake the waiters it was blocking.
    fn release(&self, txn: TxnId) {
        let granted = self.state.borrow_mut().locks.release_all(txn);
        for handle in granted {
            if let Err(e) = self.reactor.complete(handle, ()) {
                warn!("Failed to wake lock waiter {:?}: {}", handle, e);
            }
        }
    }

    /// Like `abort`, for use from `Drop` where the engine may be borrowed.
    /// A busy engine gets the abort queued on the reactor.
    pub(crate) fn abort_on_drop(&self, txn: TxnId) {
        if self.state.try_borrow_mut().is_err() {
            debug!("Engine busy while dropping {}; deferring the abort", txn);
            let engine = self.clone();
            self.reactor.enqueue(move |_| engine.abort(txn));
            return;
        }
        self.abort(txn);
    }
}
