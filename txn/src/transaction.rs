//! Client side of a transaction

use manifold_core::{ByteKey, KeyRange, LockPolicy, ManifoldError, ManifoldResult, Priority, Value, VersionStamp};
use manifold_reactor::{on_result, Reactor, TaskError};
use manifold_state::{ComboSnapshot, WriteOp};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::engine::TransactionEngine;
use crate::lock::TxnId;

/// Where a transaction is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    /// Closed by its owner
    Aborted,
    /// Lost to a concurrent committer
    Conflicted,
}

/// A snapshot-isolated read/write transaction
///
/// Every read and write must fall inside a range the transaction has locked.
/// Writes are buffered until `commit`. Dropping an active transaction aborts
/// it.
pub struct Transaction {
    id: TxnId,
    engine: TransactionEngine,
    base: VersionStamp,
    /// Released when the transaction finishes
    snapshot: Option<ComboSnapshot>,
    writes: BTreeMap<ByteKey, WriteOp>,
    status: TxnStatus,
    priority: Priority,
    commit_stamp: Option<VersionStamp>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, engine: TransactionEngine, snapshot: ComboSnapshot, priority: Priority) -> Self {
        Self {
            id,
            engine,
            base: snapshot.stamp(),
            snapshot: Some(snapshot),
            writes: BTreeMap::new(),
            status: TxnStatus::Active,
            priority,
            commit_stamp: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Stamp of the snapshot reads resolve against
    pub fn base_stamp(&self) -> VersionStamp {
        self.base
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == TxnStatus::Active
    }

    /// Stamp the commit was published at. Read-only commits report their base.
    pub fn commit_stamp(&self) -> Option<VersionStamp> {
        self.commit_stamp
    }

    /// True once a concurrent commit has made this transaction unable to
    /// commit.
    pub fn is_doomed(&self) -> bool {
        match self.status {
            TxnStatus::Conflicted => true,
            TxnStatus::Active => self.engine.is_doomed(self.id),
            _ => false,
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    fn ensure_active(&self) -> ManifoldResult<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            status => Err(ManifoldError::InvalidState(format!("{} is {:?}", self.id, status))),
        }
    }

    fn ensure_locked(&self, key: &ByteKey) -> ManifoldResult<()> {
        if self.engine.covers(self.id, key) {
            Ok(())
        } else {
            Err(ManifoldError::UnlockedAccess(format!("{} has not locked {}", self.id, key)))
        }
    }

    /// Lock `range` now or fail with `Conflict`, whatever the engine's policy.
    pub fn try_lock_range(&mut self, range: KeyRange) -> ManifoldResult<()> {
        self.ensure_active()?;
        if self.engine.try_lock(self.id, &range) {
            Ok(())
        } else {
            debug!("{} could not lock {}", self.id, range);
            Err(ManifoldError::Conflict)
        }
    }

    /// Lock `range`, then hand the transaction to `then`.
    ///
    /// An uncontended range is granted at once and `then` runs before this
    /// returns. A contended range fails with `Conflict` under `NoWait`; under
    /// `Wait` the calling task suspends and `then` runs on the reactor once
    /// the range is released.
    pub fn lock_range<F>(self, range: KeyRange, then: F)
    where
        F: FnOnce(Transaction, ManifoldResult<()>, &Reactor) + 'static,
    {
        let reactor = self.engine.reactor().clone();
        if let Err(err) = self.ensure_active() {
            return then(self, Err(err), &reactor);
        }
        if self.engine.try_lock(self.id, &range) {
            return then(self, Ok(()), &reactor);
        }
        if self.engine.policy() == LockPolicy::NoWait {
            debug!("{} could not lock {} without waiting", self.id, range);
            return then(self, Err(ManifoldError::Conflict), &reactor);
        }

        let id = self.id;
        let engine = self.engine.clone();
        let waiting = range.clone();
        let mut parked = Some((self, then));
        let handle = reactor.defer(on_result(move |result: Result<(), TaskError>, reactor| {
            if let Some((txn, then)) = parked.take() {
                then(txn, result, reactor);
            }
        }));
        engine.wait_for_lock(id, &waiting, handle);
        if let Err(e) = reactor.suspend_on(handle) {
            debug!("{} waits outside a task: {}", id, e);
        }
    }

    /// Value of `key` as of the base snapshot, or this transaction's own
    /// buffered write.
    pub fn read(&self, key: &ByteKey) -> ManifoldResult<Option<Value>> {
        self.ensure_active()?;
        self.ensure_locked(key)?;
        if let Some(write) = self.writes.get(key) {
            return Ok(write.value().cloned());
        }
        Ok(self.snapshot.as_ref().and_then(|s| s.get(key)))
    }

    pub fn write(&mut self, key: ByteKey, value: Value) -> ManifoldResult<()> {
        self.ensure_active()?;
        self.ensure_locked(&key)?;
        self.writes.insert(key.clone(), WriteOp::Put { key, value });
        Ok(())
    }

    pub fn delete(&mut self, key: &ByteKey) -> ManifoldResult<()> {
        self.ensure_active()?;
        self.ensure_locked(key)?;
        self.writes.insert(key.clone(), WriteOp::Delete { key: key.clone() });
        Ok(())
    }

    /// Validate and publish the buffered writes. `Ok(false)` means a
    /// concurrent commit won; locks are released either way.
    pub fn commit(&mut self) -> ManifoldResult<bool> {
        self.ensure_active()?;
        let writes: Vec<WriteOp> = std::mem::take(&mut self.writes).into_values().collect();
        let outcome = self.engine.commit(self.id, writes);
        self.snapshot = None;
        match outcome {
            Ok(Some(stamp)) => {
                self.status = TxnStatus::Committed;
                self.commit_stamp = Some(stamp);
                Ok(true)
            }
            Ok(None) => {
                self.status = TxnStatus::Conflicted;
                Ok(false)
            }
            Err(err) => {
                self.status = TxnStatus::Aborted;
                Err(err)
            }
        }
    }

    /// Discard buffered writes and release locks. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.status != TxnStatus::Active {
            return;
        }
        self.status = if self.engine.is_doomed(self.id) {
            TxnStatus::Conflicted
        } else {
            TxnStatus::Aborted
        };
        self.writes.clear();
        self.snapshot = None;
        self.engine.abort(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TxnStatus::Active {
            self.status = TxnStatus::Aborted;
            self.engine.abort_on_drop(self.id);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("status", &self.status)
            .field("writes", &self.writes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{NodeHandle, TransactionConfig};
    use manifold_state::{create_clock, create_memory_store};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn key(s: &str) -> ByteKey {
        ByteKey::from_str_key(s).unwrap()
    }

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(key(a), key(b)).unwrap()
    }

    fn engine(policy: LockPolicy) -> TransactionEngine {
        TransactionEngine::new(
            create_memory_store("t"),
            create_clock(1),
            Reactor::standalone(NodeHandle(1)).unwrap(),
            &TransactionConfig { lock_policy: policy },
        )
    }

    fn seed(engine: &TransactionEngine, k: &str, v: &str) {
        let mut txn = engine.begin();
        txn.try_lock_range(KeyRange::point(key(k))).unwrap();
        txn.write(key(k), v.as_bytes().to_vec()).unwrap();
        assert!(txn.commit().unwrap());
    }

    #[test]
    fn test_access_requires_lock() {
        let engine = engine(LockPolicy::Wait);
        let mut txn = engine.begin();
        assert!(matches!(txn.read(&key("a")), Err(ManifoldError::UnlockedAccess(_))));
        assert!(matches!(txn.write(key("a"), vec![1]), Err(ManifoldError::UnlockedAccess(_))));

        txn.try_lock_range(range("a", "c")).unwrap();
        txn.write(key("b"), vec![1]).unwrap();
        assert!(matches!(txn.delete(&key("d")), Err(ManifoldError::UnlockedAccess(_))));
        assert_eq!(txn.read(&key("b")).unwrap(), Some(vec![1]));
        assert_eq!(txn.read(&key("a")).unwrap(), None);
    }

    #[test]
    fn test_disjoint_transactions_both_commit() {
        let engine = engine(LockPolicy::Wait);
        let mut t1 = engine.begin();
        let mut t2 = engine.begin();
        t1.try_lock_range(range("a", "c")).unwrap();
        t2.try_lock_range(range("d", "f")).unwrap();
        t1.write(key("b"), b"1".to_vec()).unwrap();
        t2.write(key("e"), b"2".to_vec()).unwrap();

        assert!(t1.commit().unwrap());
        assert!(t2.commit().unwrap());
        assert!(t1.commit_stamp() < t2.commit_stamp());
    }

    #[test]
    fn test_overlapping_exactly_one_commits() {
        let engine = engine(LockPolicy::Wait);
        let reactor = engine.reactor().clone();
        let outcomes = Rc::new(RefCell::new(Vec::new()));

        let mut t1 = engine.begin();
        t1.try_lock_range(range("a", "m")).unwrap();
        t1.write(key("k"), b"t1".to_vec()).unwrap();

        let t2 = engine.begin();
        let o = outcomes.clone();
        reactor.enqueue(move |_| {
            t2.lock_range(range("k", "z"), move |mut t2, locked, _| {
                locked.unwrap();
                t2.write(key("k"), b"t2".to_vec()).unwrap();
                o.borrow_mut().push(("t2", t2.commit().unwrap()));
            });
        });
        reactor.run_until_idle();
        assert_eq!(engine.waiting_count(), 1);

        outcomes.borrow_mut().push(("t1", t1.commit().unwrap()));
        reactor.run_until_idle();

        assert_eq!(*outcomes.borrow(), vec![("t1", true), ("t2", false)]);
        let reader = {
            let mut txn = engine.begin();
            txn.try_lock_range(KeyRange::point(key("k"))).unwrap();
            txn.read(&key("k")).unwrap()
        };
        assert_eq!(reader, Some(b"t1".to_vec()));
        assert_eq!(engine.held_lock_count(), 0);
    }

    #[test]
    fn test_no_wait_fails_fast() {
        let engine = engine(LockPolicy::NoWait);
        let mut t1 = engine.begin();
        t1.try_lock_range(range("a", "c")).unwrap();

        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        engine.begin().lock_range(range("b", "b"), move |t2, locked, _| {
            *r.borrow_mut() = Some((locked.is_err(), t2.is_active()));
        });
        assert_eq!(*result.borrow(), Some((true, true)));
        assert_eq!(engine.waiting_count(), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = engine(LockPolicy::Wait);
        seed(&engine, "k", "old");

        // pinned before the write below, locks k only afterwards
        let mut reader = engine.begin();
        seed(&engine, "k", "new");

        reader.try_lock_range(range("j", "l")).unwrap();
        assert_eq!(reader.read(&key("k")).unwrap(), Some(b"old".to_vec()));

        // while the reader holds k nobody else can lock it
        let mut writer = engine.begin();
        assert!(matches!(
            writer.try_lock_range(KeyRange::point(key("k"))),
            Err(ManifoldError::Conflict)
        ));
        writer.close();
        reader.close();

        let mut late = engine.begin();
        late.try_lock_range(KeyRange::point(key("k"))).unwrap();
        assert_eq!(late.read(&key("k")).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_pinned_reader_never_sees_later_commit() {
        let engine = engine(LockPolicy::Wait);
        seed(&engine, "k", "v1");
        let pinned = engine.latest_stamp();
        seed(&engine, "k", "v2");

        let mut reader = engine.begin_at(pinned, Priority::NORMAL).unwrap();
        reader.try_lock_range(KeyRange::point(key("k"))).unwrap();
        assert_eq!(reader.read(&key("k")).unwrap(), Some(b"v1".to_vec()));
        // the newer commit makes the old reader's writes conflict
        reader.write(key("k"), b"v3".to_vec()).unwrap();
        assert!(!reader.commit().unwrap());
    }

    #[test]
    fn test_begin_at_rejects_collected_stamp() {
        let engine = engine(LockPolicy::Wait);
        seed(&engine, "k", "v1");
        let old = engine.latest_stamp();
        seed(&engine, "k", "v2");
        assert_eq!(engine.collect_garbage(), 1);

        assert!(matches!(
            engine.begin_at(old, Priority::NORMAL),
            Err(ManifoldError::InvalidState(_))
        ));
        let mut current = engine.begin_at(engine.latest_stamp(), Priority::NORMAL).unwrap();
        current.try_lock_range(KeyRange::point(key("k"))).unwrap();
        assert_eq!(current.read(&key("k")).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_waiter_pinned_before_commit_is_doomed_after_grant() {
        let engine = engine(LockPolicy::Wait);
        let reactor = engine.reactor().clone();
        seed(&engine, "k", "old");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let mut holder = engine.begin();
        holder.try_lock_range(KeyRange::point(key("k"))).unwrap();

        // snapshot taken now, before the holder commits
        let waiter = engine.begin();
        let base = waiter.base_stamp();
        let s = seen.clone();
        reactor.enqueue(move |_| {
            waiter.lock_range(KeyRange::point(key("k")), move |mut waiter, locked, _| {
                locked.unwrap();
                s.borrow_mut().push(format!("doomed={}", waiter.is_doomed()));
                s.borrow_mut().push(format!("base={}", waiter.base_stamp() == base));
                s.borrow_mut().push(format!("commit={}", waiter.commit().unwrap()));
            });
        });
        reactor.run_until_idle();
        assert_eq!(engine.waiting_count(), 1);

        holder.write(key("k"), b"new".to_vec()).unwrap();
        assert!(holder.commit().unwrap());
        reactor.run_until_idle();

        assert_eq!(*seen.borrow(), vec!["doomed=true", "base=true", "commit=false"]);
        assert_eq!(engine.stats().conflicts, 1);
        assert_eq!(engine.held_lock_count(), 0);
    }

    #[test]
    fn test_commit_and_close_are_at_most_once() {
        let engine = engine(LockPolicy::Wait);
        let mut txn = engine.begin();
        txn.try_lock_range(KeyRange::point(key("a"))).unwrap();
        assert!(txn.commit().unwrap());
        assert!(matches!(txn.commit(), Err(ManifoldError::InvalidState(_))));

        let mut closed = engine.begin();
        closed.try_lock_range(KeyRange::point(key("a"))).unwrap();
        closed.close();
        closed.close();
        assert_eq!(closed.status(), TxnStatus::Aborted);
        assert!(matches!(closed.commit(), Err(ManifoldError::InvalidState(_))));
        assert_eq!(engine.held_lock_count(), 0);

        // the lock table stayed consistent
        let mut next = engine.begin();
        next.try_lock_range(KeyRange::point(key("a"))).unwrap();
    }

    #[test]
    fn test_drop_releases_locks() {
        let engine = engine(LockPolicy::Wait);
        {
            let mut txn = engine.begin();
            txn.try_lock_range(range("a", "z")).unwrap();
            assert_eq!(engine.held_lock_count(), 1);
        }
        assert_eq!(engine.held_lock_count(), 0);
        assert_eq!(engine.active_count(), 0);
    }

    /// T1 locks [k1,k5] and writes k3; T2 waits on [k3,k3]. After T1 commits
    /// T2 resumes. With its snapshot taken before the commit it reads nothing
    /// at k3; with its snapshot taken after, it reads "a".
    #[test]
    fn test_waiter_resumes_after_commit() {
        let engine = engine(LockPolicy::Wait);
        let reactor = engine.reactor().clone();
        let seen: Rc<RefCell<Vec<(&'static str, Option<Value>)>>> = Rc::new(RefCell::new(Vec::new()));

        let mut t1 = engine.begin();
        t1.try_lock_range(range("k1", "k5")).unwrap();
        t1.write(key("k3"), b"a".to_vec()).unwrap();

        // snapshot pinned before T1 commits
        let early = engine.begin();
        let s = seen.clone();
        reactor.enqueue(move |_| {
            early.lock_range(KeyRange::point(key("k3")), move |early, locked, _| {
                locked.unwrap();
                s.borrow_mut().push(("early", early.read(&key("k3")).unwrap()));
            });
        });
        reactor.run_until_idle();
        assert!(seen.borrow().is_empty());

        assert!(t1.commit().unwrap());
        reactor.run_until_idle();

        // snapshot pinned after T1 commits
        let mut late = engine.begin();
        late.try_lock_range(KeyRange::point(key("k3"))).unwrap();
        seen.borrow_mut().push(("late", late.read(&key("k3")).unwrap()));

        assert_eq!(*seen.borrow(), vec![("early", None), ("late", Some(b"a".to_vec()))]);
    }
}
