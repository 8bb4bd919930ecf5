//! Range lock table

use manifold_core::{ByteKey, KeyRange};
use manifold_reactor::TaskHandle;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Transaction identifier, unique within one engine
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

struct Waiter {
    txn: TxnId,
    range: KeyRange,
    handle: TaskHandle<()>,
}

/// Exclusive key-range locks, with a FIFO queue of transactions waiting on
/// contended ranges.
#[derive(Default)]
pub struct LockTable {
    held: HashMap<TxnId, Vec<KeyRange>>,
    waiters: VecDeque<Waiter>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction other than `txn` holding a lock overlapping `range`.
    pub fn holder_of(&self, txn: TxnId, range: &KeyRange) -> Option<TxnId> {
        self.held
            .iter()
            .filter(|(owner, _)| **owner != txn)
            .find(|(_, ranges)| ranges.iter().any(|r| r.overlaps(range)))
            .map(|(owner, _)| *owner)
    }

    fn queued_ahead(&self, txn: TxnId, range: &KeyRange) -> bool {
        self.waiters
            .iter()
            .any(|w| w.txn != txn && w.range.overlaps(range))
    }

    /// Grant `range` to `txn` if nobody else holds or awaits an overlapping
    /// range.
    pub fn try_acquire(&mut self, txn: TxnId, range: KeyRange) -> bool {
        if self.holds(txn, &range) {
            return true;
        }
        if self.holder_of(txn, &range).is_some() || self.queued_ahead(txn, &range) {
            return false;
        }
        self.held.entry(txn).or_default().push(range);
        true
    }

    /// Queue `txn` for `range`; `handle` completes once the range is granted.
    pub fn wait_for(&mut self, txn: TxnId, range: KeyRange, handle: TaskHandle<()>) {
        self.waiters.push_back(Waiter { txn, range, handle });
    }

    /// Drop every lock and queued request of `txn`, then grant queued ranges
    /// that became free, in order. Returns the handles to complete.
    pub fn release_all(&mut self, txn: TxnId) -> Vec<TaskHandle<()>> {
        self.held.remove(&txn);
        self.waiters.retain(|w| w.txn != txn);

        let mut granted = Vec::new();
        let mut still_waiting: Vec<Waiter> = Vec::new();
        while let Some(waiter) = self.waiters.pop_front() {
            let blocked = self.holder_of(waiter.txn, &waiter.range).is_some()
                || still_waiting
                    .iter()
                    .any(|w| w.txn != waiter.txn && w.range.overlaps(&waiter.range));
            if blocked {
                still_waiting.push(waiter);
            } else {
                self.held.entry(waiter.txn).or_default().push(waiter.range);
                granted.push(waiter.handle);
            }
        }
        self.waiters = still_waiting.into();
        granted
    }

    /// True if `txn` holds a range containing all of `range`.
    pub fn holds(&self, txn: TxnId, range: &KeyRange) -> bool {
        self.held.get(&txn).map_or(false, |ranges| {
            ranges
                .iter()
                .any(|r| r.contains(range.start()) && r.contains(range.end()))
        })
    }

    pub fn covers(&self, txn: TxnId, key: &ByteKey) -> bool {
        self.held
            .get(&txn)
            .map_or(false, |ranges| ranges.iter().any(|r| r.contains(key)))
    }

    pub fn held_by(&self, txn: TxnId) -> &[KeyRange] {
        self.held.get(&txn).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Ranges `txn` is still queued for.
    pub fn awaited_by(&self, txn: TxnId) -> Vec<&KeyRange> {
        self.waiters
            .iter()
            .filter(|w| w.txn == txn)
            .map(|w| &w.range)
            .collect()
    }

    pub fn is_waiting(&self, txn: TxnId) -> bool {
        self.waiters.iter().any(|w| w.txn == txn)
    }

    pub fn held_count(&self) -> usize {
        self.held.values().map(|r| r.len()).sum()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }
}
