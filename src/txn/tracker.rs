//! Active-transaction tracking.
//!
//! A fixed slot array records the snapshot id of every open read
//! transaction, so the engine can compute the oldest active snapshot — the
//! watermark that gates free-page reuse and bounds what a flush may apply.
//!
//! ## Slot Array Design
//!
//! Each slot holds `snapshot + 1` for an open reader (0 = empty), allowing
//! snapshot id 0 for readers opened against an empty store. Slot
//! allocation takes a short mutex; reads of the array are lock-free.
//! The capacity is a hard limit: a slot costs 8 bytes, so raising
//! `MAX_CONCURRENT_READERS` is cheap if embedders need more.

use eyre::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::TxnId;
use crate::config::MAX_CONCURRENT_READERS;

pub struct TxnTracker {
    last_committed: AtomicU64,
    reader_slots: [AtomicU64; MAX_CONCURRENT_READERS],
    slot_lock: Mutex<()>,
}

impl TxnTracker {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new(last_committed: TxnId) -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            last_committed: AtomicU64::new(last_committed),
            #[allow(clippy::borrow_interior_mutable_const)]
            reader_slots: [INIT; MAX_CONCURRENT_READERS],
            slot_lock: Mutex::new(()),
        }
    }

    pub fn last_committed(&self) -> TxnId {
        self.last_committed.load(Ordering::Acquire)
    }

    pub fn publish_commit(&self, txn_id: TxnId) {
        self.last_committed.store(txn_id, Ordering::Release);
    }

    /// Registers a read transaction pinned at the current last-committed id
    /// and returns `(snapshot, slot)`.
    pub fn begin_read(&self) -> Result<(TxnId, usize)> {
        let _guard = self.slot_lock.lock();
        let snapshot = self.last_committed();

        for (idx, slot) in self.reader_slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(snapshot + 1, Ordering::SeqCst);
                return Ok((snapshot, idx));
            }
        }

        bail!(
            "too many concurrent read transactions (max {})",
            MAX_CONCURRENT_READERS
        )
    }

    pub fn end_read(&self, slot: usize) {
        self.reader_slots[slot].store(0, Ordering::SeqCst);
    }

    /// The smallest snapshot id among open read transactions, or `None`
    /// when no reader is open.
    pub fn oldest_active_snapshot(&self) -> Option<TxnId> {
        let mut oldest: Option<TxnId> = None;
        for slot in &self.reader_slots {
            let raw = slot.load(Ordering::SeqCst);
            if raw != 0 {
                let snapshot = raw - 1;
                oldest = Some(oldest.map_or(snapshot, |o| o.min(snapshot)));
            }
        }
        oldest
    }

    pub fn active_readers(&self) -> usize {
        self.reader_slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_pin_the_commit_point_at_open() {
        let tracker = TxnTracker::new(5);

        let (snapshot, slot) = tracker.begin_read().unwrap();
        assert_eq!(snapshot, 5);

        tracker.publish_commit(6);
        let (snapshot2, slot2) = tracker.begin_read().unwrap();
        assert_eq!(snapshot2, 6);

        tracker.end_read(slot);
        tracker.end_read(slot2);
    }

    #[test]
    fn oldest_active_snapshot_tracks_minimum() {
        let tracker = TxnTracker::new(0);
        assert_eq!(tracker.oldest_active_snapshot(), None);

        let (_, s1) = tracker.begin_read().unwrap();
        tracker.publish_commit(3);
        let (_, s2) = tracker.begin_read().unwrap();

        assert_eq!(tracker.oldest_active_snapshot(), Some(0));
        assert_eq!(tracker.active_readers(), 2);

        tracker.end_read(s1);
        assert_eq!(tracker.oldest_active_snapshot(), Some(3));

        tracker.end_read(s2);
        assert_eq!(tracker.oldest_active_snapshot(), None);
    }

    #[test]
    fn snapshot_zero_occupies_a_slot() {
        let tracker = TxnTracker::new(0);

        let (snapshot, _) = tracker.begin_read().unwrap();
        assert_eq!(snapshot, 0);
        assert_eq!(tracker.active_readers(), 1);
        assert_eq!(tracker.oldest_active_snapshot(), Some(0));
    }

    #[test]
    fn slot_exhaustion_fails() {
        let tracker = TxnTracker::new(1);

        let mut slots = Vec::new();
        for _ in 0..MAX_CONCURRENT_READERS {
            slots.push(tracker.begin_read().unwrap().1);
        }

        assert!(tracker.begin_read().is_err());

        tracker.end_read(slots[0]);
        assert!(tracker.begin_read().is_ok());
    }
}
