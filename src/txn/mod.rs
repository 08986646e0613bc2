//! # Low-Level Transactions
//!
//! The transaction layer exposes the engine's only mutation surface:
//! page-oriented read and write transactions under a single-writer,
//! multi-reader MVCC model.
//!
//! ## Transaction Identifiers
//!
//! Transaction ids are 64-bit monotonically increasing integers. A read
//! transaction pins the last-committed id as its snapshot when it opens;
//! a write transaction takes `last_committed + 1` and publishes it at
//! commit. Ids are never reused.
//!
//! ## Visibility
//!
//! A reader at snapshot S observes, for every page, the newest committed
//! scratch copy with txn id ≤ S, else the data file image. It never sees
//! the writer's uncommitted dirty set, and flush never removes a scratch
//! copy a reader at S might still resolve to.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────┐     commit()     ┌───────────┐
//! │ Active  │ ───────────────> │ Committed │
//! └─────────┘                  └───────────┘
//!      │
//!      │ rollback() / drop
//!      v
//! ┌─────────┐
//! │ Aborted │
//! └─────────┘
//! ```
//!
//! Dropping an unfinished write transaction rolls it back; dropping a
//! read transaction releases its tracker slot. Commit failures roll back
//! automatically before the error reaches the caller.
//!
//! ## Module Organization
//!
//! - `tracker`: active-reader slot table and commit watermark
//! - `versions`: page → committed scratch copies translation table

mod tracker;
mod versions;

pub use tracker::TxnTracker;
pub use versions::{PageVersions, PruneOutcome};

use std::collections::{BTreeMap, BTreeSet};

use eyre::{ensure, Result, WrapErr};
use parking_lot::MutexGuard;

use crate::engine::Engine;
use crate::storage::PageNumber;

/// Monotonic transaction id. 0 is reserved for "nothing committed yet".
pub type TxnId = u64;

/// A snapshot-pinned read transaction. Cheap to open, never blocks the
/// writer, and holds its scratch view alive until dropped.
pub struct ReadTxn<'e> {
    engine: &'e Engine,
    snapshot: TxnId,
    slot: usize,
    bound_next_page: PageNumber,
}

impl<'e> ReadTxn<'e> {
    pub(crate) fn begin(engine: &'e Engine) -> Result<Self> {
        let (snapshot, slot) = engine.tracker.begin_read()?;
        Ok(Self {
            engine,
            snapshot,
            slot,
            bound_next_page: engine.committed_next_page(),
        })
    }

    /// The transaction id this reader is pinned to.
    pub fn snapshot(&self) -> TxnId {
        self.snapshot
    }

    /// Returns the page image as of this transaction's snapshot.
    pub fn get_page(&self, page: PageNumber) -> Result<Vec<u8>> {
        ensure!(page != 0, "page 0 is the file header, not readable content");
        ensure!(
            page < self.bound_next_page,
            "page {} was never allocated (next page is {})",
            page,
            self.bound_next_page
        );

        self.engine.resolve_page(page, self.snapshot)
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.engine.tracker.end_read(self.slot);
    }
}

/// The exclusive write transaction. Mutations are buffered in a dirty set
/// and become durable and visible atomically at commit.
pub struct WriteTxn<'e> {
    engine: &'e Engine,
    _writer: MutexGuard<'e, ()>,
    id: TxnId,
    next_page: PageNumber,
    dirty: BTreeMap<PageNumber, Vec<u8>>,
    freed: BTreeSet<PageNumber>,
    allocated_from_free: Vec<(PageNumber, TxnId)>,
    finished: bool,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("id", &self.id)
            .field("next_page", &self.next_page)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'e> WriteTxn<'e> {
    pub(crate) fn begin(engine: &'e Engine, writer: MutexGuard<'e, ()>) -> Self {
        Self {
            engine,
            _writer: writer,
            id: engine.tracker.last_committed() + 1,
            next_page: engine.committed_next_page(),
            dirty: BTreeMap::new(),
            freed: BTreeSet::new(),
            allocated_from_free: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Allocates `count` contiguous pages: previously-freed pages are
    /// reused when reader snapshots permit, otherwise the file is extended
    /// by exactly `count` pages. Returns the first page of the range.
    pub fn allocate(&mut self, count: u64) -> Result<PageNumber> {
        ensure!(count >= 1, "cannot allocate zero pages");

        let oldest = self.engine.tracker.oldest_active_snapshot();
        if let Some(run) = self
            .engine
            .free_space
            .lock()
            .try_allocate(count, oldest)
        {
            let first = run[0].0;
            self.allocated_from_free.extend(run);
            return Ok(first);
        }

        let first = self.next_page;
        self.next_page += count;
        Ok(first)
    }

    /// Stages a full-page image. The write is volatile until commit.
    pub fn write_page(&mut self, page: PageNumber, bytes: &[u8]) -> Result<()> {
        let page_size = self.engine.page_size();
        ensure!(
            bytes.len() == page_size,
            "page {} image must be exactly {} bytes, got {}",
            page,
            page_size,
            bytes.len()
        );
        ensure!(page != 0, "page 0 is the file header, not writable content");
        ensure!(
            page < self.next_page,
            "page {} was never allocated (next page is {})",
            page,
            self.next_page
        );
        ensure!(
            !self.freed.contains(&page),
            "page {} was freed in this transaction",
            page
        );

        self.dirty.insert(page, bytes.to_vec());
        Ok(())
    }

    /// Marks a page free as of this transaction. Freeing the same page
    /// twice is a programming error and fails fast rather than deduping.
    pub fn free_page(&mut self, page: PageNumber) -> Result<()> {
        ensure!(page != 0, "page 0 is the file header, not freeable");
        ensure!(
            page < self.next_page,
            "page {} was never allocated (next page is {})",
            page,
            self.next_page
        );
        ensure!(
            !self.engine.free_space.lock().contains(page),
            "page {} freed twice (already recorded free)",
            page
        );
        ensure!(
            self.freed.insert(page),
            "page {} freed twice in this transaction",
            page
        );

        self.dirty.remove(&page);
        Ok(())
    }

    /// Reads through this transaction's dirty set, then the committed
    /// state the writer opened against.
    pub fn get_page(&self, page: PageNumber) -> Result<Vec<u8>> {
        ensure!(page != 0, "page 0 is the file header, not readable content");
        ensure!(
            page < self.next_page,
            "page {} was never allocated (next page is {})",
            page,
            self.next_page
        );
        ensure!(
            !self.freed.contains(&page),
            "page {} was freed in this transaction",
            page
        );

        if let Some(bytes) = self.dirty.get(&page) {
            return Ok(bytes.clone());
        }

        self.engine.resolve_page(page, self.id)
    }

    /// Stages all dirty pages into scratch, makes them durable in the
    /// journal, and publishes visibility. Any failure rolls the
    /// transaction back before returning the error.
    pub fn commit(mut self) -> Result<TxnId> {
        let frees: Vec<PageNumber> = self.freed.iter().copied().collect();
        let result = self.engine.commit_write(
            self.id,
            self.next_page,
            std::mem::take(&mut self.dirty),
            &frees,
        );

        self.finished = true;
        match result {
            Ok(()) => Ok(self.id),
            Err(e) => {
                self.undo();
                Err(e).wrap_err("commit failed; transaction rolled back")
            }
        }
    }

    /// Discards all staged state. No visible effect.
    pub fn rollback(mut self) {
        self.undo();
        self.finished = true;
    }

    fn undo(&mut self) {
        if !self.allocated_from_free.is_empty() {
            self.engine
                .free_space
                .lock()
                .reinsert(&self.allocated_from_free);
            self.allocated_from_free.clear();
        }
        self.dirty.clear();
        self.freed.clear();
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}
