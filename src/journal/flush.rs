//! Flush-to-data-file.
//!
//! Applies committed scratch copies into the memory-mapped data file and
//! reclaims what the drain made reusable: scratch regions, journal
//! segments, and the superseded older copies of rewritten pages.
//!
//! ## The Flush Bound
//!
//! A flush may apply a transaction only when every open reader could
//! already see it: the bound is min(last committed, oldest active read
//! snapshot). Anything newer stays in scratch, which is exactly what
//! keeps a reader's view stable while flushes run underneath it
//! (new read transactions are never blocked; new commits wait on the
//! flush section).
//!
//! ## Failure Semantics
//!
//! An I/O failure aborts the flush without touching scratch or the
//! version table — readers keep resolving through scratch and the
//! journal still holds every unflushed commit, so correctness is
//! unaffected; only durability of the data file lags. The failure is
//! counted, and once `max_flush_failures` consecutive attempts have
//! failed the engine flips fatal: further write transactions are refused
//! until an operator intervenes.

use std::sync::atomic::Ordering;
use std::time::Instant;

use eyre::{bail, ensure, Result, WrapErr};

use crate::engine::{Engine, FatalStorage};
use crate::txn::TxnId;

/// What one flush accomplished. A no-op flush (nothing staged at or
/// below the bound) reports zeroes and leaves every counter unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Distinct transactions applied.
    pub flushed_txns: u64,
    /// Page images written into the data file.
    pub pages_written: u64,
    /// Older scratch copies made obsolete by a newer copy applied in the
    /// same pass.
    pub superseded_pages: u64,
    /// Scratch regions drained to zero and reset for reuse.
    pub scratch_regions_reset: usize,
    /// Journal segments retired (deleted or handed to incremental
    /// backup).
    pub retired_segments: usize,
    /// The transaction id this flush drained up to.
    pub flush_bound: TxnId,
}

impl FlushOutcome {
    fn no_op(bound: TxnId) -> Self {
        Self {
            flushed_txns: 0,
            pages_written: 0,
            superseded_pages: 0,
            scratch_regions_reset: 0,
            retired_segments: 0,
            flush_bound: bound,
        }
    }
}

impl Engine {
    /// Makes staged pages durable in the data file. Safe to call at any
    /// time; with nothing staged it is a no-op.
    pub fn flush_log_to_data_file(&self) -> Result<FlushOutcome> {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");

        if self.fatal.load(Ordering::Acquire) {
            bail!(FatalStorage {
                consecutive_failures: self.flush_failures.load(Ordering::Acquire),
            });
        }

        // Excludes commits, never read-transaction creation.
        let _flush = self.flush_lock.lock();

        let last_committed = self.tracker.last_committed();
        let bound = match self.tracker.oldest_active_snapshot() {
            Some(snapshot) => snapshot.min(last_committed),
            None => last_committed,
        };

        let work = self.versions.read().flushable(bound);
        if work.is_empty() {
            self.flush_requested.store(false, Ordering::Release);
            return Ok(FlushOutcome::no_op(bound));
        }

        let meta = {
            let metas = self.txn_meta.lock();
            metas.range(..=bound).next_back().map(|(_, m)| *m)
        };

        let apply = || -> Result<(u64, u64)> {
            let mut data = self.data.write();
            let mut txns = std::collections::BTreeSet::new();

            {
                let scratch = self.scratch.lock();
                for &(txn, page, ptr) in &work {
                    let image = scratch.read(ptr)?;
                    data.page_mut(page)?.copy_from_slice(image);
                    txns.insert(txn);
                }
            }

            data.sync().wrap_err("failed to sync flushed pages")?;

            if let Some(meta) = meta {
                let mut header = data.header()?;
                header.next_page_number = meta.next_page_number;
                header.free_head_page = meta.free_head_page;
                header.free_entry_count = meta.free_entry_count;
                header.last_flushed_txn = bound;
                data.write_header(&header)?;
                data.sync()
                    .wrap_err("failed to sync file header after flush")?;
            }

            Ok((work.len() as u64, txns.len() as u64))
        };

        let (pages_written, flushed_txns) = match apply() {
            Ok(counts) => counts,
            Err(e) => {
                let failures = self.flush_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.options.max_flush_failures {
                    self.fatal.store(true, Ordering::Release);
                    return Err(e.wrap_err(FatalStorage {
                        consecutive_failures: failures,
                    }));
                }
                return Err(e.wrap_err("flush failed; staged data retained for retry"));
            }
        };

        // The data file now covers everything at or below the bound:
        // retire the drained scratch copies and journal segments.
        let prune = self.versions.write().prune(bound);
        let mut scratch_regions_reset = 0usize;
        {
            let mut scratch = self.scratch.lock();
            for ptr in &prune.released {
                if scratch.release(*ptr)? {
                    scratch_regions_reset += 1;
                }
            }
        }

        let retired = self.journal.lock().retire_applied(bound)?;
        let retired_segments = retired.len();
        {
            let mut backup = self.backup.lock();
            for seg in retired {
                if self.options.incremental_backup_enabled && seg.seq > backup.last_backup_seq {
                    backup.retained.push(seg);
                } else {
                    std::fs::remove_file(&seg.path).wrap_err_with(|| {
                        format!("failed to remove retired journal segment {:?}", seg.path)
                    })?;
                }
            }
        }

        {
            let mut metas = self.txn_meta.lock();
            let keep = metas.split_off(&(bound + 1));
            *metas = keep;
        }

        self.flush_failures.store(0, Ordering::Release);
        self.flush_requested.store(false, Ordering::Release);
        self.last_flushed_txn.store(bound, Ordering::Release);
        *self.last_flush.lock() = Instant::now();

        Ok(FlushOutcome {
            flushed_txns,
            pages_written,
            superseded_pages: prune.superseded,
            scratch_regions_reset,
            retired_segments,
            flush_bound: bound,
        })
    }
}
