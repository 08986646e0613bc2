//! # Engine
//!
//! The storage environment: one directory holding a memory-mapped data
//! file and a journal, exposed to the layers above as page-oriented
//! transactions.
//!
//! ## Composition
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                   Engine                      │
//! ├───────────────┬───────────────┬───────────────┤
//! │  ReadTxn /    │ FreeSpace     │ Backup /      │
//! │  WriteTxn     │ Handling      │ Restore       │
//! ├───────────────┴──────┬────────┴───────────────┤
//! │  Scratch Buffer Pool │ Journal + Flush        │
//! ├──────────────────────┴────────────────────────┤
//! │        DataFile (mmap)  ·  LowMemoryMonitor   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! Commit plans the free-space rewrite, grows the file (so disk
//! exhaustion surfaces as a commit failure), appends one record to the
//! journal (the durability point), stages every dirty page into scratch,
//! and publishes visibility. A later flush applies staged pages to the
//! mapped file and retires what it drained.
//!
//! ## Lock Order
//!
//! flush section → data file → version table → scratch → free space →
//! journal. The flush section serializes commits against flushes, so the
//! two never interleave their component locks; readers take only the
//! version table (shared), scratch, and the data file (shared), in that
//! order.
//!
//! ## Lifecycle
//!
//! `create`/`open` return an `Arc<Engine>`; open replays the journal
//! before anything else runs. `close` stops the background flusher,
//! joins any backup worker, flushes, syncs — and aggregates every error
//! it meets into one report instead of stopping at the first.

mod errors;
mod options;

pub use errors::{AllocationExhausted, FatalStorage, WriterContention};
pub use options::Options;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};

use crate::backup::CopyBufferPool;
use crate::config::{BACKUP_CHUNK_SIZE, DATA_FILE_NAME, JOURNAL_DIR_NAME};
use crate::freespace::FreeSpaceHandling;
use crate::journal::{self, Journal, RecoveryInfo, SealedSegment};
use crate::memory::{LowMemoryMonitor, MemoryInfo};
use crate::scratch::ScratchBufferPool;
use crate::storage::{DataFile, PageNumber};
use crate::txn::{PageVersions, ReadTxn, TxnId, TxnTracker, WriteTxn};

/// Engine counters reported for diagnostics and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub next_page_number: PageNumber,
    pub free_page_count: u64,
    pub staged_pages: u64,
    pub scratch_regions: usize,
    pub scratch_occupancy_bytes: usize,
    pub last_committed_txn: TxnId,
    pub last_flushed_txn: TxnId,
    pub journal_segments: usize,
    pub active_readers: usize,
}

/// Per-commit state a flush needs to write a bound-consistent header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxnMeta {
    pub next_page_number: PageNumber,
    pub free_head_page: PageNumber,
    pub free_entry_count: u64,
}

pub(crate) struct BackupState {
    /// Whether a full backup has anchored the incremental chain in this
    /// engine instance.
    pub anchored: bool,
    /// Highest journal segment sequence captured by a backup.
    pub last_backup_seq: u64,
    /// Flushed segments kept alive for the next incremental backup.
    pub retained: Vec<SealedSegment>,
    pub worker: Option<JoinHandle<()>>,
}

struct FlusherHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct Engine {
    pub(crate) options: Options,
    pub(crate) dir: PathBuf,
    page_size: usize,
    pub(crate) data: RwLock<DataFile>,
    pub(crate) scratch: Mutex<ScratchBufferPool>,
    pub(crate) free_space: Mutex<FreeSpaceHandling>,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) versions: RwLock<PageVersions>,
    pub(crate) tracker: TxnTracker,
    writer: Mutex<()>,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) monitor: Arc<LowMemoryMonitor>,
    committed_next_page: AtomicU64,
    pub(crate) txn_meta: Mutex<BTreeMap<TxnId, TxnMeta>>,
    pub(crate) flush_requested: Arc<AtomicBool>,
    pub(crate) flush_failures: AtomicU32,
    pub(crate) fatal: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) last_flush: Mutex<Instant>,
    pub(crate) last_flushed_txn: AtomicU64,
    pub(crate) backup: Mutex<BackupState>,
    pub(crate) copy_buffers: CopyBufferPool,
    flusher: Mutex<Option<FlusherHandle>>,
    recovery: RecoveryInfo,
}

impl Engine {
    /// Creates a fresh store in `dir`.
    pub fn create<P: AsRef<Path>>(dir: P, options: Options) -> Result<Arc<Self>> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create engine directory {:?}", dir))?;

        let data_path = dir.join(DATA_FILE_NAME);
        ensure!(
            !data_path.exists(),
            "a data file already exists at '{}'",
            data_path.display()
        );

        let page_size = options.page_size;
        let data = DataFile::create(&data_path, page_size, options.initial_file_pages)?;
        let journal = Journal::open(
            &dir.join(JOURNAL_DIR_NAME),
            page_size,
            options.max_journal_segment_size,
            1,
        )?;
        let free_space = FreeSpaceHandling::new(page_size);

        Self::finish(
            dir,
            options,
            page_size,
            data,
            free_space,
            journal,
            0,
            1,
            RecoveryInfo::default(),
        )
    }

    /// Opens an existing store, replaying the journal first so the
    /// in-memory state starts from the last durable commit.
    pub fn open<P: AsRef<Path>>(dir: P, options: Options) -> Result<Arc<Self>> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();

        let data_path = dir.join(DATA_FILE_NAME);
        let mut data = DataFile::open(&data_path)?;
        let page_size = data.page_size();

        let journal_dir = dir.join(JOURNAL_DIR_NAME);
        let recovery = journal::recover_dir(&journal_dir, &mut data)?;

        let header = data.header()?;
        let (last_txn, next_page, free_head, free_count) = recovery.last_state.unwrap_or((
            header.last_flushed_txn,
            header.next_page_number,
            header.free_head_page,
            header.free_entry_count,
        ));

        if recovery.txns_replayed > 0 {
            let mut updated = header;
            updated.next_page_number = next_page;
            updated.free_head_page = free_head;
            updated.free_entry_count = free_count;
            updated.last_flushed_txn = last_txn;
            data.write_header(&updated)?;
            data.sync()?;
        }
        journal::remove_segments(&recovery.segment_paths)?;

        let mut free_space = FreeSpaceHandling::new(page_size);
        free_space.rebuild(&data, free_head, free_count)?;

        let journal = Journal::open(
            &journal_dir,
            page_size,
            options.max_journal_segment_size,
            recovery.max_seq + 1,
        )?;

        Self::finish(
            dir, options, page_size, data, free_space, journal, last_txn, next_page, recovery,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        dir: PathBuf,
        options: Options,
        page_size: usize,
        data: DataFile,
        free_space: FreeSpaceHandling,
        journal: Journal,
        last_committed: TxnId,
        next_page: PageNumber,
        recovery: RecoveryInfo,
    ) -> Result<Arc<Self>> {
        let flush_requested = Arc::new(AtomicBool::new(false));
        let monitor = Arc::new(LowMemoryMonitor::new(options.low_memory_threshold));
        let scratch = ScratchBufferPool::new(
            page_size,
            options.scratch_region_pages,
            monitor.clone(),
            flush_requested.clone(),
        );

        let engine = Arc::new(Self {
            dir,
            page_size,
            data: RwLock::new(data),
            scratch: Mutex::new(scratch),
            free_space: Mutex::new(free_space),
            journal: Mutex::new(journal),
            versions: RwLock::new(PageVersions::new()),
            tracker: TxnTracker::new(last_committed),
            writer: Mutex::new(()),
            flush_lock: Mutex::new(()),
            monitor,
            committed_next_page: AtomicU64::new(next_page),
            txn_meta: Mutex::new(BTreeMap::new()),
            flush_requested,
            flush_failures: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            last_flushed_txn: AtomicU64::new(last_committed),
            backup: Mutex::new(BackupState {
                anchored: false,
                last_backup_seq: 0,
                retained: Vec::new(),
                worker: None,
            }),
            copy_buffers: CopyBufferPool::new(BACKUP_CHUNK_SIZE.max(page_size)),
            flusher: Mutex::new(None),
            recovery,
            options,
        });

        if engine.options.background_flush {
            Self::spawn_flusher(&engine)?;
        }

        Ok(engine)
    }

    /// What the journal replay on open found and applied.
    pub fn recovery_info(&self) -> &RecoveryInfo {
        &self.recovery
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn committed_next_page(&self) -> PageNumber {
        self.committed_next_page.load(Ordering::Acquire)
    }

    /// Opens a snapshot-pinned read transaction. Never blocks the writer
    /// or a running flush.
    pub fn read_txn(&self) -> Result<ReadTxn<'_>> {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");
        ReadTxn::begin(self)
    }

    /// Opens the exclusive write transaction, waiting up to the configured
    /// timeout for a concurrent writer to finish.
    pub fn write_txn(&self) -> Result<WriteTxn<'_>> {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");

        if self.fatal.load(Ordering::Acquire) {
            bail!(FatalStorage {
                consecutive_failures: self.flush_failures.load(Ordering::Acquire),
            });
        }

        let waited = self.options.write_txn_timeout;
        let guard = self
            .writer
            .try_lock_for(waited)
            .ok_or_else(|| eyre::Report::new(WriterContention { waited }))?;

        Ok(WriteTxn::begin(self, guard))
    }

    /// Resolves a page image as of `snapshot`: newest committed scratch
    /// copy at or before it, else the data file, else (for pages
    /// allocated but never written) zeroes.
    pub(crate) fn resolve_page(&self, page: PageNumber, snapshot: TxnId) -> Result<Vec<u8>> {
        {
            // The version guard is held across the scratch read so a
            // concurrent flush cannot release the copy underneath us.
            let versions = self.versions.read();
            if let Some(ptr) = versions.resolve(page, snapshot) {
                let scratch = self.scratch.lock();
                return Ok(scratch.read(ptr)?.to_vec());
            }
        }

        let data = self.data.read();
        if page < data.page_count() {
            Ok(data.page(page)?.to_vec())
        } else {
            Ok(vec![0u8; self.page_size])
        }
    }

    pub(crate) fn commit_write(
        &self,
        txn_id: TxnId,
        mut next_page: PageNumber,
        mut dirty: BTreeMap<PageNumber, Vec<u8>>,
        frees: &[PageNumber],
    ) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");

        let _commit = self.flush_lock.lock();

        // Free-space mutations ride this commit as ordinary dirty pages;
        // chain growth extends the file rather than re-entering the index.
        let rewrite = {
            let mut fs = self.free_space.lock();
            fs.plan_commit(txn_id, frees, || {
                let page = next_page;
                next_page += 1;
                page
            })?
        };
        if let Some(rewrite) = &rewrite {
            for (page, bytes) in &rewrite.pages {
                dirty.insert(*page, bytes.clone());
            }
        }

        let (free_head, free_count) = match &rewrite {
            Some(r) => (r.head, r.entry_count),
            None => {
                let fs = self.free_space.lock();
                (fs.head_page(), fs.free_count())
            }
        };

        // Grow now so disk exhaustion fails this commit (which rolls
        // back) instead of a later flush.
        let committed_next = self.committed_next_page();
        if next_page > committed_next {
            self.data.write().grow(next_page).map_err(|e| {
                e.wrap_err(AllocationExhausted {
                    requested_pages: next_page - committed_next,
                })
            })?;
        }

        // Durability point.
        self.journal
            .lock()
            .append_txn(txn_id, next_page, free_head, free_count, &dirty)?;

        // Publication. Nothing below may fail: the journal already holds
        // the transaction and recovery would replay it.
        {
            let mut versions = self.versions.write();
            let mut scratch = self.scratch.lock();
            for (page, bytes) in &dirty {
                let ptr = scratch.stage(*page, txn_id, bytes)?;
                versions.insert(*page, txn_id, ptr);
            }
        }

        if let Some(rewrite) = rewrite {
            self.free_space.lock().install(rewrite);
        }

        self.txn_meta.lock().insert(
            txn_id,
            TxnMeta {
                next_page_number: next_page,
                free_head_page: free_head,
                free_entry_count: free_count,
            },
        );

        self.committed_next_page.store(next_page, Ordering::Release);
        self.tracker.publish_commit(txn_id);

        Ok(())
    }

    /// Live staged copies in one scratch region (diagnostics).
    pub fn get_number_of_allocations(&self, region: usize) -> Result<usize> {
        self.scratch.lock().get_number_of_allocations(region)
    }

    /// Current host memory pressure, for dashboards and back-pressure.
    pub fn memory_info(&self) -> MemoryInfo {
        self.monitor.get_memory_info()
    }

    /// The injected low-memory monitor, for callers that want the
    /// fail-fast assertion before growing their own structures.
    pub fn low_memory_monitor(&self) -> &LowMemoryMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> Stats {
        let free_page_count = self.free_space.lock().free_count();
        let (scratch_regions, scratch_occupancy_bytes) = {
            let scratch = self.scratch.lock();
            (scratch.region_count(), scratch.occupancy_bytes())
        };

        Stats {
            next_page_number: self.committed_next_page(),
            free_page_count,
            staged_pages: self.versions.read().staged_entries(),
            scratch_regions,
            scratch_occupancy_bytes,
            last_committed_txn: self.tracker.last_committed(),
            last_flushed_txn: self.last_flushed_txn.load(Ordering::Acquire),
            journal_segments: self.journal.lock().segment_count(),
            active_readers: self.tracker.active_readers(),
        }
    }

    /// Background flush policy: staged data plus any of an explicit
    /// request, scratch occupancy over the threshold, age over the
    /// interval, or host memory pressure.
    pub(crate) fn should_flush(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.fatal.load(Ordering::Acquire) {
            return false;
        }
        if self.versions.read().is_empty() {
            return false;
        }
        if self.flush_requested.load(Ordering::Acquire) {
            return true;
        }
        if self.scratch.lock().occupancy_bytes() >= self.options.flush_scratch_threshold {
            return true;
        }
        if self.last_flush.lock().elapsed() >= self.options.flush_interval {
            return true;
        }
        self.monitor.is_low_memory()
    }

    fn spawn_flusher(engine: &Arc<Self>) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(engine);
        let stop_thread = stop.clone();

        let thread = std::thread::Builder::new()
            .name("strata-flush".into())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_millis(100));
                if stop_thread.load(Ordering::Acquire) {
                    break;
                }
                let Some(engine) = weak.upgrade() else { break };
                if engine.should_flush() {
                    // A failure is retried on the next tick; repeated
                    // failure flips the engine fatal and the policy goes
                    // quiet.
                    let _ = engine.flush_log_to_data_file();
                }
            })
            .wrap_err("failed to spawn background flusher")?;

        *engine.flusher.lock() = Some(FlusherHandle { stop, thread });
        Ok(())
    }

    /// Shuts the engine down: stops the flusher, joins any backup worker,
    /// flushes, and syncs. All teardown errors are aggregated into one
    /// report so operators see the full picture.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut failures: Vec<String> = Vec::new();

        if let Some(handle) = self.flusher.lock().take() {
            handle.stop.store(true, Ordering::Release);
            if handle.thread.join().is_err() {
                failures.push("background flusher panicked".into());
            }
        }

        // Take the handle out before joining: the worker itself locks the
        // backup state.
        let worker = {
            let mut backup = self.backup.lock();
            backup.worker.take()
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                failures.push("backup worker panicked".into());
            }
        }

        if !self.fatal.load(Ordering::Acquire) {
            if let Err(e) = self.flush_log_to_data_file() {
                failures.push(format!("final flush failed: {e:#}"));
            }
        }

        if let Err(e) = self.data.read().sync() {
            failures.push(format!("data file sync failed: {e:#}"));
        }

        self.closed.store(true, Ordering::Release);

        if failures.is_empty() {
            Ok(())
        } else {
            bail!(
                "engine shutdown completed with {} error(s): {}",
                failures.len(),
                failures.join("; ")
            )
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}
