//! # Strata - Transactional Page-Storage Engine
//!
//! Strata is the storage core a document database sits on: ACID
//! transactions over a memory-mapped, page-aligned file, with snapshot
//! isolation between concurrent readers and a single writer. It knows
//! nothing about documents, indexes, queries, or the network — the layers
//! above open transactions, read and write opaque pages through them, and
//! commit.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strata::{Engine, Options};
//!
//! let engine = Engine::create("./store", Options::default())?;
//!
//! let mut txw = engine.write_txn()?;
//! let page = txw.allocate(1)?;
//! txw.write_page(page, &payload)?;
//! txw.commit()?;
//!
//! let txr = engine.read_txn()?;
//! let bytes = txr.get_page(page)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Transaction API (ReadTxn / WriteTxn)     │
//! ├───────────────┬───────────────┬───────────────┤
//! │ Page          │ Free-Space    │ Backup /      │
//! │ Allocation    │ Handling      │ Restore       │
//! ├───────────────┴───────┬───────┴───────────────┤
//! │  Scratch Buffer Pool  │  Journal + Flush      │
//! ├───────────────────────┴───────────────────────┤
//! │    Memory-Mapped Data File · Memory Monitor   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A write transaction buffers page images privately; commit appends them
//! to the durable journal, stages them in the volatile scratch pool, and
//! publishes visibility. Readers pin a snapshot and resolve pages through
//! the scratch copies their snapshot covers, else the data file. Flush
//! drains scratch into the mapped file — never past the oldest open
//! reader — and recycles scratch regions and journal segments. Freed
//! pages are recorded in a persistent free-space index and reused once no
//! reader's snapshot can still see them.
//!
//! ## File Layout
//!
//! ```text
//! store_dir/
//! ├── strata.db            # page-aligned data file, memory-mapped
//! ├── journal/
//! │   └── journal.000001   # durable journal segments
//! └── backup.status        # polled backup status document
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: environment lifecycle, commit orchestration, flush policy
//! - [`txn`]: read/write transactions, snapshot tracking, version table
//! - [`storage`]: memory-mapped data file and on-disk header
//! - [`scratch`]: volatile staging for committed-but-unflushed pages
//! - [`freespace`]: persistent free-page index with re-entrancy guard
//! - [`journal`]: durable commit log and flush-to-data-file
//! - [`backup`]: full/incremental backup, restore, status document
//! - [`memory`]: on-demand host memory pressure monitor

pub mod backup;
pub mod config;
pub mod engine;
pub mod freespace;
pub mod journal;
pub mod memory;
pub mod scratch;
pub mod storage;
pub mod txn;

pub use backup::{BackupOutcome, BackupPhase, BackupStatus, CancellationToken};
pub use engine::{AllocationExhausted, Engine, FatalStorage, Options, Stats, WriterContention};
pub use journal::{FlushOutcome, RecoveryInfo};
pub use memory::{LowMemoryMonitor, MemoryInfo};
pub use storage::PageNumber;
pub use txn::{ReadTxn, TxnId, WriteTxn};
