//! # Engine Configuration Constants
//!
//! This module centralizes the constants shared across the storage engine,
//! grouping interdependent values together and documenting their
//! relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> FILE_HEADER_SIZE (64 bytes, page 0 only)
//!       │     The file header must fit in the smallest supported page.
//!       │
//!       ├─> SECTION_HEADER_SIZE (16 bytes)
//!       │     Free-space section capacity is derived per page size:
//!       │     (page_size - SECTION_HEADER_SIZE) / SECTION_ENTRY_SIZE
//!       │
//!       └─> TXN_RECORD_HEADER_SIZE (48 bytes per journal record)
//!             Each journal record = header + page_count frames
//!
//! MIN_PAGE_SIZE (512)
//!       │
//!       └─> must hold FILE_HEADER_SIZE plus at least one free-space entry
//!
//! MAX_CONCURRENT_READERS (64)
//!       │
//!       └─> fixed slot table in the transaction tracker; raising it only
//!           costs 8 bytes per slot
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MIN_PAGE_SIZE` is a power of two and `>= FILE_HEADER_SIZE +
//!    SECTION_HEADER_SIZE + SECTION_ENTRY_SIZE`
//! 2. `FILE_HEADER_SIZE` matches the zerocopy layout in `storage::header`
//! 3. `TXN_RECORD_HEADER_SIZE` matches the zerocopy layout in `journal`
//!
//! These are enforced by compile-time assertions below and by unit tests
//! against the actual struct sizes.

/// Default size of each page in bytes (8KB).
/// Chosen at database creation; persisted in the file header and validated
/// on open. Larger pages reduce chain depth in the free-space index at the
/// cost of write amplification.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Smallest supported page size. Small pages are mainly useful in tests,
/// where they make section-chain growth cheap to provoke.
pub const MIN_PAGE_SIZE: usize = 512;

/// Size of the file header in bytes (page 0 only).
pub const FILE_HEADER_SIZE: usize = 64;

/// Size of a free-space section page header.
pub const SECTION_HEADER_SIZE: usize = 16;

/// Size of one persisted free-space entry (page number + freeing txn id).
pub const SECTION_ENTRY_SIZE: usize = 16;

/// Size of a journal transaction record header.
pub const TXN_RECORD_HEADER_SIZE: usize = 48;

/// Size of the per-page frame prefix inside a journal record (page number).
pub const PAGE_FRAME_PREFIX_SIZE: usize = 8;

/// Size of a backup archive header.
pub const ARCHIVE_HEADER_SIZE: usize = 40;

/// Default number of pages per scratch region.
/// A region is the unit of scratch reuse: it is reset wholesale once every
/// staged copy in it has been flushed and released.
pub const DEFAULT_SCRATCH_REGION_PAGES: usize = 256;

/// Default journal segment rotation threshold.
pub const DEFAULT_MAX_JOURNAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Default scratch occupancy (bytes) that triggers a background flush.
pub const DEFAULT_FLUSH_SCRATCH_THRESHOLD: usize = 8 * 1024 * 1024;

/// Default interval after which staged-but-unflushed data triggers a
/// background flush.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Default time a writer waits for the writer slot before reporting
/// contention.
pub const DEFAULT_WRITE_TXN_TIMEOUT_MS: u64 = 10_000;

/// Consecutive flush failures tolerated before the engine reports a fatal
/// storage condition.
pub const DEFAULT_MAX_FLUSH_FAILURES: u32 = 3;

/// Default available-memory floor for the low-memory monitor (64MB).
pub const DEFAULT_LOW_MEMORY_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Maximum number of concurrently open read transactions.
pub const MAX_CONCURRENT_READERS: usize = 64;

/// Copy chunk size used by backup/restore streaming.
pub const BACKUP_CHUNK_SIZE: usize = 64 * 1024;

/// Well-known name of the persisted backup status document.
pub const BACKUP_STATUS_DOCUMENT_NAME: &str = "backup.status";

/// Data file name inside an engine directory.
pub const DATA_FILE_NAME: &str = "strata.db";

/// Journal directory name inside an engine directory.
pub const JOURNAL_DIR_NAME: &str = "journal";

const _: () = assert!(
    MIN_PAGE_SIZE.is_power_of_two(),
    "MIN_PAGE_SIZE must be a power of two"
);

const _: () = assert!(
    MIN_PAGE_SIZE >= FILE_HEADER_SIZE + SECTION_HEADER_SIZE + SECTION_ENTRY_SIZE,
    "MIN_PAGE_SIZE must hold the file header and at least one free-space entry"
);

const _: () = assert!(
    DEFAULT_PAGE_SIZE % MIN_PAGE_SIZE == 0,
    "DEFAULT_PAGE_SIZE must be a multiple of MIN_PAGE_SIZE"
);
