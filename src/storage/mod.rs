//! # Storage Module
//!
//! The foundational layer of the engine: a page-aligned data file accessed
//! through a memory map, with zero-copy page slices and compile-time
//! safety through the borrow checker.
//!
//! ## Architecture Overview
//!
//! The data file is mapped directly into the process address space. Reads
//! return `&[u8]` slices pointing into the mapping; page faults and caching
//! are handled by the OS. Growing the file requires `&mut self`, so the
//! borrow checker guarantees no page reference survives a remap.
//!
//! ## File Layout
//!
//! ```text
//! engine_dir/
//! ├── strata.db            # Page-aligned data file (this module)
//! ├── journal/
//! │   └── journal.000001   # Durable journal segments (journal module)
//! └── backup.status        # Backup status document (backup module)
//! ```
//!
//! Page 0 of the data file carries the 64-byte [`FileHeader`]; pages 1 and
//! up are opaque content owned by the layers above. The page size is chosen
//! at creation, persisted in the header, and validated on open.
//!
//! ## Module Organization
//!
//! - `data_file`: memory-mapped data file (`DataFile`)
//! - `header`: on-disk file header layout
//!
//! ## Thread Safety
//!
//! `DataFile` is `Send` but not `Sync`; the engine wraps it in a `RwLock`
//! so concurrent readers share the mapping while grow and flush take it
//! exclusively.

mod data_file;
mod header;

pub use data_file::DataFile;
pub use header::FileHeader;

/// A page number inside the data file. Monotonically assigned; page 0 is
/// the file header.
pub type PageNumber = u64;
