//! Typed error payloads for conditions callers must tell apart.
//!
//! Most failures carry enough context as plain `eyre` reports. The
//! conditions below get dedicated types because the error taxonomy
//! requires callers to distinguish them programmatically — a writer
//! timing out is handled very differently from the disk filling up, and
//! a fatal storage condition differently from a transient flush failure.
//! All of them implement `std::error::Error` and are recovered from an
//! `eyre::Report` by downcast.

use std::time::Duration;

/// `write_txn()` waited out its timeout while another write transaction
/// held the writer slot. Retryable; reported distinctly from allocation
/// exhaustion.
#[derive(Debug)]
pub struct WriterContention {
    pub waited: Duration,
}

impl std::fmt::Display for WriterContention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "another write transaction is active (waited {:?})",
            self.waited
        )
    }
}

impl std::error::Error for WriterContention {}

/// The data file could not grow to hold newly allocated pages — disk
/// full or quota exceeded. The committing transaction is rolled back.
#[derive(Debug)]
pub struct AllocationExhausted {
    pub requested_pages: u64,
}

impl std::fmt::Display for AllocationExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "out of space: failed to extend the data file by {} page(s)",
            self.requested_pages
        )
    }
}

impl std::error::Error for AllocationExhausted {}

/// Flushing failed repeatedly. Staged data is still intact in scratch and
/// the journal, so readers remain correct, but durability of the data
/// file cannot be restored without intervention; the engine refuses new
/// write transactions.
#[derive(Debug)]
pub struct FatalStorage {
    pub consecutive_failures: u32,
}

impl std::fmt::Display for FatalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fatal storage condition: flush failed {} consecutive times",
            self.consecutive_failures
        )
    }
}

impl std::error::Error for FatalStorage {}
