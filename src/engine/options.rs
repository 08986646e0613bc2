//! Engine configuration.
//!
//! Plain data with validated defaults. `page_size` only matters at
//! creation — an opened store adopts the size persisted in its header —
//! while the rest applies to every incarnation.

use std::time::Duration;

use eyre::{ensure, Result};

use crate::config::{
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_SCRATCH_THRESHOLD, DEFAULT_LOW_MEMORY_THRESHOLD,
    DEFAULT_MAX_FLUSH_FAILURES, DEFAULT_MAX_JOURNAL_SEGMENT_SIZE, DEFAULT_PAGE_SIZE,
    DEFAULT_SCRATCH_REGION_PAGES, DEFAULT_WRITE_TXN_TIMEOUT_MS, MIN_PAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct Options {
    /// Page size chosen at database creation; persisted and validated on
    /// open. Power of two, at least `MIN_PAGE_SIZE`.
    pub page_size: usize,
    /// Pages the data file starts with (page 0 is the header).
    pub initial_file_pages: u64,
    /// Pages per scratch region.
    pub scratch_region_pages: usize,
    /// Journal segment rotation threshold in bytes.
    pub max_journal_segment_size: u64,
    /// How long `write_txn()` waits for the writer slot before reporting
    /// contention.
    pub write_txn_timeout: Duration,
    /// Staged-data age that triggers a background flush.
    pub flush_interval: Duration,
    /// Scratch occupancy (bytes) that triggers a background flush.
    pub flush_scratch_threshold: usize,
    /// Consecutive flush failures before the engine turns fatal.
    pub max_flush_failures: u32,
    /// Available-memory floor for the low-memory monitor.
    pub low_memory_threshold: u64,
    /// Run the background flusher thread. Off by default; embedders that
    /// do not flush manually should enable it.
    pub background_flush: bool,
    /// Retain flushed journal segments until an incremental backup
    /// consumes them.
    pub incremental_backup_enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_file_pages: 1,
            scratch_region_pages: DEFAULT_SCRATCH_REGION_PAGES,
            max_journal_segment_size: DEFAULT_MAX_JOURNAL_SEGMENT_SIZE,
            write_txn_timeout: Duration::from_millis(DEFAULT_WRITE_TXN_TIMEOUT_MS),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            flush_scratch_threshold: DEFAULT_FLUSH_SCRATCH_THRESHOLD,
            max_flush_failures: DEFAULT_MAX_FLUSH_FAILURES,
            low_memory_threshold: DEFAULT_LOW_MEMORY_THRESHOLD,
            background_flush: false,
            incremental_backup_enabled: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two() && self.page_size >= MIN_PAGE_SIZE,
            "page_size {} must be a power of two >= {}",
            self.page_size,
            MIN_PAGE_SIZE
        );
        ensure!(
            self.initial_file_pages >= 1,
            "initial_file_pages must be at least 1"
        );
        ensure!(
            self.scratch_region_pages >= 1,
            "scratch_region_pages must be at least 1"
        );
        ensure!(
            self.max_journal_segment_size >= 1,
            "max_journal_segment_size must be positive"
        );
        ensure!(
            self.max_flush_failures >= 1,
            "max_flush_failures must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn bad_page_size_rejected() {
        let mut options = Options::default();
        options.page_size = 1000;
        assert!(options.validate().is_err());

        options.page_size = 256;
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_initial_pages_rejected() {
        let mut options = Options::default();
        options.initial_file_pages = 0;
        assert!(options.validate().is_err());
    }
}
