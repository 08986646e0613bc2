//! # Scratch Buffer Pool
//!
//! Volatile, append-only staging for dirty pages. Every page a write
//! transaction commits is copied into a scratch region and stays there —
//! retrievable by any reader whose snapshot covers it — until a flush has
//! both written it to the data file and confirmed that no open reader
//! still needs the pre-flush copy.
//!
//! ## Regions
//!
//! The pool owns a small set of rotating regions (owned byte arenas of
//! `scratch_region_pages` pages each). Staging bumps a write cursor and
//! never moves earlier copies, so a [`ScratchPointer`] stays valid until
//! its region is reset. A region is reset wholesale once its live count
//! reaches zero — flush released every copy and no reader can reach one —
//! and reset regions are reused before a new region is created.
//!
//! ## Memory Pressure
//!
//! Before creating a region the pool consults the low-memory monitor.
//! Under pressure it raises the shared flush-requested flag so the flush
//! policy drains staged pages instead of letting the pool keep growing.
//! Staging itself still succeeds; refusing to stage would fail commits
//! that the journal has already made durable.
//!
//! ## Introspection
//!
//! `get_number_of_allocations(region)` reports the region's live staged
//! copies. The count decreases as flushes retire entries, which is the
//! signal back-pressure heuristics and tests key on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::memory::LowMemoryMonitor;
use crate::storage::PageNumber;
use crate::txn::TxnId;

/// Location of one staged page copy. Valid until the region is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchPointer {
    pub region: usize,
    pub offset: usize,
}

#[derive(Debug)]
struct ScratchRegion {
    buf: Vec<u8>,
    write_pos: usize,
    live: usize,
}

impl ScratchRegion {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            write_pos: 0,
            live: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    fn reset(&mut self) {
        self.write_pos = 0;
        self.live = 0;
    }
}

pub struct ScratchBufferPool {
    regions: Vec<ScratchRegion>,
    page_size: usize,
    region_bytes: usize,
    monitor: Arc<LowMemoryMonitor>,
    flush_requested: Arc<AtomicBool>,
}

impl ScratchBufferPool {
    pub fn new(
        page_size: usize,
        region_pages: usize,
        monitor: Arc<LowMemoryMonitor>,
        flush_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            regions: Vec::new(),
            page_size,
            region_bytes: page_size * region_pages.max(1),
            monitor,
            flush_requested,
        }
    }

    /// Copies one page image into scratch and returns its location. The
    /// caller tags the pointer with the owning transaction in the version
    /// table; the pool itself only tracks occupancy.
    pub fn stage(&mut self, page: PageNumber, txn: TxnId, bytes: &[u8]) -> Result<ScratchPointer> {
        ensure!(
            bytes.len() == self.page_size,
            "staged page {} (txn {}) must be exactly {} bytes, got {}",
            page,
            txn,
            self.page_size,
            bytes.len()
        );

        let region = self.region_with_space()?;
        let offset = self.regions[region].write_pos;

        self.regions[region].buf[offset..offset + self.page_size].copy_from_slice(bytes);
        self.regions[region].write_pos += self.page_size;
        self.regions[region].live += 1;

        Ok(ScratchPointer { region, offset })
    }

    pub fn read(&self, ptr: ScratchPointer) -> Result<&[u8]> {
        ensure!(
            ptr.region < self.regions.len(),
            "scratch region {} out of bounds ({} regions)",
            ptr.region,
            self.regions.len()
        );

        let region = &self.regions[ptr.region];
        ensure!(
            ptr.offset + self.page_size <= region.write_pos,
            "scratch offset {} past write position {} in region {}",
            ptr.offset,
            region.write_pos,
            ptr.region
        );

        Ok(&region.buf[ptr.offset..ptr.offset + self.page_size])
    }

    /// Releases one staged copy after flush has made it durable. A region
    /// whose live count reaches zero is reset immediately for reuse;
    /// returns whether this release drained its region.
    pub fn release(&mut self, ptr: ScratchPointer) -> Result<bool> {
        ensure!(
            ptr.region < self.regions.len(),
            "scratch region {} out of bounds ({} regions)",
            ptr.region,
            self.regions.len()
        );

        let region = &mut self.regions[ptr.region];
        ensure!(
            region.live > 0,
            "release on region {} with no live allocations",
            ptr.region
        );

        region.live -= 1;
        if region.live == 0 {
            region.reset();
            return Ok(true);
        }

        Ok(false)
    }

    /// Reclaims a drained region explicitly. Fails fast if copies are
    /// still live — resetting under a reader is an invariant violation.
    pub fn reset(&mut self, region: usize) -> Result<()> {
        ensure!(
            region < self.regions.len(),
            "scratch region {} out of bounds ({} regions)",
            region,
            self.regions.len()
        );
        ensure!(
            self.regions[region].live == 0,
            "cannot reset scratch region {} with {} live allocations",
            region,
            self.regions[region].live
        );

        self.regions[region].reset();
        Ok(())
    }

    pub fn get_number_of_allocations(&self, region: usize) -> Result<usize> {
        ensure!(
            region < self.regions.len(),
            "scratch region {} out of bounds ({} regions)",
            region,
            self.regions.len()
        );

        Ok(self.regions[region].live)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Bytes currently held by live staged copies, across all regions.
    pub fn occupancy_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.live * self.page_size).sum()
    }

    fn region_with_space(&mut self) -> Result<usize> {
        for (idx, region) in self.regions.iter().enumerate() {
            if region.remaining() >= self.page_size {
                return Ok(idx);
            }
        }

        // Every region is full; growing further is what the low-memory
        // monitor gets a say in. Ask for a flush instead of growing
        // silently.
        if self.monitor.is_low_memory() {
            self.flush_requested.store(true, Ordering::Release);
        }

        self.regions.push(ScratchRegion::new(self.region_bytes));
        Ok(self.regions.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(page_size: usize, region_pages: usize) -> ScratchBufferPool {
        let monitor = Arc::new(LowMemoryMonitor::new(0));
        ScratchBufferPool::new(
            page_size,
            region_pages,
            monitor,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn stage_and_read_roundtrip() {
        let mut pool = test_pool(512, 4);

        let a = vec![0xAA; 512];
        let b = vec![0xBB; 512];
        let ptr_a = pool.stage(1, 1, &a).unwrap();
        let ptr_b = pool.stage(2, 1, &b).unwrap();

        assert_eq!(pool.read(ptr_a).unwrap(), &a[..]);
        assert_eq!(pool.read(ptr_b).unwrap(), &b[..]);
        assert_eq!(pool.get_number_of_allocations(0).unwrap(), 2);
    }

    #[test]
    fn stage_rejects_wrong_size() {
        let mut pool = test_pool(512, 4);
        assert!(pool.stage(1, 1, &[0u8; 100]).is_err());
    }

    #[test]
    fn full_region_rotates_to_new_region() {
        let mut pool = test_pool(512, 2);

        let page = vec![0x11; 512];
        pool.stage(1, 1, &page).unwrap();
        pool.stage(2, 1, &page).unwrap();
        let ptr = pool.stage(3, 1, &page).unwrap();

        assert_eq!(ptr.region, 1);
        assert_eq!(pool.region_count(), 2);
        assert_eq!(pool.get_number_of_allocations(0).unwrap(), 2);
        assert_eq!(pool.get_number_of_allocations(1).unwrap(), 1);
    }

    #[test]
    fn drained_region_is_reused_before_growing() {
        let mut pool = test_pool(512, 2);

        let page = vec![0x22; 512];
        let p1 = pool.stage(1, 1, &page).unwrap();
        let p2 = pool.stage(2, 1, &page).unwrap();

        pool.release(p1).unwrap();
        pool.release(p2).unwrap();

        // Region 0 drained and reset; the next stage lands back in it.
        let p3 = pool.stage(3, 2, &page).unwrap();
        assert_eq!(p3.region, 0);
        assert_eq!(p3.offset, 0);
        assert_eq!(pool.region_count(), 1);
    }

    #[test]
    fn reset_refuses_live_allocations() {
        let mut pool = test_pool(512, 2);

        let page = vec![0x33; 512];
        let ptr = pool.stage(1, 1, &page).unwrap();

        assert!(pool.reset(0).is_err());

        pool.release(ptr).unwrap();
        assert!(pool.reset(0).is_ok());
    }

    #[test]
    fn occupancy_tracks_live_bytes() {
        let mut pool = test_pool(512, 4);

        let page = vec![0x44; 512];
        let p1 = pool.stage(1, 1, &page).unwrap();
        pool.stage(2, 1, &page).unwrap();

        assert_eq!(pool.occupancy_bytes(), 1024);

        pool.release(p1).unwrap();
        assert_eq!(pool.occupancy_bytes(), 512);
    }

    #[test]
    fn out_of_bounds_introspection_fails() {
        let pool = test_pool(512, 4);
        assert!(pool.get_number_of_allocations(0).is_err());
    }
}
