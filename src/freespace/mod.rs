//! # Free-Space Handling
//!
//! Tracks which pages of the data file are free and reusable, so
//! allocation serves previously-freed pages before growing the file.
//!
//! ## Persistent Layout
//!
//! The index is persisted in the data file's own page space as a chain of
//! section pages, each holding a fixed-capacity array of entries:
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  ----------------------------------------
//! 0       8      next: page number of the next section (0 = none)
//! 8       4      count: entries stored in this section
//! 12      4      reserved
//! 16      16*N   entries: (page number u64, freed-at txn id u64)
//! ```
//!
//! The head page number and total entry count live in the file header.
//! Section pages travel the same commit path as any other dirty page, so
//! the index inherits the engine's durability and snapshot semantics.
//!
//! ## In-Memory View
//!
//! An ordered map (page → freed-at txn) mirrors the chain and is rebuilt
//! from it on open. Allocation scans the map in ascending page order for a
//! contiguous run of the requested length; the lowest eligible page number
//! wins, which keeps allocations local and fragmentation from regressing
//! under repeated alloc/free cycles.
//!
//! ## Reader Isolation
//!
//! An entry freed at transaction T is eligible only while no open read
//! transaction has a snapshot id ≤ T. Eligibility is re-checked on every
//! allocation against the oldest active snapshot.
//!
//! ## Re-entrancy
//!
//! Rewriting the chain may itself free pages (surplus sections) — that
//! free must not re-enter the rewrite. The [`RecursiveCallGuard`] queues
//! such frees; `plan_commit` drains and re-applies them until the chain is
//! stable. Pages the chain *gains* are allocated by extending the file,
//! never through the index being rewritten.
//!
//! ## Double Free
//!
//! Freeing a page already recorded free is a programming error and fails
//! the commit immediately rather than deduping silently.

mod guard;

pub use guard::RecursiveCallGuard;

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{SECTION_ENTRY_SIZE, SECTION_HEADER_SIZE};
use crate::storage::{DataFile, PageNumber};
use crate::txn::TxnId;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SectionHeader {
    next: u64,
    count: u32,
    _reserved: u32,
}

/// The section-chain images a commit must write, plus the state to install
/// once the commit is durable.
#[derive(Debug)]
pub struct SectionRewrite {
    /// Section page images to add to the committing transaction's dirty set.
    pub pages: Vec<(PageNumber, Vec<u8>)>,
    /// New head of the chain (0 when the index is empty).
    pub head: PageNumber,
    /// Total entries across the chain.
    pub entry_count: u64,
    map: BTreeMap<PageNumber, TxnId>,
    chain: Vec<PageNumber>,
}

pub struct FreeSpaceHandling {
    map: BTreeMap<PageNumber, TxnId>,
    chain: Vec<PageNumber>,
    guard: RecursiveCallGuard,
    needs_rewrite: bool,
    page_size: usize,
}

impl FreeSpaceHandling {
    pub fn new(page_size: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            chain: Vec::new(),
            guard: RecursiveCallGuard::new(),
            needs_rewrite: false,
            page_size,
        }
    }

    pub fn entries_per_section(page_size: usize) -> usize {
        (page_size - SECTION_HEADER_SIZE) / SECTION_ENTRY_SIZE
    }

    /// Rebuilds the in-memory view by walking the persisted chain.
    pub fn rebuild(&mut self, data: &DataFile, head: PageNumber, expected_count: u64) -> Result<()> {
        self.map.clear();
        self.chain.clear();
        self.needs_rewrite = false;

        let mut next = head;
        while next != 0 {
            let page = data.page(next)?;
            let (header, _) = SectionHeader::read_from_prefix(page)
                .map_err(|e| eyre::eyre!("invalid free-space section header: {:?}", e))?;

            let cap = Self::entries_per_section(self.page_size);
            ensure!(
                header.count as usize <= cap,
                "free-space section {} claims {} entries, capacity is {}",
                next,
                header.count,
                cap
            );

            for i in 0..header.count as usize {
                let off = SECTION_HEADER_SIZE + i * SECTION_ENTRY_SIZE;
                let entry_page =
                    u64::from_le_bytes(page[off..off + 8].try_into().expect("slice is 8 bytes"));
                let freed_txn = u64::from_le_bytes(
                    page[off + 8..off + 16].try_into().expect("slice is 8 bytes"),
                );

                ensure!(
                    self.map.insert(entry_page, freed_txn).is_none(),
                    "free-space index corrupted: page {} recorded free twice",
                    entry_page
                );
            }

            self.chain.push(next);
            next = header.next;
        }

        ensure!(
            self.map.len() as u64 == expected_count,
            "free-space index corrupted: header claims {} entries, chain holds {}",
            expected_count,
            self.map.len()
        );

        Ok(())
    }

    pub fn free_count(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn head_page(&self) -> PageNumber {
        self.chain.first().copied().unwrap_or(0)
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.map.contains_key(&page)
    }

    /// Attempts to serve `count` contiguous pages from the free index.
    /// Returns the removed entries (ascending page order) so a rollback
    /// can reinsert them. Eligibility: no open reader may have a snapshot
    /// at or before the freeing transaction.
    pub fn try_allocate(
        &mut self,
        count: u64,
        oldest_read_snapshot: Option<TxnId>,
    ) -> Option<Vec<(PageNumber, TxnId)>> {
        debug_assert!(count >= 1);

        let eligible = |freed_txn: TxnId| oldest_read_snapshot.map_or(true, |min| freed_txn < min);

        let mut run: Vec<(PageNumber, TxnId)> = Vec::new();
        for (&page, &freed_txn) in &self.map {
            let contiguous = match run.last() {
                Some(&(prev, _)) => page == prev + 1,
                None => true,
            };

            if !contiguous || !eligible(freed_txn) {
                run.clear();
            }

            if eligible(freed_txn) {
                run.push((page, freed_txn));
                if run.len() as u64 == count {
                    break;
                }
            }
        }

        if run.len() as u64 != count {
            return None;
        }

        for &(page, _) in &run {
            self.map.remove(&page);
        }
        self.needs_rewrite = true;

        Some(run)
    }

    /// Undoes `try_allocate` removals for a rolled-back transaction. After
    /// reinsertion the map matches the persisted chain again.
    pub fn reinsert(&mut self, entries: &[(PageNumber, TxnId)]) {
        for &(page, freed_txn) in entries {
            self.map.insert(page, freed_txn);
        }
        self.needs_rewrite = false;
    }

    pub fn needs_rewrite(&self) -> bool {
        self.needs_rewrite
    }

    /// Computes the section-chain rewrite for a committing transaction:
    /// records its frees, extends or shrinks the chain, and drains frees
    /// the shrink itself raised until the chain is stable. `alloc_page` is
    /// called to extend the file when the chain needs a new page — chain
    /// growth never goes through the index being rewritten.
    ///
    /// Returns `None` when neither frees nor earlier allocations changed
    /// the index. The caller stages `pages` with its dirty set and calls
    /// [`install`](Self::install) once the commit is durable.
    pub fn plan_commit(
        &mut self,
        txn: TxnId,
        frees: &[PageNumber],
        mut alloc_page: impl FnMut() -> PageNumber,
    ) -> Result<Option<SectionRewrite>> {
        if frees.is_empty() && !self.needs_rewrite {
            return Ok(None);
        }

        self.guard.enter()?;
        let result = self.plan_commit_inner(txn, frees, &mut alloc_page);
        self.guard.exit();

        result.map(Some)
    }

    fn plan_commit_inner(
        &mut self,
        txn: TxnId,
        frees: &[PageNumber],
        alloc_page: &mut impl FnMut() -> PageNumber,
    ) -> Result<SectionRewrite> {
        let mut candidate = self.map.clone();

        for &page in frees {
            ensure!(page != 0, "cannot free the header page");
            if candidate.insert(page, txn).is_some() {
                bail!("page {} freed twice (already recorded free)", page);
            }
        }

        let cap = Self::entries_per_section(self.page_size);
        let mut chain = self.chain.clone();

        // Shrinking the chain frees its surplus pages, which lands more
        // entries in the index and may change the chain size again. Drain
        // the deferred frees until a pass changes nothing; the loop is
        // bounded because every pass either shortens the chain or stops.
        for _ in 0..8 {
            let needed = candidate.len().div_ceil(cap);

            while chain.len() < needed {
                chain.push(alloc_page());
            }
            if chain.len() > needed {
                for surplus in chain.drain(needed..) {
                    self.guard.defer(surplus);
                }
            }

            let drained = self.guard.take_deferred();
            if drained.is_empty() {
                let pages = serialize_sections(&candidate, &chain, self.page_size);
                return Ok(SectionRewrite {
                    head: chain.first().copied().unwrap_or(0),
                    entry_count: candidate.len() as u64,
                    pages,
                    map: candidate,
                    chain,
                });
            }

            for page in drained {
                if candidate.insert(page, txn).is_some() {
                    bail!("page {} freed twice (already recorded free)", page);
                }
            }
        }

        bail!("free-space section chain failed to stabilize");
    }

    /// Installs the rewrite computed by `plan_commit` after the commit is
    /// durable.
    pub fn install(&mut self, rewrite: SectionRewrite) {
        self.map = rewrite.map;
        self.chain = rewrite.chain;
        self.needs_rewrite = false;
    }
}

fn serialize_sections(
    map: &BTreeMap<PageNumber, TxnId>,
    chain: &[PageNumber],
    page_size: usize,
) -> Vec<(PageNumber, Vec<u8>)> {
    let cap = FreeSpaceHandling::entries_per_section(page_size);
    let mut pages = Vec::with_capacity(chain.len());
    let mut entries = map.iter();

    for (idx, &section_page) in chain.iter().enumerate() {
        let mut buf = vec![0u8; page_size];
        let mut count = 0u32;

        for (&page, &freed_txn) in entries.by_ref().take(cap) {
            let off = SECTION_HEADER_SIZE + count as usize * SECTION_ENTRY_SIZE;
            buf[off..off + 8].copy_from_slice(&page.to_le_bytes());
            buf[off + 8..off + 16].copy_from_slice(&freed_txn.to_le_bytes());
            count += 1;
        }

        let header = SectionHeader {
            next: chain.get(idx + 1).copied().unwrap_or(0),
            count,
            _reserved: 0,
        };
        buf[..SECTION_HEADER_SIZE].copy_from_slice(header.as_bytes());

        pages.push((section_page, buf));
    }

    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    fn cap() -> usize {
        FreeSpaceHandling::entries_per_section(PAGE)
    }

    fn plan(
        fs: &mut FreeSpaceHandling,
        txn: TxnId,
        frees: &[PageNumber],
        next_page: &mut PageNumber,
    ) -> Option<SectionRewrite> {
        fs.plan_commit(txn, frees, || {
            let p = *next_page;
            *next_page += 1;
            p
        })
        .unwrap()
    }

    #[test]
    fn frees_become_entries_and_lowest_page_wins() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page = 100;

        let rewrite = plan(&mut fs, 5, &[30, 10, 20], &mut next_page).unwrap();
        fs.install(rewrite);

        assert_eq!(fs.free_count(), 3);

        let run = fs.try_allocate(1, None).unwrap();
        assert_eq!(run, vec![(10, 5)]);
        assert_eq!(fs.free_count(), 2);
    }

    #[test]
    fn contiguous_run_allocation() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page = 100;

        let rewrite = plan(&mut fs, 3, &[7, 8, 9, 11, 12], &mut next_page).unwrap();
        fs.install(rewrite);

        // 3 contiguous pages only exist at 7..=9.
        let run = fs.try_allocate(3, None).unwrap();
        let pages: Vec<_> = run.iter().map(|&(p, _)| p).collect();
        assert_eq!(pages, vec![7, 8, 9]);

        // 11,12 remain but no run of 3 exists anymore.
        assert!(fs.try_allocate(3, None).is_none());
        assert!(fs.try_allocate(2, None).is_some());
    }

    #[test]
    fn reader_snapshot_blocks_reuse() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page = 100;

        let rewrite = plan(&mut fs, 10, &[42], &mut next_page).unwrap();
        fs.install(rewrite);

        // A reader pinned at or before the freeing transaction blocks reuse.
        assert!(fs.try_allocate(1, Some(10)).is_none());
        assert!(fs.try_allocate(1, Some(5)).is_none());

        // A reader past the freeing transaction does not.
        assert!(fs.try_allocate(1, Some(11)).is_some());
    }

    #[test]
    fn double_free_fails_fast() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page = 100;

        let rewrite = plan(&mut fs, 2, &[5], &mut next_page).unwrap();
        fs.install(rewrite);

        let result = fs.plan_commit(3, &[5], || unreachable!());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("freed twice"));

        // The failed plan must not leave the guard stuck.
        assert!(plan(&mut fs, 4, &[6], &mut next_page).is_some());
    }

    #[test]
    fn reinsert_restores_rolled_back_allocation() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page = 100;

        let rewrite = plan(&mut fs, 2, &[5, 6], &mut next_page).unwrap();
        fs.install(rewrite);

        let run = fs.try_allocate(2, None).unwrap();
        assert_eq!(fs.free_count(), 0);
        assert!(fs.needs_rewrite());

        fs.reinsert(&run);
        assert_eq!(fs.free_count(), 2);
        assert!(!fs.needs_rewrite());
    }

    #[test]
    fn chain_growth_allocates_by_extending() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page: PageNumber = 1000;

        // More entries than one section holds forces a second chain page,
        // taken from the extend callback rather than the index.
        let frees: Vec<PageNumber> = (1..=(cap() as u64 + 1)).collect();
        let rewrite = plan(&mut fs, 1, &frees, &mut next_page).unwrap();

        assert_eq!(rewrite.pages.len(), 2);
        assert_eq!(next_page, 1002);
        assert_eq!(rewrite.entry_count, cap() as u64 + 1);
        fs.install(rewrite);
        assert_eq!(fs.head_page(), 1000);
    }

    #[test]
    fn chain_shrink_defers_surplus_section_frees() {
        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page: PageNumber = 1000;

        let frees: Vec<PageNumber> = (1..=(cap() as u64 + 1)).collect();
        let rewrite = plan(&mut fs, 1, &frees, &mut next_page).unwrap();
        fs.install(rewrite);

        // Drain almost everything so the chain shrinks to one section; the
        // surplus section page must come back as a free entry, recorded
        // only once the rewrite completed.
        let taken = fs.try_allocate(cap() as u64, Some(2)).unwrap();
        assert_eq!(taken.len(), cap());

        let rewrite = plan(&mut fs, 3, &[], &mut next_page).unwrap();
        assert_eq!(rewrite.pages.len(), 1);
        assert!(rewrite.entry_count >= 2, "surplus section page plus leftover");
        fs.install(rewrite);

        // The freed section page (1001) is now itself reusable.
        assert!(fs.contains(1001));
    }

    #[test]
    fn rebuild_roundtrip_through_data_file() {
        let dir = tempdir().unwrap();
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        let mut fs = FreeSpaceHandling::new(PAGE);
        let mut next_page: PageNumber = 50;
        let frees: Vec<PageNumber> = (1..=(cap() as u64 + 3)).collect();
        let rewrite = plan(&mut fs, 7, &frees, &mut next_page).unwrap();

        data.grow(next_page).unwrap();
        for (page, bytes) in &rewrite.pages {
            data.page_mut(*page).unwrap().copy_from_slice(bytes);
        }

        let head = rewrite.head;
        let count = rewrite.entry_count;
        fs.install(rewrite);

        let mut rebuilt = FreeSpaceHandling::new(PAGE);
        rebuilt.rebuild(&data, head, count).unwrap();

        assert_eq!(rebuilt.free_count(), fs.free_count());
        assert_eq!(rebuilt.head_page(), fs.head_page());
        for page in 1..=(cap() as u64 + 3) {
            assert!(rebuilt.contains(page));
        }
    }

    #[test]
    fn rebuild_rejects_count_mismatch() {
        let dir = tempdir().unwrap();
        let data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        let mut fs = FreeSpaceHandling::new(PAGE);
        let result = fs.rebuild(&data, 0, 5);

        assert!(result.is_err());
    }
}
