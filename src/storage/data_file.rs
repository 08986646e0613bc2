//! # Memory-Mapped Data File
//!
//! `DataFile` owns the page-aligned store file and its memory map. It is
//! the only component that touches the data file's bytes; everything above
//! it deals in page numbers.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when the file is grown and
//! remapped. Rather than runtime guards or epochs, the borrow checker
//! enforces safety at compile time:
//!
//! ```text
//! page(&self) -> &[u8]              // Immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // Mutable borrow of self
//! grow(&mut self)                   // Mutable borrow (exclusive)
//! ```
//!
//! Since `grow()` requires `&mut self`, no page reference can exist when
//! the mapping is replaced.
//!
//! ## Page Size
//!
//! The page size is chosen at creation (power of two, at least
//! `MIN_PAGE_SIZE`), persisted in the file header, and validated on open.
//! The file length is always a multiple of the page size.
//!
//! ## Durability
//!
//! `sync()` issues an msync over the whole mapping. The engine calls it at
//! the end of a flush, after all staged pages have been copied into place;
//! the journal provides durability for everything committed since.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::header::FileHeader;
use super::PageNumber;
use crate::config::MIN_PAGE_SIZE;

#[derive(Debug)]
pub struct DataFile {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u64,
}

impl DataFile {
    /// Creates a new data file with the given page size and initial page
    /// count, and writes a fresh file header into page 0.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize, initial_pages: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE,
            "page size {} must be a power of two >= {}",
            page_size,
            MIN_PAGE_SIZE
        );
        ensure!(initial_pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file '{}'", path.display()))?;

        let file_size = initial_pages * page_size as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set data file size to {} bytes", file_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. We just created this file with exclusive access (truncate=true)
        // 2. The file size is a valid multiple of page_size
        // 3. The mmap lifetime is tied to DataFile, preventing use-after-unmap
        // 4. All access goes through page()/page_mut() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let mut data = Self {
            file,
            mmap,
            page_size,
            page_count: initial_pages,
        };

        let header = FileHeader::new(page_size as u32);
        header.write_to(data.page_mut(0)?);
        data.sync()?;

        Ok(data)
    }

    /// Opens an existing data file, validating the header and that the file
    /// length is page-aligned for the persisted page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size as usize >= MIN_PAGE_SIZE,
            "data file '{}' is too small ({} bytes) to hold a header",
            path.display(),
            file_size
        );

        // SAFETY: see create(); the file is opened read+write and all access
        // is bounds-checked against page_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::parse(&mmap)?;
        let page_size = header.page_size as usize;

        ensure!(
            file_size % page_size as u64 == 0,
            "data file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: file_size / page_size as u64,
        })
    }

    pub fn page(&self, page_no: PageNumber) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * self.page_size;
        Ok(&self.mmap[offset..offset + self.page_size])
    }

    pub fn page_mut(&mut self, page_no: PageNumber) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * self.page_size;
        Ok(&mut self.mmap[offset..offset + self.page_size])
    }

    /// Extends the file to `new_page_count` pages and remaps. A no-op when
    /// the file already has at least that many pages.
    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * self.page_size as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend data file to {} bytes", new_size))?;

        // SAFETY: grow() requires &mut self, so no page references exist;
        // the old mmap was flushed and is dropped when the new one is
        // assigned; the file was extended before remapping.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap data file after grow")?
        };

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync data file mmap")
    }

    pub fn header(&self) -> Result<FileHeader> {
        FileHeader::parse(self.page(0)?)
    }

    pub fn write_header(&mut self, header: &FileHeader) -> Result<()> {
        header.write_to(self.page_mut(0)?);
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * self.page_size as u64
    }

    /// Hints the kernel that a page range is about to be read sequentially.
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn prefetch_pages(&self, start_page: PageNumber, count: u64) {
        #[cfg(unix)]
        {
            if start_page >= self.page_count {
                return;
            }

            let end_page = (start_page + count).min(self.page_count);
            let start_offset = start_page as usize * self.page_size;
            let len = (end_page - start_page) as usize * self.page_size;

            // SAFETY: madvise with MADV_WILLNEED is a kernel hint; the range
            // is clamped to page_count above so it never exceeds the mapping.
            unsafe {
                libc::madvise(
                    self.mmap.as_ptr().add(start_offset) as *mut libc::c_void,
                    len,
                    libc::MADV_WILLNEED,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    #[test]
    fn create_writes_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let data = DataFile::create(&path, PAGE, 4).unwrap();

        assert_eq!(data.page_count(), 4);
        assert_eq!(data.page_size(), PAGE);

        let header = data.header().unwrap();
        assert_eq!(header.page_size as usize, PAGE);
        assert_eq!(header.next_page_number, 1);
    }

    #[test]
    fn create_rejects_bad_page_size() {
        let dir = tempdir().unwrap();

        assert!(DataFile::create(dir.path().join("a.db"), 300, 4).is_err());
        assert!(DataFile::create(dir.path().join("b.db"), 256, 4).is_err());
        assert!(DataFile::create(dir.path().join("c.db"), PAGE, 0).is_err());
    }

    #[test]
    fn open_validates_persisted_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut data = DataFile::create(&path, 1024, 3).unwrap();
            data.page_mut(2).unwrap()[0] = 0xAB;
            data.sync().unwrap();
        }

        let data = DataFile::open(&path).unwrap();
        assert_eq!(data.page_size(), 1024);
        assert_eq!(data.page_count(), 3);
        assert_eq!(data.page(2).unwrap()[0], 0xAB);
    }

    #[test]
    fn page_out_of_bounds() {
        let dir = tempdir().unwrap();
        let data = DataFile::create(dir.path().join("test.db"), PAGE, 5).unwrap();

        assert!(data.page(4).is_ok());
        assert!(data.page(5).is_err());
        assert!(data.page(100).is_err());
    }

    #[test]
    fn grow_extends_and_preserves() {
        let dir = tempdir().unwrap();
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 2).unwrap();

        data.page_mut(1).unwrap()[..2].copy_from_slice(&[0xCA, 0xFE]);
        data.grow(10).unwrap();

        assert_eq!(data.page_count(), 10);
        assert_eq!(data.file_size(), 10 * PAGE as u64);
        assert_eq!(&data.page(1).unwrap()[..2], &[0xCA, 0xFE]);

        data.grow(3).unwrap();
        assert_eq!(data.page_count(), 10);
    }

    #[test]
    fn sync_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut data = DataFile::create(&path, PAGE, 2).unwrap();
            data.page_mut(1).unwrap()[50] = 0xBE;
            data.sync().unwrap();
        }

        let data = DataFile::open(&path).unwrap();
        assert_eq!(data.page(1).unwrap()[50], 0xBE);
    }

    #[test]
    fn header_rewrite_roundtrip() {
        let dir = tempdir().unwrap();
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 2).unwrap();

        let mut header = data.header().unwrap();
        header.next_page_number = 17;
        header.free_head_page = 9;
        header.free_entry_count = 3;
        header.last_flushed_txn = 5;
        data.write_header(&header).unwrap();

        assert_eq!(data.header().unwrap(), header);
    }
}
