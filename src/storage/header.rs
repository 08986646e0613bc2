//! On-disk file header layout.
//!
//! The first [`FILE_HEADER_SIZE`](crate::config::FILE_HEADER_SIZE) bytes of
//! page 0 describe the store: magic, format version, page size, the next
//! page number to assign, the head of the free-space section chain, and the
//! last transaction known to be durable in the data file itself. The header
//! is rewritten during flush; between flushes the journal carries the same
//! fields per transaction record so recovery can reconstruct them.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::FILE_HEADER_SIZE;

pub const FILE_MAGIC: [u8; 8] = *b"STRATA\0\0";
pub const FORMAT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub page_size: u32,
    pub next_page_number: u64,
    pub free_head_page: u64,
    pub free_entry_count: u64,
    pub last_flushed_txn: u64,
    _reserved: [u8; 16],
}

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            page_size,
            next_page_number: 1,
            free_head_page: 0,
            free_entry_count: 0,
            last_flushed_txn: 0,
            _reserved: [0; 16],
        }
    }

    pub fn parse(page0: &[u8]) -> Result<Self> {
        ensure!(
            page0.len() >= FILE_HEADER_SIZE,
            "page 0 too small for file header: {} bytes",
            page0.len()
        );

        let (header, _) = Self::read_from_prefix(page0)
            .map_err(|e| eyre::eyre!("invalid file header: {:?}", e))?;

        ensure!(
            header.magic == FILE_MAGIC,
            "bad magic in data file header: {:02x?}",
            header.magic
        );
        ensure!(
            header.version == FORMAT_VERSION,
            "unsupported data file format version {} (supported: {})",
            header.version,
            FORMAT_VERSION
        );

        Ok(header)
    }

    pub fn write_to(&self, page0: &mut [u8]) {
        page0[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn header_size_matches_constant() {
        assert_eq!(size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn header_roundtrip_through_page() {
        let mut header = FileHeader::new(8192);
        header.next_page_number = 42;
        header.free_head_page = 7;
        header.free_entry_count = 100;
        header.last_flushed_txn = 13;

        let mut page = vec![0u8; 8192];
        header.write_to(&mut page);

        let parsed = FileHeader::parse(&page).expect("should parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut page = vec![0u8; 8192];
        FileHeader::new(8192).write_to(&mut page);
        page[0] = b'X';

        let result = FileHeader::parse(&page);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("bad magic"));
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut header = FileHeader::new(8192);
        header.version = 99;

        let mut page = vec![0u8; 8192];
        header.write_to(&mut page);

        assert!(FileHeader::parse(&page).is_err());
    }
}
