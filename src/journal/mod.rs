//! # Journal
//!
//! Durable, sequential record of committed transactions. Commit appends
//! one record — header plus a full copy of every dirty page — to the
//! active segment and fsyncs before the transaction becomes visible, so
//! the scratch pool can stay volatile: anything staged but not yet
//! flushed is reconstructible from here after a crash.
//!
//! ## Segments
//!
//! ```text
//! engine_dir/journal/
//! ├── journal.000001       # sealed (full) segment
//! ├── journal.000002       # sealed segment
//! └── journal.000003       # current active segment
//! ```
//!
//! Segments rotate once the active one passes the configured size. Sealed
//! segments are retired by flush when every transaction they contain has
//! been applied to the data file — deleted, or handed to incremental
//! backup when that is enabled.
//!
//! ## Record Format
//!
//! ```text
//! +----------------------+--------------------------------------+
//! | TxnRecordHeader (48) | page_count × (page_no u64 + page)    |
//! +----------------------+--------------------------------------+
//! ```
//!
//! The header carries the transaction id, the post-transaction next page
//! number and free-space head/count (so recovery can reconstruct engine
//! state without trusting the possibly-stale file header), and a CRC-64
//! over the header fields and every frame.
//!
//! ## Recovery
//!
//! On open the segment files are replayed in sequence order. A record
//! with a bad magic, short body, or mismatched checksum marks the torn
//! tail of the log: it and everything after it is discarded — those
//! transactions never reached their commit fsync. Replay applies full
//! page images, so it is idempotent.

mod flush;

pub use flush::FlushOutcome;

use std::collections::BTreeMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{PAGE_FRAME_PREFIX_SIZE, TXN_RECORD_HEADER_SIZE};
use crate::storage::{DataFile, PageNumber};
use crate::txn::TxnId;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const RECORD_MAGIC: u32 = 0x4A52_5453; // "STRJ"

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TxnRecordHeader {
    pub magic: u32,
    pub page_count: u32,
    pub txn_id: u64,
    pub next_page_number: u64,
    pub free_head_page: u64,
    pub free_entry_count: u64,
    pub checksum: u64,
}

fn compute_record_checksum(
    header: &TxnRecordHeader,
    pages: &BTreeMap<PageNumber, Vec<u8>>,
) -> u64 {
    let mut digest = CRC64.digest();

    digest.update(&header.txn_id.to_le_bytes());
    digest.update(&header.page_count.to_le_bytes());
    digest.update(&header.next_page_number.to_le_bytes());
    digest.update(&header.free_head_page.to_le_bytes());
    digest.update(&header.free_entry_count.to_le_bytes());

    for (page, bytes) in pages {
        digest.update(&page.to_le_bytes());
        digest.update(bytes);
    }

    digest.finalize()
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("journal.{:06}", seq))
}

fn segment_seq(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("journal.")?
        .parse()
        .ok()
}

/// A rotated-out segment awaiting retirement.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub path: PathBuf,
    pub seq: u64,
    pub max_txn: TxnId,
    pub size: u64,
}

struct ActiveSegment {
    file: File,
    path: PathBuf,
    seq: u64,
    offset: u64,
    max_txn: TxnId,
    records: u64,
}

impl ActiveSegment {
    fn create(dir: &Path, seq: u64) -> Result<Self> {
        let path = segment_path(dir, seq);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create journal segment at {:?}", path))?;

        Ok(Self {
            file,
            path,
            seq,
            offset: 0,
            max_txn: 0,
            records: 0,
        })
    }
}

pub struct Journal {
    dir: PathBuf,
    page_size: usize,
    max_segment_size: u64,
    current: ActiveSegment,
    sealed: Vec<SealedSegment>,
    next_seq: u64,
}

impl Journal {
    /// Opens a fresh journal. Recovery (and deletion of old segments) must
    /// have happened first; `start_seq` continues the sequence numbering
    /// past anything a previous incarnation produced.
    pub fn open(
        dir: &Path,
        page_size: usize,
        max_segment_size: u64,
        start_seq: u64,
    ) -> Result<Self> {
        create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create journal directory at {:?}", dir))?;

        let current = ActiveSegment::create(dir, start_seq)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            max_segment_size,
            current,
            sealed: Vec::new(),
            next_seq: start_seq + 1,
        })
    }

    /// Appends one transaction record and fsyncs it. This is the commit's
    /// durability point: once this returns, the transaction survives a
    /// crash.
    pub fn append_txn(
        &mut self,
        txn_id: TxnId,
        next_page_number: PageNumber,
        free_head_page: PageNumber,
        free_entry_count: u64,
        pages: &BTreeMap<PageNumber, Vec<u8>>,
    ) -> Result<()> {
        for (page, bytes) in pages {
            ensure!(
                bytes.len() == self.page_size,
                "journal frame for page {} must be exactly {} bytes, got {}",
                page,
                self.page_size,
                bytes.len()
            );
        }

        let mut header = TxnRecordHeader {
            magic: RECORD_MAGIC,
            page_count: pages.len() as u32,
            txn_id,
            next_page_number,
            free_head_page,
            free_entry_count,
            checksum: 0,
        };
        header.checksum = compute_record_checksum(&header, pages);

        let record_len =
            TXN_RECORD_HEADER_SIZE + pages.len() * (PAGE_FRAME_PREFIX_SIZE + self.page_size);
        let mut buf = Vec::with_capacity(record_len);
        buf.extend_from_slice(header.as_bytes());
        for (page, bytes) in pages {
            buf.extend_from_slice(&page.to_le_bytes());
            buf.extend_from_slice(bytes);
        }

        use std::io::Write;
        self.current
            .file
            .write_all(&buf)
            .wrap_err("failed to write journal record")?;
        self.current
            .file
            .sync_all()
            .wrap_err("failed to sync journal record")?;

        self.current.offset += buf.len() as u64;
        self.current.max_txn = txn_id;
        self.current.records += 1;

        if self.current.offset >= self.max_segment_size {
            self.rotate()?;
        }

        Ok(())
    }

    /// Seals the active segment (if it holds records) so its contents can
    /// be retired or backed up.
    pub fn seal_current(&mut self) -> Result<()> {
        if self.current.records > 0 {
            self.rotate()?;
        }
        Ok(())
    }

    /// Removes from the journal's bookkeeping every sealed segment whose
    /// transactions are all at or before `bound`, sealing the active
    /// segment first when it qualifies. The caller decides whether the
    /// returned segments are deleted or retained for incremental backup.
    pub fn retire_applied(&mut self, bound: TxnId) -> Result<Vec<SealedSegment>> {
        if self.current.records > 0 && self.current.max_txn <= bound {
            self.rotate()?;
        }

        let (retire, keep): (Vec<_>, Vec<_>) =
            self.sealed.drain(..).partition(|s| s.max_txn <= bound);
        self.sealed = keep;

        Ok(retire)
    }

    pub fn sealed(&self) -> &[SealedSegment] {
        &self.sealed
    }

    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    pub fn current_seq(&self) -> u64 {
        self.current.seq
    }

    fn rotate(&mut self) -> Result<()> {
        let next = ActiveSegment::create(&self.dir, self.next_seq)?;
        self.next_seq += 1;

        let old = std::mem::replace(&mut self.current, next);
        self.sealed.push(SealedSegment {
            path: old.path,
            seq: old.seq,
            max_txn: old.max_txn,
            size: old.offset,
        });

        Ok(())
    }
}

/// Aggregate result of replaying journal bytes into a data file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentReplay {
    pub txns_applied: u64,
    pub pages_applied: u64,
    /// State carried by the last valid record, if any:
    /// (txn id, next page number, free head page, free entry count).
    pub last_state: Option<(TxnId, PageNumber, PageNumber, u64)>,
    /// Whether replay stopped at a torn or corrupt record.
    pub truncated: bool,
}

/// Replays one segment's bytes. With `strict` set, a torn or corrupt
/// record is an error (restore); otherwise it marks the end of the log
/// (crash recovery).
pub fn apply_segment_bytes(
    bytes: &[u8],
    data: &mut DataFile,
    strict: bool,
) -> Result<SegmentReplay> {
    let page_size = data.page_size();
    let mut replay = SegmentReplay::default();
    let mut off = 0usize;

    while off < bytes.len() {
        if bytes.len() - off < TXN_RECORD_HEADER_SIZE {
            replay.truncated = true;
            break;
        }

        let (header, _) = TxnRecordHeader::read_from_prefix(&bytes[off..])
            .map_err(|e| eyre::eyre!("invalid journal record header: {:?}", e))?;

        if header.magic != RECORD_MAGIC {
            replay.truncated = true;
            break;
        }

        let frames_len = header.page_count as usize * (PAGE_FRAME_PREFIX_SIZE + page_size);
        if bytes.len() - off - TXN_RECORD_HEADER_SIZE < frames_len {
            replay.truncated = true;
            break;
        }

        let frames = &bytes[off + TXN_RECORD_HEADER_SIZE..off + TXN_RECORD_HEADER_SIZE + frames_len];
        if !verify_frames_checksum(&header, frames, page_size) {
            replay.truncated = true;
            break;
        }

        data.grow(header.next_page_number)
            .wrap_err("failed to grow data file during journal replay")?;

        let mut frame_off = 0usize;
        for _ in 0..header.page_count {
            let page = u64::from_le_bytes(
                frames[frame_off..frame_off + 8]
                    .try_into()
                    .expect("slice is 8 bytes"),
            );
            let image = &frames[frame_off + 8..frame_off + 8 + page_size];
            data.page_mut(page)
                .wrap_err("journal record references a page past the recorded file size")?
                .copy_from_slice(image);
            frame_off += PAGE_FRAME_PREFIX_SIZE + page_size;
        }

        replay.txns_applied += 1;
        replay.pages_applied += header.page_count as u64;
        replay.last_state = Some((
            header.txn_id,
            header.next_page_number,
            header.free_head_page,
            header.free_entry_count,
        ));
        off += TXN_RECORD_HEADER_SIZE + frames_len;
    }

    if replay.truncated && strict {
        bail!("journal segment is torn or corrupt");
    }

    Ok(replay)
}

fn verify_frames_checksum(header: &TxnRecordHeader, frames: &[u8], page_size: usize) -> bool {
    let mut digest = CRC64.digest();

    digest.update(&header.txn_id.to_le_bytes());
    digest.update(&header.page_count.to_le_bytes());
    digest.update(&header.next_page_number.to_le_bytes());
    digest.update(&header.free_head_page.to_le_bytes());
    digest.update(&header.free_entry_count.to_le_bytes());

    let mut off = 0usize;
    for _ in 0..header.page_count {
        digest.update(&frames[off..off + 8]);
        digest.update(&frames[off + 8..off + 8 + page_size]);
        off += PAGE_FRAME_PREFIX_SIZE + page_size;
    }

    digest.finalize() == header.checksum
}

/// Outcome of replaying every journal segment on open.
#[derive(Debug, Default, Clone)]
pub struct RecoveryInfo {
    pub segments_scanned: usize,
    pub txns_replayed: u64,
    pub pages_replayed: u64,
    pub last_state: Option<(TxnId, PageNumber, PageNumber, u64)>,
    pub max_seq: u64,
    /// Replayed segment files, to be removed once the recovered state is
    /// persisted (see [`remove_segments`]).
    pub segment_paths: Vec<PathBuf>,
}

/// Replays all segments under `dir` into `data` in sequence order and
/// syncs. A torn record ends the replay — later segments cannot contain
/// valid commits. Segment files are left in place: the caller deletes
/// them with [`remove_segments`] only after persisting the recovered
/// file header, so a crash in between replays again instead of losing
/// state.
pub fn recover_dir(dir: &Path, data: &mut DataFile) -> Result<RecoveryInfo> {
    let mut info = RecoveryInfo::default();

    if !dir.exists() {
        return Ok(info);
    }

    let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to read journal directory {:?}", dir))?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            segment_seq(&path).map(|seq| (seq, path))
        })
        .collect();
    segments.sort_by_key(|&(seq, _)| seq);

    let mut torn = false;
    for (seq, path) in &segments {
        info.max_seq = info.max_seq.max(*seq);
        if torn {
            continue;
        }

        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read journal segment {:?}", path))?;
        let replay = apply_segment_bytes(&bytes, data, false)?;

        info.segments_scanned += 1;
        info.txns_replayed += replay.txns_applied;
        info.pages_replayed += replay.pages_applied;
        if replay.last_state.is_some() {
            info.last_state = replay.last_state;
        }
        torn = replay.truncated;
    }

    if info.txns_replayed > 0 {
        data.sync()
            .wrap_err("failed to sync data file after journal replay")?;
    }

    info.segment_paths = segments.into_iter().map(|(_, path)| path).collect();

    Ok(info)
}

/// Removes replayed segment files after the recovered state is durable.
pub fn remove_segments(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        std::fs::remove_file(path)
            .wrap_err_with(|| format!("failed to remove replayed journal segment {:?}", path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    fn pages_for(specs: &[(PageNumber, u8)]) -> BTreeMap<PageNumber, Vec<u8>> {
        specs
            .iter()
            .map(|&(page, fill)| (page, vec![fill; PAGE]))
            .collect()
    }

    #[test]
    fn record_header_size_matches_constant() {
        assert_eq!(size_of::<TxnRecordHeader>(), TXN_RECORD_HEADER_SIZE);
    }

    #[test]
    fn append_and_recover_roundtrip() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("journal");
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        {
            let mut journal = Journal::open(&journal_dir, PAGE, 1 << 20, 1).unwrap();
            journal
                .append_txn(1, 4, 0, 0, &pages_for(&[(1, 0xAA), (2, 0xBB)]))
                .unwrap();
            journal
                .append_txn(2, 6, 0, 0, &pages_for(&[(2, 0xCC), (5, 0xDD)]))
                .unwrap();
        }

        let info = recover_dir(&journal_dir, &mut data).unwrap();

        assert_eq!(info.txns_replayed, 2);
        assert_eq!(info.pages_replayed, 4);
        assert_eq!(info.last_state, Some((2, 6, 0, 0)));
        assert_eq!(data.page(1).unwrap()[0], 0xAA);
        assert_eq!(data.page(2).unwrap()[0], 0xCC);
        assert_eq!(data.page(5).unwrap()[0], 0xDD);

        // Once the caller removes the replayed segments, recovery is a
        // no-op.
        remove_segments(&info.segment_paths).unwrap();
        let info = recover_dir(&journal_dir, &mut data).unwrap();
        assert_eq!(info.txns_replayed, 0);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("journal");
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        {
            let mut journal = Journal::open(&journal_dir, PAGE, 1 << 20, 1).unwrap();
            journal
                .append_txn(1, 3, 0, 0, &pages_for(&[(1, 0x11)]))
                .unwrap();
            journal
                .append_txn(2, 3, 0, 0, &pages_for(&[(2, 0x22)]))
                .unwrap();
        }

        // Chop the second record in half: a crash mid-write.
        let seg = segment_path(&journal_dir, 1);
        let bytes = std::fs::read(&seg).unwrap();
        let one_record = TXN_RECORD_HEADER_SIZE + PAGE_FRAME_PREFIX_SIZE + PAGE;
        std::fs::write(&seg, &bytes[..one_record + 20]).unwrap();

        let info = recover_dir(&journal_dir, &mut data).unwrap();

        assert_eq!(info.txns_replayed, 1);
        assert_eq!(info.last_state, Some((1, 3, 0, 0)));
        assert_eq!(data.page(1).unwrap()[0], 0x11);
        assert_eq!(data.page(2).unwrap()[0], 0x00);
    }

    #[test]
    fn corrupt_checksum_ends_replay() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("journal");
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        {
            let mut journal = Journal::open(&journal_dir, PAGE, 1 << 20, 1).unwrap();
            journal
                .append_txn(1, 3, 0, 0, &pages_for(&[(1, 0x11)]))
                .unwrap();
        }

        let seg = segment_path(&journal_dir, 1);
        let mut bytes = std::fs::read(&seg).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&seg, &bytes).unwrap();

        let info = recover_dir(&journal_dir, &mut data).unwrap();
        assert_eq!(info.txns_replayed, 0);
        assert_eq!(data.page(1).unwrap()[0], 0x00);
    }

    #[test]
    fn rotation_seals_segments_and_retire_respects_bound() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("journal");

        // Tiny rotation threshold: every record seals a segment.
        let mut journal = Journal::open(&journal_dir, PAGE, 1, 1).unwrap();
        journal
            .append_txn(1, 3, 0, 0, &pages_for(&[(1, 0x01)]))
            .unwrap();
        journal
            .append_txn(2, 3, 0, 0, &pages_for(&[(2, 0x02)]))
            .unwrap();

        assert_eq!(journal.sealed().len(), 2);

        let retired = journal.retire_applied(1).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].max_txn, 1);
        assert_eq!(journal.sealed().len(), 1);

        let retired = journal.retire_applied(2).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(journal.sealed().is_empty());
    }

    #[test]
    fn strict_replay_rejects_torn_bytes() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("journal");
        let mut data = DataFile::create(dir.path().join("test.db"), PAGE, 1).unwrap();

        {
            let mut journal = Journal::open(&journal_dir, PAGE, 1 << 20, 1).unwrap();
            journal
                .append_txn(1, 3, 0, 0, &pages_for(&[(1, 0x11)]))
                .unwrap();
        }

        let bytes = std::fs::read(segment_path(&journal_dir, 1)).unwrap();
        let torn = &bytes[..bytes.len() - 10];

        assert!(apply_segment_bytes(torn, &mut data, true).is_err());
        assert!(apply_segment_bytes(torn, &mut data, false).is_ok());
    }
}
