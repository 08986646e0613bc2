//! # Backup / Restore
//!
//! Streams a consistent image of the store (full) or the journal
//! segments produced since the previous backup (incremental) to an
//! external destination, and rebuilds a store from such archives.
//!
//! ## Archive Format
//!
//! ```text
//! +---------------------+-----------------+------------------+
//! | ArchiveHeader (40)  | payload         | CRC-64 trailer   |
//! +---------------------+-----------------+------------------+
//! ```
//!
//! A full archive's payload is the raw data file; an incremental
//! archive's payload is a sequence of `(seq u64, len u64, bytes)` journal
//! segment records in production order. Restore validates magic, version
//! and checksum before the target becomes openable, and replays
//! incremental segments strictly in order.
//!
//! ## Copy Discipline
//!
//! Copies run in bounded chunks drawn from an explicit [`CopyBufferPool`]
//! (no per-call allocation, no thread-local globals). After every chunk
//! the progress callback receives cumulative bytes; before every chunk
//! write the cancellation token is checked, so an abort stops within one
//! chunk boundary. Cancellation is an outcome, not an error — the caller
//! must discard the partial destination either way.
//!
//! ## Consistency
//!
//! A full backup flushes first and then holds the flush section for the
//! duration of the copy: the data file cannot change underneath it, while
//! read transactions proceed untouched. An incremental backup captures
//! sealed segments; the anchor is the previous backup in the same engine
//! instance (recovery consumes segments, so after a restart the first
//! backup must be full again).

mod status;

pub use status::{BackupPhase, BackupStatus};

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{ARCHIVE_HEADER_SIZE, BACKUP_CHUNK_SIZE, BACKUP_STATUS_DOCUMENT_NAME, DATA_FILE_NAME};
use crate::engine::Engine;
use crate::journal::{self, SealedSegment};
use crate::storage::DataFile;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const ARCHIVE_MAGIC: [u8; 8] = *b"STRATBAK";
pub const ARCHIVE_VERSION: u32 = 1;

const KIND_FULL: u32 = 1;
const KIND_INCREMENTAL: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ArchiveHeader {
    magic: [u8; 8],
    version: u32,
    kind: u32,
    page_size: u32,
    _reserved: u32,
    payload_len: u64,
    item_count: u64,
}

/// Cooperative cancellation signal, checked at chunk granularity.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// How a backup ended. A canceled backup is not an error, but its
/// destination is incomplete and must be discarded by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Completed { bytes_copied: u64 },
    Canceled { bytes_copied: u64 },
}

/// Reusable copy buffers, sized to the backup chunk size. Checked out at
/// the start of a copy and returned at the end.
pub struct CopyBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl CopyBufferPool {
    pub fn new(buf_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() == self.buf_size {
            self.buffers.lock().push(buf);
        }
    }
}

impl Engine {
    /// Streams a backup to `dest`. Full backups flush first and copy the
    /// quiesced data file; incremental backups copy the journal segments
    /// sealed since the previous backup of this engine instance.
    pub fn backup<W, F>(
        &self,
        dest: &mut W,
        incremental: bool,
        mut progress: F,
        token: &CancellationToken,
    ) -> Result<BackupOutcome>
    where
        W: Write,
        F: FnMut(u64),
    {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");

        if incremental {
            self.backup_incremental(dest, &mut progress, token)
        } else {
            self.backup_full(dest, &mut progress, token)
        }
    }

    fn backup_full<W: Write>(
        &self,
        dest: &mut W,
        progress: &mut dyn FnMut(u64),
        token: &CancellationToken,
    ) -> Result<BackupOutcome> {
        self.flush_log_to_data_file()?;

        // Holding the flush section keeps the data file image stable for
        // the whole copy; readers are unaffected.
        let _flush = self.flush_lock.lock();
        let data = self.data.read();

        let page_size = data.page_size();
        let page_count = data.page_count();
        let payload_len = page_count * page_size as u64;

        let header = ArchiveHeader {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            kind: KIND_FULL,
            page_size: page_size as u32,
            _reserved: 0,
            payload_len,
            item_count: page_count,
        };
        dest.write_all(header.as_bytes())
            .wrap_err("failed to write backup archive header")?;

        let mut buf = self.copy_buffers.acquire();
        let chunk_pages = (buf.len() / page_size).max(1) as u64;
        let mut digest = CRC64.digest();
        let mut copied = 0u64;

        let mut page = 0u64;
        while page < page_count {
            let in_chunk = chunk_pages.min(page_count - page);
            data.prefetch_pages(page, in_chunk);

            let chunk_len = in_chunk as usize * page_size;
            for i in 0..in_chunk {
                let image = data.page(page + i)?;
                buf[i as usize * page_size..(i as usize + 1) * page_size].copy_from_slice(image);
            }

            if token.is_canceled() {
                self.copy_buffers.release(buf);
                return Ok(BackupOutcome::Canceled {
                    bytes_copied: copied,
                });
            }

            if let Err(e) = dest.write_all(&buf[..chunk_len]) {
                self.copy_buffers.release(buf);
                return Err(e).wrap_err("failed to write backup chunk");
            }
            digest.update(&buf[..chunk_len]);
            copied += chunk_len as u64;
            progress(copied);

            page += in_chunk;
        }
        self.copy_buffers.release(buf);

        dest.write_all(&digest.finalize().to_le_bytes())
            .wrap_err("failed to write backup checksum trailer")?;

        // The full image covers everything the retained (flushed)
        // segments held; sealed-but-unflushed segments stay for the next
        // incremental.
        {
            let mut state = self.backup.lock();
            let covered = state
                .retained
                .iter()
                .map(|s| s.seq)
                .max()
                .unwrap_or(state.last_backup_seq);
            for seg in state.retained.drain(..) {
                std::fs::remove_file(&seg.path).wrap_err_with(|| {
                    format!("failed to remove journal segment {:?} after full backup", seg.path)
                })?;
            }
            state.last_backup_seq = state.last_backup_seq.max(covered);
            state.anchored = true;
        }

        Ok(BackupOutcome::Completed {
            bytes_copied: copied,
        })
    }

    fn backup_incremental<W: Write>(
        &self,
        dest: &mut W,
        progress: &mut dyn FnMut(u64),
        token: &CancellationToken,
    ) -> Result<BackupOutcome> {
        ensure!(
            self.options.incremental_backup_enabled,
            "incremental backup requires incremental_backup_enabled"
        );

        let _flush = self.flush_lock.lock();
        self.journal.lock().seal_current()?;

        let mut segments = {
            let journal = self.journal.lock();
            let state = self.backup.lock();
            ensure!(
                state.anchored,
                "no prior backup anchors the incremental chain; take a full backup first"
            );

            let since = state.last_backup_seq;
            let mut segments: Vec<SealedSegment> = state
                .retained
                .iter()
                .filter(|s| s.seq > since)
                .cloned()
                .collect();
            segments.extend(journal.sealed().iter().filter(|s| s.seq > since).cloned());
            segments
        };
        segments.sort_by_key(|s| s.seq);

        let payload_len: u64 = segments.iter().map(|s| 16 + s.size).sum();
        let header = ArchiveHeader {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            kind: KIND_INCREMENTAL,
            page_size: self.page_size() as u32,
            _reserved: 0,
            payload_len,
            item_count: segments.len() as u64,
        };
        dest.write_all(header.as_bytes())
            .wrap_err("failed to write backup archive header")?;

        let mut buf = self.copy_buffers.acquire();
        let mut digest = CRC64.digest();
        let mut copied = 0u64;

        for seg in &segments {
            let mut record = [0u8; 16];
            record[..8].copy_from_slice(&seg.seq.to_le_bytes());
            record[8..].copy_from_slice(&seg.size.to_le_bytes());

            if token.is_canceled() {
                self.copy_buffers.release(buf);
                return Ok(BackupOutcome::Canceled {
                    bytes_copied: copied,
                });
            }
            dest.write_all(&record)
                .wrap_err("failed to write segment record header")?;
            digest.update(&record);
            copied += 16;

            let mut file = std::fs::File::open(&seg.path)
                .wrap_err_with(|| format!("failed to open journal segment {:?}", seg.path))?;
            let mut remaining = seg.size;
            while remaining > 0 {
                let want = (buf.len() as u64).min(remaining) as usize;
                file.read_exact(&mut buf[..want]).wrap_err_with(|| {
                    format!("failed to read journal segment {:?}", seg.path)
                })?;

                if token.is_canceled() {
                    self.copy_buffers.release(buf);
                    return Ok(BackupOutcome::Canceled {
                        bytes_copied: copied,
                    });
                }
                dest.write_all(&buf[..want])
                    .wrap_err("failed to write backup chunk")?;
                digest.update(&buf[..want]);
                copied += want as u64;
                remaining -= want as u64;
                progress(copied);
            }
        }
        self.copy_buffers.release(buf);

        dest.write_all(&digest.finalize().to_le_bytes())
            .wrap_err("failed to write backup checksum trailer")?;

        // Consumed retained segments are no longer needed once captured.
        if let Some(max_seq) = segments.iter().map(|s| s.seq).max() {
            let mut state = self.backup.lock();
            state.last_backup_seq = max_seq;
            let mut kept = Vec::new();
            for seg in state.retained.drain(..) {
                if seg.seq <= max_seq {
                    std::fs::remove_file(&seg.path).wrap_err_with(|| {
                        format!("failed to remove backed-up journal segment {:?}", seg.path)
                    })?;
                } else {
                    kept.push(seg);
                }
            }
            state.retained = kept;
        }

        Ok(BackupOutcome::Completed {
            bytes_copied: copied,
        })
    }

    /// Initiates a backup on a worker thread and persists the status
    /// document (`backup.status`) through its lifecycle so progress and
    /// outcome can be polled. Returns the cancellation token controlling
    /// the run.
    pub fn start_backup(
        self: &Arc<Self>,
        location: impl AsRef<Path>,
        incremental: bool,
        metadata: Option<String>,
    ) -> Result<CancellationToken> {
        ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");

        let location: PathBuf = location.as_ref().to_path_buf();
        let status_path = self.dir.join(BACKUP_STATUS_DOCUMENT_NAME);

        {
            let mut state = self.backup.lock();
            if let Some(worker) = &state.worker {
                ensure!(worker.is_finished(), "a backup is already running");
            }
            if let Some(worker) = state.worker.take() {
                let _ = worker.join();
            }
        }

        let status = BackupStatus::in_progress(
            incremental,
            location.display().to_string(),
            metadata,
        );
        status.persist(&status_path)?;

        let engine = Arc::clone(self);
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let worker = std::thread::Builder::new()
            .name("strata-backup".into())
            .spawn(move || {
                let mut live_status = status.clone();
                let mut last_persisted = 0u64;

                let result = (|| -> Result<BackupOutcome> {
                    let mut dest = std::fs::File::create(&location).wrap_err_with(|| {
                        format!("failed to create backup destination '{}'", location.display())
                    })?;
                    let outcome = engine.backup(
                        &mut dest,
                        incremental,
                        |bytes| {
                            live_status.bytes_copied = bytes;
                            if bytes.saturating_sub(last_persisted) >= 1024 * 1024 {
                                let _ = live_status.persist(&status_path);
                                last_persisted = bytes;
                            }
                        },
                        &worker_token,
                    )?;
                    dest.sync_all()
                        .wrap_err("failed to sync backup destination")?;
                    Ok(outcome)
                })();

                let final_status = match result {
                    Ok(BackupOutcome::Completed { bytes_copied }) => status.completed(bytes_copied),
                    Ok(BackupOutcome::Canceled { bytes_copied }) => status.canceled(bytes_copied),
                    Err(e) => status.failed(format!("{e:#}")),
                };
                let _ = final_status.persist(&status_path);
            })
            .wrap_err("failed to spawn backup worker")?;

        self.backup.lock().worker = Some(worker);
        Ok(token)
    }

    /// The persisted status of the most recent `start_backup` run, if any.
    pub fn backup_status(&self) -> Result<Option<BackupStatus>> {
        let path = self.dir.join(BACKUP_STATUS_DOCUMENT_NAME);
        if !path.exists() {
            return Ok(None);
        }
        BackupStatus::load(&path).map(Some)
    }

    /// Rebuilds a store from a full archive, creating `target_dir`'s data
    /// file. The archive is checksum-validated; a corrupt stream leaves
    /// no data file behind.
    pub fn restore(archive: &mut dyn Read, target_dir: &Path) -> Result<()> {
        let header = read_archive_header(archive)?;
        ensure!(
            header.kind == KIND_FULL,
            "expected a full backup archive (apply incremental archives with restore_incremental)"
        );

        let page_size = header.page_size as usize;
        ensure!(
            header.payload_len % page_size as u64 == 0 && header.payload_len > 0,
            "full archive payload {} is not page-aligned",
            header.payload_len
        );

        std::fs::create_dir_all(target_dir)
            .wrap_err_with(|| format!("failed to create restore directory {:?}", target_dir))?;
        let data_path = target_dir.join(DATA_FILE_NAME);
        ensure!(
            !data_path.exists(),
            "refusing to restore over existing data file '{}'",
            data_path.display()
        );

        let result = (|| -> Result<()> {
            let mut file = std::fs::File::create(&data_path)
                .wrap_err("failed to create restored data file")?;

            let mut buf = vec![0u8; BACKUP_CHUNK_SIZE];
            let mut digest = CRC64.digest();
            let mut remaining = header.payload_len;
            while remaining > 0 {
                let want = (buf.len() as u64).min(remaining) as usize;
                archive
                    .read_exact(&mut buf[..want])
                    .wrap_err("backup archive truncated")?;
                digest.update(&buf[..want]);
                file.write_all(&buf[..want])
                    .wrap_err("failed to write restored data file")?;
                remaining -= want as u64;
            }

            verify_trailer(archive, digest.finalize())?;
            file.sync_all().wrap_err("failed to sync restored data file")?;

            // The restored image must carry a valid header of the same
            // page size before the store is considered openable.
            let data = DataFile::open(&data_path)?;
            ensure!(
                data.page_size() == page_size,
                "restored data file page size {} does not match archive header {}",
                data.page_size(),
                page_size
            );
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
        }
        result
    }

    /// Applies one incremental archive onto a previously restored store.
    /// Archives must be applied in the exact order they were produced;
    /// the whole payload is validated before any page is touched.
    pub fn restore_incremental(archive: &mut dyn Read, target_dir: &Path) -> Result<()> {
        let header = read_archive_header(archive)?;
        ensure!(
            header.kind == KIND_INCREMENTAL,
            "expected an incremental backup archive"
        );

        let mut payload = vec![0u8; header.payload_len as usize];
        archive
            .read_exact(&mut payload)
            .wrap_err("backup archive truncated")?;

        let mut digest = CRC64.digest();
        digest.update(&payload);
        verify_trailer(archive, digest.finalize())?;

        let data_path = target_dir.join(DATA_FILE_NAME);
        let mut data = DataFile::open(&data_path)
            .wrap_err("incremental restore requires a previously restored data file")?;
        ensure!(
            data.page_size() == header.page_size as usize,
            "archive page size {} does not match restored store {}",
            header.page_size,
            data.page_size()
        );

        let mut off = 0usize;
        let mut last_seq = 0u64;
        for _ in 0..header.item_count {
            ensure!(
                payload.len() - off >= 16,
                "incremental archive payload truncated"
            );
            let seq = u64::from_le_bytes(payload[off..off + 8].try_into().expect("8 bytes"));
            let len =
                u64::from_le_bytes(payload[off + 8..off + 16].try_into().expect("8 bytes"));
            off += 16;

            ensure!(
                seq > last_seq,
                "incremental archive segments out of order ({} after {})",
                seq,
                last_seq
            );
            last_seq = seq;

            ensure!(
                payload.len() - off >= len as usize,
                "incremental archive payload truncated"
            );
            let replay =
                journal::apply_segment_bytes(&payload[off..off + len as usize], &mut data, true)?;
            ensure!(
                !replay.truncated,
                "incremental archive contains a torn journal segment"
            );
            off += len as usize;

            // Keep the header in step with the replayed state so the
            // store opens at the right next-page/free-space values.
            if let Some((txn, next_page, free_head, free_count)) = replay.last_state {
                let mut file_header = data.header()?;
                file_header.next_page_number = next_page;
                file_header.free_head_page = free_head;
                file_header.free_entry_count = free_count;
                file_header.last_flushed_txn = txn;
                data.write_header(&file_header)?;
            }
        }
        ensure!(off == payload.len(), "incremental archive has trailing bytes");

        data.sync().wrap_err("failed to sync restored data file")?;
        Ok(())
    }
}

fn read_archive_header(archive: &mut dyn Read) -> Result<ArchiveHeader> {
    let mut bytes = [0u8; ARCHIVE_HEADER_SIZE];
    archive
        .read_exact(&mut bytes)
        .wrap_err("backup archive too short for header")?;

    let header = ArchiveHeader::read_from_bytes(&bytes)
        .map_err(|e| eyre::eyre!("invalid backup archive header: {:?}", e))?;

    ensure!(
        header.magic == ARCHIVE_MAGIC,
        "bad magic in backup archive: {:02x?}",
        header.magic
    );
    ensure!(
        header.version == ARCHIVE_VERSION,
        "unsupported backup archive version {}",
        header.version
    );

    Ok(header)
}

fn verify_trailer(archive: &mut dyn Read, computed: u64) -> Result<()> {
    let mut trailer = [0u8; 8];
    archive
        .read_exact(&mut trailer)
        .wrap_err("backup archive missing checksum trailer")?;

    if u64::from_le_bytes(trailer) != computed {
        bail!("backup archive checksum mismatch; the archive is corrupt or incomplete");
    }
    Ok(())
}
