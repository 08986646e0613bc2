//! Persisted backup status document.
//!
//! `start_backup` runs on a worker thread; the status document, stored
//! under a well-known name in the engine directory, is how callers poll
//! progress and outcome. It is plain JSON so management tooling can read
//! it without linking the engine.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    InProgress,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub phase: BackupPhase,
    pub incremental: bool,
    pub destination: String,
    pub metadata: Option<String>,
    pub bytes_copied: u64,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub error: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl BackupStatus {
    pub fn in_progress(incremental: bool, destination: String, metadata: Option<String>) -> Self {
        Self {
            phase: BackupPhase::InProgress,
            incremental,
            destination,
            metadata,
            bytes_copied: 0,
            started_at_ms: now_ms(),
            finished_at_ms: None,
            error: None,
        }
    }

    pub fn completed(mut self, bytes_copied: u64) -> Self {
        self.phase = BackupPhase::Completed;
        self.bytes_copied = bytes_copied;
        self.finished_at_ms = Some(now_ms());
        self
    }

    pub fn canceled(mut self, bytes_copied: u64) -> Self {
        self.phase = BackupPhase::Canceled;
        self.bytes_copied = bytes_copied;
        self.finished_at_ms = Some(now_ms());
        self
    }

    pub fn failed(mut self, error: String) -> Self {
        self.phase = BackupPhase::Failed;
        self.error = Some(error);
        self.finished_at_ms = Some(now_ms());
        self
    }

    /// Writes the document atomically (write-then-rename) so concurrent
    /// pollers never observe a half-written file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).wrap_err("failed to serialize backup status")?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .wrap_err_with(|| format!("failed to write backup status document {:?}", tmp))?;
        std::fs::rename(&tmp, path)
            .wrap_err_with(|| format!("failed to publish backup status document {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read backup status document {:?}", path))?;
        serde_json::from_str(&json).wrap_err("failed to parse backup status document")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persist_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.status");

        let status = BackupStatus::in_progress(false, "/backups/full.strata".into(), None);
        status.persist(&path).unwrap();

        let loaded = BackupStatus::load(&path).unwrap();
        assert_eq!(loaded, status);
    }

    #[test]
    fn phase_transitions_stamp_finish_time() {
        let status = BackupStatus::in_progress(true, "dest".into(), Some("nightly".into()));
        assert!(status.finished_at_ms.is_none());

        let done = status.clone().completed(4096);
        assert_eq!(done.phase, BackupPhase::Completed);
        assert_eq!(done.bytes_copied, 4096);
        assert!(done.finished_at_ms.is_some());

        let failed = status.failed("disk on fire".into());
        assert_eq!(failed.phase, BackupPhase::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk on fire"));
    }
}
