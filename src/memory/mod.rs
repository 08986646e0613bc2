//! # Low-Memory Monitor
//!
//! On-demand host memory introspection for the components that grow
//! memory-backed structures: the scratch pool consults it before creating
//! a new region, and the flush policy treats memory pressure as a trigger.
//!
//! ## Design
//!
//! The monitor is a constructible service held by the engine as an
//! injected `Arc` — created at engine start, dropped at shutdown, no
//! process-wide statics. It is stateless apart from the `sysinfo` handle:
//! every query refreshes memory counters and produces a fresh snapshot.
//!
//! When the process runs inside a cgroup with a memory limit, the limit is
//! what matters, not the machine total; `sysinfo`'s cgroup view is
//! preferred when present.
//!
//! ## Failure Mode
//!
//! `assert_not_about_to_run_out_of_memory` fails fast with a typed
//! [`LowMemoryError`] when available memory falls below the configured
//! threshold. Callers about to allocate a large structure check this first
//! so the failure carries the culprit's context instead of an opaque OOM.

use eyre::{bail, Result};
use parking_lot::Mutex;
use sysinfo::System;

/// A point-in-time snapshot of host memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Total memory visible to this process (cgroup limit when present).
    pub total: u64,
    /// Memory still available for allocation.
    pub available: u64,
    /// Memory currently committed.
    pub committed: u64,
    /// Whether `available` is below the monitor's threshold.
    pub is_low_memory: bool,
}

/// Raised when an allocation is attempted under a violated safety margin.
#[derive(Debug)]
pub struct LowMemoryError {
    pub available: u64,
    pub threshold: u64,
}

impl std::fmt::Display for LowMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "available memory {} bytes is below the safety margin of {} bytes",
            self.available, self.threshold
        )
    }
}

impl std::error::Error for LowMemoryError {}

pub struct LowMemoryMonitor {
    sys: Mutex<System>,
    threshold: u64,
}

impl LowMemoryMonitor {
    /// `threshold` is the available-memory floor below which the monitor
    /// reports low memory.
    pub fn new(threshold: u64) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            threshold,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn get_memory_info(&self) -> MemoryInfo {
        let mut sys = self.sys.lock();
        sys.refresh_memory();

        let (total, available, committed) = match sys.cgroup_limits() {
            Some(limits) => (
                limits.total_memory,
                limits.free_memory,
                limits.total_memory.saturating_sub(limits.free_memory),
            ),
            None => (sys.total_memory(), sys.available_memory(), sys.used_memory()),
        };

        MemoryInfo {
            total,
            available,
            committed,
            is_low_memory: available < self.threshold,
        }
    }

    pub fn is_low_memory(&self) -> bool {
        self.get_memory_info().is_low_memory
    }

    /// Fails fast when the caller-defined safety margin is violated. A
    /// margin of 0 falls back to the monitor's own threshold.
    pub fn assert_not_about_to_run_out_of_memory(&self, margin: u64) -> Result<()> {
        let margin = if margin == 0 { self.threshold } else { margin };
        let info = self.get_memory_info();

        if info.available < margin {
            bail!(LowMemoryError {
                available: info.available,
                threshold: margin,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_internally_consistent() {
        let monitor = LowMemoryMonitor::new(1);
        let info = monitor.get_memory_info();

        assert!(info.total > 0);
        assert!(info.available <= info.total);
    }

    #[test]
    fn zero_threshold_never_reports_low_memory() {
        let monitor = LowMemoryMonitor::new(0);
        assert!(!monitor.is_low_memory());
    }

    #[test]
    fn impossible_margin_fails_fast() {
        let monitor = LowMemoryMonitor::new(1);
        let result = monitor.assert_not_about_to_run_out_of_memory(u64::MAX);

        assert!(result.is_err());
        let report = result.unwrap_err();
        assert!(report.downcast_ref::<LowMemoryError>().is_some());
    }

    #[test]
    fn sane_margin_passes() {
        let monitor = LowMemoryMonitor::new(1);
        assert!(monitor.assert_not_about_to_run_out_of_memory(1).is_ok());
    }
}
