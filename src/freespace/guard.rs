//! Re-entrancy guard for free-space mutations.
//!
//! The free-space index lives in pages of its own, so rewriting it can
//! itself free pages (a shrinking section chain). Letting that free run
//! through the normal path would re-enter the mutation in progress and
//! corrupt the chain mid-rewrite. The guard turns the recursive call into
//! data: while a mutation is in progress, frees are queued on a deferred
//! list and drained once the outer call has finished its structural
//! change.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::storage::PageNumber;

#[derive(Debug, Default)]
pub struct RecursiveCallGuard {
    in_progress: bool,
    deferred: SmallVec<[PageNumber; 8]>,
}

impl RecursiveCallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a structural mutation as in progress. Entering twice is a
    /// programming error: the caller must defer instead of recursing.
    pub fn enter(&mut self) -> Result<()> {
        if self.in_progress {
            bail!("free-space handling cannot be called recursively");
        }

        self.in_progress = true;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.in_progress
    }

    /// Queues a page freed while the mutation is in progress.
    pub fn defer(&mut self, page: PageNumber) {
        debug_assert!(self.in_progress, "defer outside an active mutation");
        self.deferred.push(page);
    }

    /// Drains the queued frees accumulated so far, leaving the guard
    /// active. The caller re-applies them and drains again until stable.
    pub fn take_deferred(&mut self) -> SmallVec<[PageNumber; 8]> {
        std::mem::take(&mut self.deferred)
    }

    pub fn exit(&mut self) {
        self.in_progress = false;
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_twice_fails_fast() {
        let mut guard = RecursiveCallGuard::new();

        guard.enter().unwrap();
        assert!(guard.enter().is_err());

        guard.exit();
        assert!(guard.enter().is_ok());
    }

    #[test]
    fn deferred_pages_drain_in_order() {
        let mut guard = RecursiveCallGuard::new();

        guard.enter().unwrap();
        guard.defer(10);
        guard.defer(20);

        let drained = guard.take_deferred();
        assert_eq!(drained.as_slice(), &[10, 20]);
        assert!(guard.take_deferred().is_empty());
        assert!(guard.is_active());

        guard.exit();
        assert!(!guard.is_active());
    }
}
