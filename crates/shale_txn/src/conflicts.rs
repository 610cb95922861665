//! Write-write conflict detection.
//!
//! Two rules make `register_write` fail:
//! 1. another active transaction currently owns the key, or
//! 2. a transaction committed a write to the key after the caller's
//!    snapshot was taken (first-committer-wins OCC).
//!
//! The committed-writes table is pruned at the min-active-snapshot
//! safepoint: once no snapshot can predate a commit, that commit can no
//! longer conflict with anyone.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

/// Prune the committed-writes table every this many commits.
const PRUNE_EVERY_COMMITS: u64 = 128;

pub struct ConflictTracker {
    /// key → id of the active transaction that registered it.
    active_owners: DashMap<Vec<u8>, u64>,
    /// key → sequence number of the newest commit that wrote it.
    committed_writes: DashMap<Vec<u8>, u64>,
    next_txn_id: AtomicU64,
    commits: AtomicU64,
    /// Serializes commit application so counter folds and batch applies
    /// land in the same order.
    commit_lock: Mutex<()>,
}

impl Default for ConflictTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self {
            active_owners: DashMap::new(),
            committed_writes: DashMap::new(),
            next_txn_id: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn allocate_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Try to claim `key` for `txn_id`. Returns false on conflict.
    pub fn register_write(&self, key: &[u8], txn_id: u64, snapshot_seq: u64) -> bool {
        if let Some(commit_seq) = self.committed_writes.get(key) {
            if *commit_seq > snapshot_seq {
                tracing::trace!(
                    commit_seq = *commit_seq,
                    snapshot_seq,
                    "write conflict: key committed past caller snapshot"
                );
                return false;
            }
        }
        match self.active_owners.entry(key.to_vec()) {
            Entry::Occupied(entry) => *entry.get() == txn_id,
            Entry::Vacant(entry) => {
                entry.insert(txn_id);
                true
            }
        }
    }

    /// Release ownership of `keys` and remember them as committed at
    /// `commit_seq` for later-snapshot conflict checks.
    pub fn record_commit(&self, txn_id: u64, keys: &[Vec<u8>], commit_seq: u64, safepoint: u64) {
        for key in keys {
            self.committed_writes.insert(key.clone(), commit_seq);
            self.active_owners
                .remove_if(key.as_slice(), |_, owner| *owner == txn_id);
        }
        if self.commits.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY_COMMITS
            == PRUNE_EVERY_COMMITS - 1
        {
            self.committed_writes.retain(|_, seq| *seq >= safepoint);
        }
    }

    /// Release ownership without recording a commit (rollback path).
    pub fn release(&self, txn_id: u64, keys: &[Vec<u8>]) {
        for key in keys {
            self.active_owners
                .remove_if(key.as_slice(), |_, owner| *owner == txn_id);
        }
    }

    /// Taken for the duration of a commit's fold-and-apply step.
    pub fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    pub fn active_key_count(&self) -> usize {
        self.active_owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_owner_conflict() {
        let tracker = ConflictTracker::new();
        let a = tracker.allocate_txn_id();
        let b = tracker.allocate_txn_id();

        assert!(tracker.register_write(b"k", a, 10));
        // Re-registering your own key is fine.
        assert!(tracker.register_write(b"k", a, 10));
        // Someone else's key is not.
        assert!(!tracker.register_write(b"k", b, 10));

        tracker.release(a, &[b"k".to_vec()]);
        assert!(tracker.register_write(b"k", b, 10));
    }

    #[test]
    fn test_committed_write_conflicts_with_older_snapshot() {
        let tracker = ConflictTracker::new();
        let a = tracker.allocate_txn_id();
        let b = tracker.allocate_txn_id();

        assert!(tracker.register_write(b"k", a, 5));
        tracker.record_commit(a, &[b"k".to_vec()], 7, 0);

        // b's snapshot (5) predates a's commit (7): conflict.
        assert!(!tracker.register_write(b"k", b, 5));
        // A snapshot taken after the commit is fine.
        assert!(tracker.register_write(b"k", b, 7));
    }
}
