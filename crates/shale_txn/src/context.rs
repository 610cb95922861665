//! The per-operation transactional context.
//!
//! Every record-store operation runs against one `TransactionContext`: it
//! lazily pins an engine snapshot for reads, stages writes into a batch,
//! accumulates counter deltas, and carries commit/rollback hooks. Nothing
//! reaches the engine until `commit()` applies the batch atomically.
//!
//! The mutable state sits behind one mutex so cursors can hold shared
//! references to the context while the store stages writes through it.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use shale_common::{StoreError, StoreResult};
use shale_engine::batch::BatchOp;
use shale_engine::{KvEngine, Snapshot, WriteBatch};

use crate::conflicts::ConflictTracker;

/// A commit/rollback hook registered on a transaction.
///
/// Hooks run after the batch applies (commit, registration order) or when
/// the transaction rolls back (reverse registration order).
pub trait Change: Send {
    fn commit(&mut self);
    fn rollback(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

struct CounterDelta {
    amount: i64,
    cache: Arc<AtomicI64>,
}

struct TxnInner {
    snapshot: Option<Snapshot>,
    batch: WriteBatch,
    deltas: HashMap<Vec<u8>, CounterDelta>,
    changes: Vec<Box<dyn Change>>,
    registered_keys: Vec<Vec<u8>>,
    state: TxnState,
    exclusive: bool,
}

pub struct TransactionContext {
    engine: Arc<KvEngine>,
    conflicts: Arc<ConflictTracker>,
    txn_id: u64,
    killed: Arc<AtomicBool>,
    inner: Mutex<TxnInner>,
}

impl TransactionContext {
    pub fn new(engine: Arc<KvEngine>, conflicts: Arc<ConflictTracker>) -> Self {
        let txn_id = conflicts.allocate_txn_id();
        Self {
            engine,
            conflicts,
            txn_id,
            killed: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(TxnInner {
                snapshot: None,
                batch: WriteBatch::new(),
                deltas: HashMap::new(),
                changes: Vec::new(),
                registered_keys: Vec::new(),
                state: TxnState::Active,
                exclusive: false,
            }),
        }
    }

    /// A fresh context sharing this one's engine, conflict table, and
    /// interrupt flag. Used for the capped-deleter's private pass.
    pub fn spawn_child(&self) -> TransactionContext {
        let mut child = TransactionContext::new(Arc::clone(&self.engine), Arc::clone(&self.conflicts));
        child.killed = Arc::clone(&self.killed);
        child
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    // ── Snapshot handling ──────────────────────────────────────────────

    /// The context's snapshot, pinned on first use.
    pub fn snapshot(&self) -> Snapshot {
        let mut inner = self.inner.lock();
        inner
            .snapshot
            .get_or_insert_with(|| self.engine.snapshot())
            .clone()
    }

    pub fn has_snapshot(&self) -> bool {
        self.inner.lock().snapshot.is_some()
    }

    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot().sequence()
    }

    /// Drop the pinned snapshot; the next read pins a fresh one.
    pub fn renew_snapshot(&self) {
        self.inner.lock().snapshot = None;
    }

    // ── Reads and staged writes ────────────────────────────────────────

    /// Point read through the staged batch, then the snapshot.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.batch.latest_for(key) {
            return Ok(match op {
                BatchOp::Put { value, .. } => Some(value.clone()),
                BatchOp::Delete { .. } => None,
            });
        }
        let snapshot = inner
            .snapshot
            .get_or_insert_with(|| self.engine.snapshot())
            .clone();
        drop(inner);
        self.engine.get(&snapshot, key)
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.lock().batch.put(key, value);
    }

    pub fn delete(&self, key: Vec<u8>) {
        self.inner.lock().batch.delete(key);
    }

    /// Claim `key` for this transaction. False means a conflict: another
    /// active transaction owns it, or it was committed past our snapshot.
    pub fn register_write(&self, key: &[u8]) -> bool {
        let seq = self.snapshot_seq();
        if self.conflicts.register_write(key, self.txn_id, seq) {
            self.inner.lock().registered_keys.push(key.to_vec());
            true
        } else {
            false
        }
    }

    // ── Counter deltas ─────────────────────────────────────────────────

    /// Accumulate `amount` against the counter persisted under `key`,
    /// whose in-memory cache is `cache`. Folded in at commit.
    pub fn increment_counter(&self, key: &[u8], cache: &Arc<AtomicI64>, amount: i64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .deltas
            .entry(key.to_vec())
            .or_insert_with(|| CounterDelta {
                amount: 0,
                cache: Arc::clone(cache),
            });
        entry.amount += amount;
    }

    /// Discard every pending counter delta. Used when the counters are
    /// being reset wholesale from a repair scan.
    pub fn reset_counter_deltas(&self) {
        self.inner.lock().deltas.clear();
    }

    /// This transaction's pending delta for `key` (0 when untouched).
    pub fn delta_counter(&self, key: &[u8]) -> i64 {
        self.inner
            .lock()
            .deltas
            .get(key)
            .map(|d| d.amount)
            .unwrap_or(0)
    }

    // ── Hooks, interruption, lock modeling ─────────────────────────────

    pub fn register_change(&self, change: Box<dyn Change>) {
        self.inner.lock().changes.push(change);
    }

    /// Cooperative cancellation, honored by interruptible waits.
    pub fn interrupt(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn check_for_interrupt(&self) -> StoreResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            Err(StoreError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Model of "the caller holds the collection lock exclusively".
    pub fn set_exclusive(&self, exclusive: bool) {
        self.inner.lock().exclusive = exclusive;
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.lock().exclusive
    }

    // ── Commit / rollback ──────────────────────────────────────────────

    /// Fold counter deltas into the batch, apply it atomically, publish
    /// conflict state, then run commit hooks. Returns the commit sequence
    /// number.
    pub fn commit(&self) -> StoreResult<u64> {
        let (mut batch, deltas, keys, mut changes) = {
            let mut inner = self.inner.lock();
            if inner.state != TxnState::Active {
                return Err(StoreError::Engine("transaction already finished".into()));
            }
            inner.state = TxnState::Committed;
            inner.snapshot = None;
            (
                mem::take(&mut inner.batch),
                mem::take(&mut inner.deltas),
                mem::take(&mut inner.registered_keys),
                mem::take(&mut inner.changes),
            )
        };

        let seq = {
            let _commit_guard = self.conflicts.lock_commits();
            for (key, delta) in &deltas {
                let new_total = delta.cache.fetch_add(delta.amount, Ordering::SeqCst) + delta.amount;
                batch.put(key.clone(), new_total.to_le_bytes().to_vec());
            }
            let seq = self.engine.apply(batch)?;
            let safepoint = self.engine.oldest_snapshot_seq().unwrap_or(seq);
            self.conflicts.record_commit(self.txn_id, &keys, seq, safepoint);
            seq
        };

        for change in changes.iter_mut() {
            change.commit();
        }
        Ok(seq)
    }

    /// Discard staged writes and deltas, release claimed keys, and run
    /// rollback hooks in reverse registration order. Idempotent.
    pub fn rollback(&self) {
        let (keys, mut changes) = {
            let mut inner = self.inner.lock();
            if inner.state != TxnState::Active {
                return;
            }
            inner.state = TxnState::RolledBack;
            inner.snapshot = None;
            inner.batch.clear();
            inner.deltas.clear();
            (
                mem::take(&mut inner.registered_keys),
                mem::take(&mut inner.changes),
            )
        };

        self.conflicts.release(self.txn_id, &keys);
        for change in changes.iter_mut().rev() {
            change.rollback();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().state == TxnState::Active
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.is_active() {
            self.rollback();
        }
    }
}
