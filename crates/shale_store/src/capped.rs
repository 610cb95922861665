//! Capped-collection eviction.
//!
//! A capped collection holds a byte cap and optionally a document cap;
//! inserts that push past either evict the oldest records. The policy here
//! balances three pressures:
//!
//! - at most one evictor runs per collection (the deleter mutex),
//! - writers that are only slightly over the cap never block,
//! - writers far over the cap absorb bounded (200 ms) back-pressure so
//!   eviction can catch up.
//!
//! The deletion pass itself runs in a private child transaction that
//! commits independently of the insert that triggered it; a conflict
//! inside the pass is swallowed — the insert already succeeded and a later
//! pass will finish the trimming.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use shale_common::{RecordId, StoreError, StoreResult};
use shale_txn::TransactionContext;

use crate::keys::{decode_record_id, record_key};
use crate::store::RecordStore;

/// Hard cap on deletions per pass, bounding worst-case insert latency.
const MAX_DELETES_PER_PASS: i64 = 20_000;

/// Bounded wait when applying back-pressure on a busy deleter.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(200);

/// Oplog range compactions run when either trigger fires.
const OPLOG_COMPACT_EVERY: Duration = Duration::from_secs(60 * 60);
const OPLOG_COMPACT_EVERY_DELETED_RECORDS: i64 = 1_000_000;

fn slack_from_size(capped_max_size: i64) -> i64 {
    (capped_max_size / 10).min(16 * 1024 * 1024)
}

// ── Capped callback ────────────────────────────────────────────────────────

/// Hook invoked around capped eviction: once per record about to go, and
/// whenever the visible frontier advances (so tailing readers re-check).
pub trait CappedCallback: Send + Sync {
    fn about_to_delete_capped(
        &self,
        txn: &TransactionContext,
        id: RecordId,
        payload: &[u8],
    ) -> StoreResult<()>;

    fn notify_capped_waiters_if_needed(&self);
}

/// Shared, swappable slot holding the callback. Its mutex is the innermost
/// of the three capped locks and is held only across a callback invocation.
#[derive(Default)]
pub struct CappedCallbackSlot {
    inner: Mutex<Option<Box<dyn CappedCallback>>>,
}

impl CappedCallbackSlot {
    pub fn new(callback: Option<Box<dyn CappedCallback>>) -> Self {
        Self {
            inner: Mutex::new(callback),
        }
    }

    pub fn set(&self, callback: Option<Box<dyn CappedCallback>>) {
        *self.inner.lock() = callback;
    }

    pub fn about_to_delete(
        &self,
        txn: &TransactionContext,
        id: RecordId,
        payload: &[u8],
    ) -> StoreResult<()> {
        let slot = self.inner.lock();
        match &*slot {
            Some(callback) => callback.about_to_delete_capped(txn, id, payload),
            None => Ok(()),
        }
    }

    pub fn notify_waiters(&self) {
        let slot = self.inner.lock();
        if let Some(callback) = &*slot {
            callback.notify_capped_waiters_if_needed();
        }
    }
}

// ── Deleter state ──────────────────────────────────────────────────────────

pub(crate) struct DeleterState {
    /// Where the next eviction scan starts. Advanced past records already
    /// deleted so repeated passes skip the tombstone graveyard.
    pub(crate) oldest_key_hint: RecordId,
    pub(crate) last_compaction: Instant,
}

/// Per-collection eviction policy state. Present iff the collection is
/// capped.
pub(crate) struct CappedDeleter {
    pub(crate) mutex: Mutex<DeleterState>,
    max_size: AtomicI64,
    slack: AtomicI64,
    pub(crate) max_docs: i64,
    /// True when a dedicated background thread does the deleting and
    /// foreground writers only ever apply back-pressure.
    pub(crate) has_background_thread: bool,
}

impl CappedDeleter {
    pub(crate) fn new(capped_max_size: i64, capped_max_docs: i64, background: bool) -> Self {
        Self {
            mutex: Mutex::new(DeleterState {
                oldest_key_hint: RecordId::NULL,
                last_compaction: Instant::now(),
            }),
            max_size: AtomicI64::new(capped_max_size),
            slack: AtomicI64::new(slack_from_size(capped_max_size)),
            max_docs: capped_max_docs,
            has_background_thread: background,
        }
    }

    pub(crate) fn max_size(&self) -> i64 {
        self.max_size.load(Ordering::Relaxed)
    }

    pub(crate) fn slack(&self) -> i64 {
        self.slack.load(Ordering::Relaxed)
    }

    pub(crate) fn update_max_size(&self, capped_max_size: i64) {
        self.max_size.store(capped_max_size, Ordering::Relaxed);
        self.slack
            .store(slack_from_size(capped_max_size), Ordering::Relaxed);
    }

    /// Would the collection be over either cap after applying the deltas?
    pub(crate) fn need_delete(
        &self,
        data_size: i64,
        num_records: i64,
        data_delta: i64,
        num_delta: i64,
    ) -> bool {
        if data_size + data_delta > self.max_size() {
            return true;
        }
        if self.max_docs != -1 && num_records + num_delta > self.max_docs {
            return true;
        }
        false
    }
}

// ── Eviction entry points ──────────────────────────────────────────────────

impl RecordStore {
    /// Trim the collection back under its caps after an insert or update
    /// of `just_inserted`. Returns the number of records removed. Never
    /// fails the caller's operation over an eviction conflict.
    pub fn capped_delete_as_needed(
        &self,
        txn: &TransactionContext,
        just_inserted: RecordId,
    ) -> StoreResult<i64> {
        let Some(deleter) = &self.deleter else {
            return Ok(0);
        };
        debug_assert!(!self.is_oplog || deleter.max_docs == -1);

        let (mut data_delta, mut num_delta) = (0, 0);
        if !self.is_oplog {
            data_delta = txn.delta_counter(self.counters.data_size_key());
            num_delta = txn.delta_counter(self.counters.num_records_key());
        }
        if !deleter.need_delete(
            self.counters.data_size_cached(),
            self.counters.num_records_cached(),
            data_delta,
            num_delta,
        ) {
            return Ok(0);
        }

        // Only one evictor at a time; how hard to try depends on the mode.
        let guard = if deleter.max_docs != -1 {
            // A document cap must be exact, so every writer waits its turn.
            deleter.mutex.lock()
        } else if deleter.has_background_thread {
            if self.counters.data_size_cached() - deleter.max_size() < deleter.slack() {
                return Ok(0);
            }
            // Back-pressure only: synchronize briefly with the background
            // deleter, then let it do the work.
            if deleter.mutex.try_lock().is_none() {
                let _ = deleter.mutex.try_lock_for(BACKPRESSURE_WAIT);
            }
            return Ok(0);
        } else {
            match deleter.mutex.try_lock() {
                Some(guard) => guard,
                None => {
                    // Someone else is already deleting. Keep going unless
                    // we are far enough behind to owe back-pressure.
                    if self.counters.data_size_cached() - deleter.max_size() < deleter.slack() {
                        return Ok(0);
                    }
                    let Some(guard) = deleter.mutex.try_lock_for(BACKPRESSURE_WAIT) else {
                        return Ok(0);
                    };
                    // We already waited; leave the cleanup to the other
                    // deleter unless we are still far over the cap.
                    if self.counters.data_size_cached() - deleter.max_size()
                        < 2 * deleter.slack()
                    {
                        return Ok(0);
                    }
                    guard
                }
            }
        };

        self.run_eviction_pass(txn, just_inserted, guard)
    }

    /// Entry point for the dedicated background deleter: always takes the
    /// deleter mutex and trims as far as the caps require.
    pub(crate) fn background_delete_excess(&self, txn: &TransactionContext) -> StoreResult<i64> {
        let Some(deleter) = &self.deleter else {
            return Ok(0);
        };
        if !deleter.need_delete(
            self.counters.data_size_cached(),
            self.counters.num_records_cached(),
            0,
            0,
        ) {
            return Ok(0);
        }
        let guard = deleter.mutex.lock();
        self.run_eviction_pass(txn, RecordId::MAX, guard)
    }

    fn run_eviction_pass(
        &self,
        txn: &TransactionContext,
        just_inserted: RecordId,
        mut guard: MutexGuard<'_, DeleterState>,
    ) -> StoreResult<i64> {
        match self.capped_delete_pass(txn, just_inserted, &mut guard) {
            Ok(removed) => Ok(removed),
            Err(StoreError::WriteConflict) => {
                tracing::warn!("write conflict during capped eviction, ignoring");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// One bounded eviction pass. Runs under the deleter mutex, inside a
    /// private child transaction.
    fn capped_delete_pass(
        &self,
        txn: &TransactionContext,
        just_inserted: RecordId,
        state: &mut DeleterState,
    ) -> StoreResult<i64> {
        let Some(deleter) = &self.deleter else {
            return Ok(0);
        };
        let visibility = self
            .visibility
            .as_ref()
            .ok_or_else(|| StoreError::Corruption("capped collection without visibility".into()))?;

        let sub = txn.spawn_child();

        let data_size =
            self.counters.data_size_cached() + txn.delta_counter(self.counters.data_size_key());
        let num_records =
            self.counters.num_records_cached() + txn.delta_counter(self.counters.num_records_key());

        let size_over_cap = (data_size - deleter.max_size()).max(0);
        let docs_over_cap = if deleter.max_docs != -1 && num_records > deleter.max_docs {
            num_records - deleter.max_docs
        } else {
            0
        };

        let mut size_saved = 0i64;
        let mut docs_removed = 0i64;

        // The tracker scan reads ids and lengths without touching oplog
        // payloads; plain capped collections scan themselves.
        let mut iter = match &self.tracker {
            Some(tracker) => tracker.new_iterator(&self.engine, &sub),
            None => self.engine.prefix_iter(&self.prefix, &sub.snapshot()),
        };
        iter.seek(&state.oldest_key_hint.to_be_bytes());

        while (size_saved < size_over_cap || docs_removed < docs_over_cap)
            && docs_removed < MAX_DELETES_PER_PASS
        {
            let Some((suffix, value)) = iter.entry() else {
                break;
            };
            let id = decode_record_id(suffix)?;

            // Never overrun the uncommitted front, the triggering record,
            // or a store that is going away.
            if visibility.is_capped_hidden(id) {
                break;
            }
            if id >= just_inserted {
                break;
            }
            if self.is_shutting_down() {
                break;
            }

            let key = record_key(&self.prefix, id);
            if !sub.register_write(&key) {
                tracing::warn!(
                    docs_removed,
                    "conflict while trimming capped collection, stopping pass"
                );
                break;
            }

            let value = value.to_vec();
            let payload: &[u8] = match &self.tracker {
                Some(tracker) => {
                    size_saved += tracker.decode_size(&value)? as i64;
                    // The callback only needs payloads for index cleanup,
                    // and the oplog has no indexes.
                    &[]
                }
                None => {
                    size_saved += value.len() as i64;
                    &value
                }
            };
            docs_removed += 1;

            self.callback.about_to_delete(&sub, id, payload)?;

            sub.delete(key);
            if let Some(tracker) = &self.tracker {
                tracker.delete_key(&sub, id);
            }

            iter.next();
        }

        if !iter.valid() {
            if let Err(e) = iter.status() {
                tracing::warn!("iterator failure during capped eviction, ignoring: {}", e);
            }
        }

        if docs_removed > 0 {
            self.counters.change_num_records(&sub, -docs_removed);
            self.counters.increase_data_size(&sub, -size_saved);
            sub.commit()?;
        }

        // Remember where the live records start, unless an uncommitted
        // insert may still land below that point.
        if let Some((suffix, _)) = iter.entry() {
            let oldest_alive = decode_record_id(suffix)?;
            if !visibility.is_capped_hidden(oldest_alive) {
                state.oldest_key_hint = oldest_alive;
            }
        }

        if self.is_oplog {
            self.maybe_schedule_oplog_compaction(state);
        }

        Ok(docs_removed)
    }

    fn maybe_schedule_oplog_compaction(&self, state: &mut DeleterState) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let elapsed = state.last_compaction.elapsed();
        let deleted = tracker.deleted_since_compaction();
        if elapsed < OPLOG_COMPACT_EVERY && deleted < OPLOG_COMPACT_EVERY_DELETED_RECORDS {
            return;
        }
        tracing::info!(
            elapsed_secs = elapsed.as_secs(),
            deleted,
            "scheduling oplog range compactions"
        );
        let begin = RecordId::NULL.to_be_bytes();
        let end = state.oldest_key_hint.to_be_bytes();
        self.compaction.schedule(&self.prefix, &begin, &end);
        self.compaction.schedule(tracker.prefix(), &begin, &end);
        tracker.reset_deleted_since_compaction();
        state.last_compaction = Instant::now();
    }
}
