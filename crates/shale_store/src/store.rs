//! The record store façade.
//!
//! One `RecordStore` maps one collection onto the engine's key space:
//! monotonic id allocation, transactional CRUD, truncation, stats, and —
//! for capped collections and the oplog — the eviction and visibility
//! machinery wired together at open.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use shale_common::{RecordId, StoreError, StoreResult};
use shale_engine::{CompactionScheduler, DurabilityManager, KvEngine};
use shale_txn::{ConflictTracker, TransactionContext};

use crate::capped::{CappedCallback, CappedCallbackSlot, CappedDeleter};
use crate::counters::CounterCache;
use crate::cursor::RecordCursor;
use crate::keys::{decode_record_id, next_prefix, record_key};
use crate::oplog_tracker::OplogKeyTracker;
use crate::visibility::VisibilityManager;

/// Construction parameters for one collection.
#[derive(Debug, Clone)]
pub struct RecordStoreOptions {
    /// Namespace, e.g. `app.events`. `local.oplog.*` namespaces get oplog
    /// semantics.
    pub ns: String,
    /// Storage identifier; names the persisted counter keys.
    pub ident: String,
    /// Collection key prefix, unique per collection. For oplogs the
    /// successor prefix is reserved for the shadow tracker.
    pub prefix: Vec<u8>,
    pub capped: bool,
    /// Byte cap; -1 when not capped.
    pub capped_max_size: i64,
    /// Document cap; -1 for unlimited.
    pub capped_max_docs: i64,
    /// Leave deletion to a dedicated background thread; foreground
    /// writers only apply back-pressure.
    pub background_deleter: bool,
}

impl RecordStoreOptions {
    pub fn plain(ns: &str, ident: &str, prefix: Vec<u8>) -> Self {
        Self {
            ns: ns.into(),
            ident: ident.into(),
            prefix,
            capped: false,
            capped_max_size: -1,
            capped_max_docs: -1,
            background_deleter: false,
        }
    }

    pub fn capped(ns: &str, ident: &str, prefix: Vec<u8>, max_size: i64, max_docs: i64) -> Self {
        Self {
            ns: ns.into(),
            ident: ident.into(),
            prefix,
            capped: true,
            capped_max_size: max_size,
            capped_max_docs: max_docs,
            background_deleter: false,
        }
    }
}

/// Capped configuration reported by [`RecordStore::capped_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedInfo {
    pub max_size: i64,
    pub max_docs: i64,
}

/// Outcome of a validating scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateResults {
    pub num_records: i64,
    pub data_size: i64,
    /// True when the cached counters disagreed and were reset.
    pub repaired: bool,
}

fn is_oplog_namespace(ns: &str) -> bool {
    ns.starts_with("local.oplog.")
}

pub struct RecordStore {
    ns: String,
    ident: String,
    pub(crate) prefix: Vec<u8>,
    pub(crate) is_capped: bool,
    pub(crate) is_oplog: bool,
    pub(crate) engine: Arc<KvEngine>,
    pub(crate) compaction: Arc<CompactionScheduler>,
    conflicts: Arc<ConflictTracker>,
    pub(crate) counters: CounterCache,
    pub(crate) tracker: Option<OplogKeyTracker>,
    pub(crate) visibility: Option<Arc<VisibilityManager>>,
    pub(crate) deleter: Option<CappedDeleter>,
    pub(crate) callback: Arc<CappedCallbackSlot>,
    next_id: AtomicI64,
    shutting_down: AtomicBool,
}

impl RecordStore {
    /// Open (or create) the collection: validate the capped options, wire
    /// the eviction/visibility machinery, find the highest existing id,
    /// and load the cached counters.
    pub fn open(
        options: RecordStoreOptions,
        engine: Arc<KvEngine>,
        durability: Arc<DurabilityManager>,
        compaction: Arc<CompactionScheduler>,
        conflicts: Arc<ConflictTracker>,
        callback: Option<Box<dyn CappedCallback>>,
    ) -> StoreResult<Self> {
        let is_oplog = is_oplog_namespace(&options.ns);
        let is_capped = options.capped || is_oplog;

        if is_capped {
            if options.capped_max_size <= 0 {
                return Err(StoreError::BadValue(
                    "capped collections need a positive byte cap".into(),
                ));
            }
            if options.capped_max_docs != -1 && options.capped_max_docs <= 0 {
                return Err(StoreError::BadValue(
                    "capped document cap must be positive or -1".into(),
                ));
            }
            if is_oplog && options.capped_max_docs != -1 {
                return Err(StoreError::BadValue(
                    "the oplog does not take a document cap".into(),
                ));
            }
            // The shadow tracker lives under the successor prefix, which
            // an all-0xFF (or empty) prefix does not have.
            if is_oplog && options.prefix.iter().all(|byte| *byte == 0xff) {
                return Err(StoreError::BadValue(
                    "oplog prefix has no successor to hold the shadow tracker".into(),
                ));
            }
        } else if options.capped_max_size != -1 || options.capped_max_docs != -1 {
            return Err(StoreError::BadValue(
                "size caps are only valid on capped collections".into(),
            ));
        }

        tracing::info!(
            ns = %options.ns,
            ident = %options.ident,
            capped = is_capped,
            oplog = is_oplog,
            "opening record collection"
        );

        let callback = Arc::new(CappedCallbackSlot::new(callback));
        let tracker = is_oplog.then(|| OplogKeyTracker::new(next_prefix(&options.prefix)));
        let visibility = is_capped.then(|| {
            VisibilityManager::new(is_oplog, Arc::clone(&durability), Arc::clone(&callback))
        });

        let counters = CounterCache::new(&options.ident);
        counters.load_from_store(&engine)?;

        // Seed the id allocator from the highest existing record.
        let mut next_id = 1i64;
        let mut iter = engine.prefix_iter_latest(&options.prefix);
        iter.seek_to_last();
        if let Some((suffix, _)) = iter.entry() {
            let last_id = decode_record_id(suffix)?;
            if let Some(visibility) = &visibility {
                visibility.update_highest_seen(last_id);
            }
            next_id = last_id.repr() + 1;
        }

        let deleter = is_capped.then(|| {
            CappedDeleter::new(
                options.capped_max_size,
                options.capped_max_docs,
                options.background_deleter,
            )
        });

        Ok(Self {
            ns: options.ns,
            ident: options.ident,
            prefix: options.prefix,
            is_capped,
            is_oplog,
            engine,
            compaction,
            conflicts,
            counters,
            tracker,
            visibility,
            deleter,
            callback,
            next_id: AtomicI64::new(next_id),
            shutting_down: AtomicBool::new(false),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn is_capped(&self) -> bool {
        self.is_capped
    }

    pub fn is_oplog(&self) -> bool {
        self.is_oplog
    }

    pub fn engine_arc(&self) -> Arc<KvEngine> {
        Arc::clone(&self.engine)
    }

    pub fn conflicts_arc(&self) -> Arc<ConflictTracker> {
        Arc::clone(&self.conflicts)
    }

    /// Begin a transaction against this store's engine.
    pub fn begin(&self) -> TransactionContext {
        TransactionContext::new(Arc::clone(&self.engine), Arc::clone(&self.conflicts))
    }

    pub fn num_records(&self, txn: &TransactionContext) -> i64 {
        self.counters.num_records(txn)
    }

    pub fn data_size(&self, txn: &TransactionContext) -> i64 {
        self.counters.data_size(txn)
    }

    /// Reported storage footprint, rounded down to 256-byte granularity
    /// for stability.
    pub fn storage_size(&self) -> i64 {
        (self.counters.data_size_cached() & !255).max(256)
    }

    pub fn capped_info(&self) -> Option<CappedInfo> {
        self.deleter.as_ref().map(|deleter| CappedInfo {
            max_size: deleter.max_size(),
            max_docs: deleter.max_docs,
        })
    }

    /// Change the byte cap of a capped collection.
    pub fn update_capped_size(&self, capped_max_size: i64) -> StoreResult<()> {
        let Some(deleter) = &self.deleter else {
            return Err(StoreError::Unsupported(
                "cannot set a byte cap on an uncapped collection",
            ));
        };
        if capped_max_size <= 0 {
            return Err(StoreError::BadValue(
                "capped collections need a positive byte cap".into(),
            ));
        }
        deleter.update_max_size(capped_max_size);
        Ok(())
    }

    /// Swap the capped callback.
    pub fn set_capped_callback(&self, callback: Option<Box<dyn CappedCallback>>) {
        self.callback.set(callback);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn next_record_id(&self) -> RecordId {
        debug_assert!(!self.is_oplog);
        RecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // ── Inserts ────────────────────────────────────────────────────────

    /// Insert a record with a store-allocated id. Not valid on the oplog,
    /// whose ids are caller-supplied timestamps.
    pub fn insert(&self, txn: &TransactionContext, data: &[u8]) -> StoreResult<RecordId> {
        if self.is_oplog {
            return Err(StoreError::Unsupported(
                "oplog records carry caller-assigned ids",
            ));
        }
        self.insert_inner(txn, None, data)
    }

    /// Insert an oplog record under a caller-supplied, strictly
    /// increasing id.
    pub fn insert_oplog(
        &self,
        txn: &TransactionContext,
        id: RecordId,
        data: &[u8],
    ) -> StoreResult<RecordId> {
        if !self.is_oplog {
            return Err(StoreError::Unsupported(
                "only the oplog takes caller-assigned ids",
            ));
        }
        if id <= RecordId::NULL {
            return Err(StoreError::BadValue(format!(
                "oplog ids must be positive, got {}",
                id
            )));
        }
        self.insert_inner(txn, Some(id), data)
    }

    /// Insert several records; stops at the first failure.
    pub fn insert_many(
        &self,
        txn: &TransactionContext,
        docs: &[&[u8]],
    ) -> StoreResult<Vec<RecordId>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert(txn, doc)?);
        }
        Ok(ids)
    }

    fn insert_inner(
        &self,
        txn: &TransactionContext,
        oplog_id: Option<RecordId>,
        data: &[u8],
    ) -> StoreResult<RecordId> {
        if let Some(deleter) = &self.deleter {
            if data.len() as i64 > deleter.max_size() {
                return Err(StoreError::BadValue(
                    "record exceeds the collection's byte cap".into(),
                ));
            }
        }

        let id = match (oplog_id, &self.visibility) {
            (Some(id), Some(visibility)) => {
                visibility.add_uncommitted_in_order(txn, id)?;
                id
            }
            (None, Some(visibility)) => {
                visibility.allocate_and_add_uncommitted(txn, || self.next_record_id())
            }
            (None, None) => self.next_record_id(),
            (Some(_), None) => {
                return Err(StoreError::Corruption(
                    "oplog collection without visibility manager".into(),
                ))
            }
        };

        // A freshly allocated id cannot collide with another transaction,
        // so no conflict registration is needed.
        txn.put(record_key(&self.prefix, id), data.to_vec());
        if let Some(tracker) = &self.tracker {
            tracker.insert_key(txn, id, data.len());
        }

        self.counters.change_num_records(txn, 1);
        self.counters.increase_data_size(txn, data.len() as i64);

        self.capped_delete_as_needed(txn, id)?;
        Ok(id)
    }

    // ── Point reads ────────────────────────────────────────────────────

    /// Snapshot point read; `None` when the record does not exist.
    pub fn find_record(
        &self,
        txn: &TransactionContext,
        id: RecordId,
    ) -> StoreResult<Option<Vec<u8>>> {
        txn.get(&record_key(&self.prefix, id))
    }

    /// Like [`find_record`], but absence is a corruption error — for
    /// callers that already proved the record exists.
    ///
    /// [`find_record`]: RecordStore::find_record
    pub fn record_bytes(&self, txn: &TransactionContext, id: RecordId) -> StoreResult<Vec<u8>> {
        self.find_record(txn, id)?
            .ok_or_else(|| StoreError::Corruption(format!("record {} not found", id)))
    }

    // ── Updates and deletes ────────────────────────────────────────────

    pub fn update_record(
        &self,
        txn: &TransactionContext,
        id: RecordId,
        data: &[u8],
    ) -> StoreResult<()> {
        let key = record_key(&self.prefix, id);
        if !txn.register_write(&key) {
            return Err(StoreError::WriteConflict);
        }

        let old = txn
            .get(&key)?
            .ok_or_else(|| StoreError::Corruption(format!("record {} missing on update", id)))?;

        txn.put(key, data.to_vec());
        if let Some(tracker) = &self.tracker {
            // Size may change; re-recording the id overwrites the entry.
            tracker.insert_key(txn, id, data.len());
        }

        self.counters
            .increase_data_size(txn, data.len() as i64 - old.len() as i64);

        self.capped_delete_as_needed(txn, id)?;
        Ok(())
    }

    /// Partial in-place updates are not supported by this store.
    pub fn update_in_place(
        &self,
        _txn: &TransactionContext,
        _id: RecordId,
        _patches: &[(usize, Vec<u8>)],
    ) -> StoreResult<Vec<u8>> {
        Err(StoreError::Unsupported("partial in-place updates"))
    }

    pub fn delete_record(&self, txn: &TransactionContext, id: RecordId) -> StoreResult<()> {
        let key = record_key(&self.prefix, id);
        if !txn.register_write(&key) {
            return Err(StoreError::WriteConflict);
        }

        let old = txn
            .get(&key)?
            .ok_or_else(|| StoreError::Corruption(format!("record {} missing on delete", id)))?;

        txn.delete(key);
        if let Some(tracker) = &self.tracker {
            tracker.delete_key(txn, id);
        }

        self.counters.change_num_records(txn, -1);
        self.counters.increase_data_size(txn, -(old.len() as i64));
        Ok(())
    }

    // ── Cursors ────────────────────────────────────────────────────────

    /// Open a cursor. Forward oplog cursors refuse a transaction that
    /// already pinned a snapshot without holding the collection
    /// exclusively — the visibility ceiling it would capture might not
    /// match what that older snapshot can see.
    pub fn get_cursor<'t>(
        &self,
        txn: &'t TransactionContext,
        forward: bool,
    ) -> StoreResult<RecordCursor<'t>> {
        let mut start_hint = RecordId::NULL;
        let mut read_until = None;

        if self.is_oplog {
            let visibility = self.visibility.as_ref().ok_or_else(|| {
                StoreError::Corruption("oplog collection without visibility manager".into())
            })?;
            if forward {
                if txn.has_snapshot() && !txn.is_exclusive() {
                    return Err(StoreError::WriteConflict);
                }
                read_until = Some(visibility.oplog_read_ceiling());
                if let Some(deleter) = &self.deleter {
                    start_hint = deleter.mutex.lock().oldest_key_hint;
                }
            } else {
                // Reverse scans start at the ceiling so in-flight ids
                // above it are never walked over.
                start_hint = visibility.oplog_read_ceiling();
            }
        }

        Ok(RecordCursor::new(
            txn,
            Arc::clone(&self.engine),
            self.prefix.clone(),
            self.visibility.clone(),
            forward,
            start_hint,
            read_until,
        ))
    }

    // ── Bulk removal ───────────────────────────────────────────────────

    /// Delete every record, going through [`delete_record`] so counters,
    /// the oplog tracker, and conflict registration all apply. Visibility
    /// is deliberately ignored: truncation takes hidden records too.
    ///
    /// [`delete_record`]: RecordStore::delete_record
    pub fn truncate(&self, txn: &TransactionContext) -> StoreResult<()> {
        let mut iter = self.engine.prefix_iter(&self.prefix, &txn.snapshot());
        iter.seek_to_first();
        loop {
            let id = match iter.entry() {
                Some((suffix, _)) => decode_record_id(suffix)?,
                None => break,
            };
            self.delete_record(txn, id)?;
            iter.next();
        }
        iter.status()
    }

    /// Remove every record after `end` (inclusive or not), then rewind
    /// the highest-seen id to the last kept record so fresh inserts
    /// resume from there. The caller must hold the collection
    /// exclusively; there is no protection against concurrent writers.
    pub fn capped_truncate_after(
        &self,
        txn: &TransactionContext,
        end: RecordId,
        inclusive: bool,
    ) -> StoreResult<i64> {
        debug_assert!(txn.is_exclusive());

        let mut last_kept = end;
        if inclusive {
            let mut reverse = self.get_cursor(txn, false)?;
            if reverse.seek_exact(end)?.is_none() {
                return Err(StoreError::Corruption(format!(
                    "truncation point {} not found",
                    end
                )));
            }
            last_kept = match reverse.next()? {
                Some(record) => record.id,
                None => RecordId::MIN,
            };
        }

        let mut removed = 0i64;
        let mut cursor = self.get_cursor(txn, true)?;
        let mut record = cursor.seek_exact(end)?;
        while let Some(current) = record {
            if end < current.id || (inclusive && end == current.id) {
                self.callback.about_to_delete(txn, current.id, &current.data)?;
                self.delete_record(txn, current.id)?;
                removed += 1;
            }
            record = cursor.next()?;
        }

        if removed > 0 {
            if let Some(visibility) = &self.visibility {
                visibility.set_highest_seen(last_kept);
            }
        }
        Ok(removed)
    }

    // ── Maintenance ────────────────────────────────────────────────────

    /// Compact the whole collection range in the engine.
    pub fn compact(&self) -> StoreResult<()> {
        self.engine.compact_range(
            &self.prefix,
            &RecordId::NULL.to_be_bytes(),
            &RecordId::MAX.to_be_bytes(),
        );
        Ok(())
    }

    /// Full forward scan, recounting records and bytes. When the cached
    /// counters disagree with what the scan saw, they are repaired.
    pub fn validate(&self, txn: &TransactionContext) -> StoreResult<ValidateResults> {
        let mut cursor = self.get_cursor(txn, true)?;
        let mut num_records = 0i64;
        let mut data_size = 0i64;
        while let Some(record) = cursor.next()? {
            num_records += 1;
            data_size += record.data.len() as i64;
        }

        let repaired = num_records != self.num_records(txn) || data_size != self.data_size(txn);
        if repaired {
            tracing::warn!(
                ns = %self.ns,
                num_records,
                data_size,
                "cached counters disagree with scan, repairing"
            );
            self.update_stats_after_repair(txn, num_records, data_size)?;
        }
        Ok(ValidateResults {
            num_records,
            data_size,
            repaired,
        })
    }

    /// Reset both counters to observed values, dropping the transaction's
    /// pending deltas for them.
    pub fn update_stats_after_repair(
        &self,
        txn: &TransactionContext,
        num_records: i64,
        data_size: i64,
    ) -> StoreResult<()> {
        txn.reset_counter_deltas();
        self.counters.reset(&self.engine, num_records, data_size)
    }

    // ── Oplog helpers ──────────────────────────────────────────────────

    /// The greatest oplog id at or below `start`, via the shadow tracker
    /// (keys only, no payload reads). `Ok(None)` when the collection is
    /// not an oplog or holds nothing at or below `start`.
    pub fn oplog_entry_at_or_before(
        &self,
        txn: &TransactionContext,
        start: RecordId,
    ) -> StoreResult<Option<RecordId>> {
        let Some(tracker) = &self.tracker else {
            return Ok(None);
        };

        let mut iter = tracker.new_iterator(&self.engine, txn);
        iter.seek(&start.to_be_bytes());

        let found = match iter.entry() {
            Some((suffix, _)) => decode_record_id(suffix)?,
            None => {
                // Past the end: the last entry (if any) is the answer.
                iter.seek_to_last();
                return match iter.entry() {
                    Some((suffix, _)) => Ok(Some(decode_record_id(suffix)?)),
                    None => {
                        iter.status()?;
                        Ok(None)
                    }
                };
            }
        };

        if found == start {
            return Ok(Some(found));
        }
        // Seek lands at-or-past the target; we are past, so step back.
        debug_assert!(found > start);
        iter.prev();
        match iter.entry() {
            Some((suffix, _)) => Ok(Some(decode_record_id(suffix)?)),
            None => {
                iter.status()?;
                Ok(None)
            }
        }
    }

    /// Block until all earlier oplog writes are visible. Interruptible
    /// through the transaction.
    pub fn wait_for_all_earlier_oplog_writes_to_be_visible(
        &self,
        txn: &TransactionContext,
    ) -> StoreResult<()> {
        let Some(visibility) = &self.visibility else {
            return Err(StoreError::Unsupported(
                "visibility waits only apply to the oplog",
            ));
        };
        visibility.wait_for_all_earlier_oplog_writes_to_be_visible(txn)
    }

    #[cfg(test)]
    pub(crate) fn visibility_for_tests(&self) -> Option<&Arc<VisibilityManager>> {
        self.visibility.as_ref()
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Let any in-flight eviction pass observe the flag before the
        // visibility machinery goes away.
        if let Some(deleter) = &self.deleter {
            drop(deleter.mutex.lock());
        }
        if let Some(visibility) = &self.visibility {
            visibility.shutdown_and_join();
        }
    }
}
