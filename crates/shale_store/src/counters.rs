//! Cached collection counters.
//!
//! `num_records` and `data_size` live in two places: a pair of in-memory
//! atomics (the fast path every operation reads) and two engine keys that
//! survive restarts. Transactions accumulate deltas against the atomics;
//! the deltas fold into both the atomic and the persisted key when the
//! transaction commits, so the authoritative value is always
//! `persisted + in-flight deltas`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use shale_common::{StoreError, StoreResult};
use shale_engine::{KvEngine, WriteBatch};
use shale_txn::TransactionContext;

/// Reserved key-space prefix for store metadata, below any collection
/// prefix the engine hands out.
const METADATA_PREFIX: &[u8] = b"\0\0\0\0";

pub struct CounterCache {
    num_records: Arc<AtomicI64>,
    data_size: Arc<AtomicI64>,
    num_records_key: Vec<u8>,
    data_size_key: Vec<u8>,
}

fn metadata_key(kind: &str, ident: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(METADATA_PREFIX.len() + kind.len() + ident.len());
    key.extend_from_slice(METADATA_PREFIX);
    key.extend_from_slice(kind.as_bytes());
    key.extend_from_slice(ident.as_bytes());
    key
}

fn decode_counter(value: &[u8]) -> StoreResult<i64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        StoreError::Corruption(format!("persisted counter has length {}", value.len()))
    })?;
    Ok(i64::from_le_bytes(bytes))
}

impl CounterCache {
    pub fn new(ident: &str) -> Self {
        Self {
            num_records: Arc::new(AtomicI64::new(0)),
            data_size: Arc::new(AtomicI64::new(0)),
            num_records_key: metadata_key("numrecords-", ident),
            data_size_key: metadata_key("datasize-", ident),
        }
    }

    /// Load the persisted totals. Negative values (left behind by an
    /// unclean shutdown mid-eviction) clamp to zero.
    pub fn load_from_store(&self, engine: &KvEngine) -> StoreResult<()> {
        let num = match engine.get_latest(&self.num_records_key)? {
            Some(value) => decode_counter(&value)?,
            None => 0,
        };
        let size = match engine.get_latest(&self.data_size_key)? {
            Some(value) => decode_counter(&value)?,
            None => 0,
        };
        self.num_records.store(num.max(0), Ordering::SeqCst);
        self.data_size.store(size.max(0), Ordering::SeqCst);
        Ok(())
    }

    // ── Effective values (read-your-writes) ────────────────────────────

    pub fn num_records(&self, txn: &TransactionContext) -> i64 {
        self.num_records.load(Ordering::Relaxed) + txn.delta_counter(&self.num_records_key)
    }

    pub fn data_size(&self, txn: &TransactionContext) -> i64 {
        self.data_size.load(Ordering::Relaxed) + txn.delta_counter(&self.data_size_key)
    }

    /// Committed value only, no transaction deltas.
    pub fn num_records_cached(&self) -> i64 {
        self.num_records.load(Ordering::Relaxed)
    }

    pub fn data_size_cached(&self) -> i64 {
        self.data_size.load(Ordering::Relaxed)
    }

    // ── Mutation ───────────────────────────────────────────────────────

    pub fn change_num_records(&self, txn: &TransactionContext, amount: i64) {
        txn.increment_counter(&self.num_records_key, &self.num_records, amount);
    }

    pub fn increase_data_size(&self, txn: &TransactionContext, amount: i64) {
        txn.increment_counter(&self.data_size_key, &self.data_size, amount);
    }

    /// Overwrite both counters, in memory and in the engine. Used after a
    /// validating scan found the cached totals wrong.
    pub fn reset(&self, engine: &KvEngine, num_records: i64, data_size: i64) -> StoreResult<()> {
        self.num_records.store(num_records, Ordering::SeqCst);
        self.data_size.store(data_size, Ordering::SeqCst);
        let mut batch = WriteBatch::new();
        batch.put(
            self.num_records_key.clone(),
            num_records.to_le_bytes().to_vec(),
        );
        batch.put(self.data_size_key.clone(), data_size.to_le_bytes().to_vec());
        engine.apply(batch)?;
        Ok(())
    }

    pub fn num_records_key(&self) -> &[u8] {
        &self.num_records_key
    }

    pub fn data_size_key(&self) -> &[u8] {
        &self.data_size_key
    }
}
