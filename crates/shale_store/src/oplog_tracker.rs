//! Oplog shadow key tracker.
//!
//! A second key range, under the lexicographic successor of the oplog's
//! prefix, mirroring the oplog's id set with tiny values:
//! `next_prefix(prefix) ‖ BE64(id) → LE32(payload_len)`. Eviction scans
//! walk this range instead of the oplog itself, so finding what to trim
//! never pays to read oplog payloads. Writes go into the same transaction
//! batch as the oplog write they mirror, which keeps the two key sets
//! identical at every commit boundary.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use shale_common::{RecordId, StoreError, StoreResult};
use shale_engine::{KvEngine, PrefixIterator};
use shale_txn::TransactionContext;

use crate::keys::record_key;

pub struct OplogKeyTracker {
    prefix: Vec<u8>,
    /// Monotonically increasing; incremented on the (deleter-serialized)
    /// delete path and read without a lock.
    deleted_since_compaction: AtomicI64,
}

impl OplogKeyTracker {
    pub fn new(prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            deleted_since_compaction: AtomicI64::new(0),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Mirror an oplog insert into the shadow range.
    pub fn insert_key(&self, txn: &TransactionContext, id: RecordId, len: usize) {
        txn.put(
            record_key(&self.prefix, id),
            (len as u32).to_le_bytes().to_vec(),
        );
    }

    /// Mirror an oplog delete.
    pub fn delete_key(&self, txn: &TransactionContext, id: RecordId) {
        txn.delete(record_key(&self.prefix, id));
        self.deleted_since_compaction.fetch_add(1, Ordering::Relaxed);
    }

    /// Iterator over the shadow range at the transaction's snapshot.
    pub fn new_iterator(&self, engine: &Arc<KvEngine>, txn: &TransactionContext) -> PrefixIterator {
        engine.prefix_iter(&self.prefix, &txn.snapshot())
    }

    /// Payload length recorded for an id.
    pub fn decode_size(&self, value: &[u8]) -> StoreResult<usize> {
        let bytes: [u8; 4] = value.try_into().map_err(|_| {
            StoreError::Corruption(format!("oplog tracker value has length {}", value.len()))
        })?;
        Ok(u32::from_le_bytes(bytes) as usize)
    }

    pub fn deleted_since_compaction(&self) -> i64 {
        self.deleted_since_compaction.load(Ordering::Relaxed)
    }

    pub fn reset_deleted_since_compaction(&self) {
        self.deleted_since_compaction.store(0, Ordering::Relaxed);
    }
}
