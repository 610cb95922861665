//! Record key encoding.
//!
//! Every record of a collection lives under `prefix ‖ BE64(id)`. Big-endian
//! encoding makes key order equal numeric id order for the non-negative ids
//! live records occupy, so prefix scans walk records in id order.

use shale_common::{RecordId, StoreError, StoreResult};

/// `prefix ‖ BE64(id)`.
pub fn record_key(prefix: &[u8], id: RecordId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Decode the id from a prefix-stripped key suffix.
pub fn decode_record_id(suffix: &[u8]) -> StoreResult<RecordId> {
    let bytes: [u8; 8] = suffix.try_into().map_err(|_| {
        StoreError::Corruption(format!("record key suffix has length {}", suffix.len()))
    })?;
    Ok(RecordId::from_be_bytes(bytes))
}

/// The lexicographically next prefix of the same length: increment with
/// carry from the last byte. Every key under `prefix` sorts strictly below
/// every key under the result, which is what the oplog shadow index relies
/// on. An all-0xFF (or empty) prefix has no such successor; collection
/// open rejects those, and this asserts the precondition.
pub fn next_prefix(prefix: &[u8]) -> Vec<u8> {
    debug_assert!(
        prefix.iter().any(|byte| *byte != 0xff),
        "all-0xff prefix has no ordered successor"
    );
    let mut next = prefix.to_vec();
    for byte in next.iter_mut().rev() {
        let (incremented, overflowed) = byte.overflowing_add(1);
        *byte = incremented;
        if !overflowed {
            break;
        }
    }
    next
}
