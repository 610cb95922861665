//! Record identifiers.
//!
//! A `RecordId` is a signed 64-bit integer, strictly positive for live
//! records. Key order in the engine must equal numeric order, so the id is
//! encoded big-endian wherever it lands in a key.

use std::fmt;

/// Identifier of a record within one collection.
///
/// `NULL` (zero) means "no record"; `MIN`/`MAX` are scan sentinels and never
/// name a live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(i64);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);
    pub const MIN: RecordId = RecordId(i64::MIN);
    pub const MAX: RecordId = RecordId(i64::MAX);

    pub fn new(repr: i64) -> Self {
        RecordId(repr)
    }

    /// The raw signed representation.
    pub fn repr(self) -> i64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Big-endian encoding; preserves numeric order for non-negative ids,
    /// which is the only range live records occupy.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        RecordId(i64::from_be_bytes(bytes))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_matches_encoding() {
        let ids = [1i64, 2, 255, 256, 1 << 20, i64::MAX];
        for w in ids.windows(2) {
            let (a, b) = (RecordId::new(w[0]), RecordId::new(w[1]));
            assert!(a < b);
            assert!(a.to_be_bytes() < b.to_be_bytes());
        }
    }

    #[test]
    fn test_roundtrip_and_sentinels() {
        let id = RecordId::new(42);
        assert_eq!(RecordId::from_be_bytes(id.to_be_bytes()), id);
        assert!(RecordId::NULL.is_null());
        assert!(RecordId::MIN < RecordId::NULL);
        assert!(RecordId::NULL < RecordId::new(1));
        assert!(RecordId::new(1) < RecordId::MAX);
    }
}
