pub mod background;
pub mod capped;
pub mod counters;
pub mod cursor;
pub mod keys;
pub mod oplog_tracker;
pub mod store;
pub mod visibility;

#[cfg(test)]
mod tests;

pub use background::CappedBackgroundDeleter;
pub use capped::{CappedCallback, CappedCallbackSlot};
pub use cursor::{Record, RecordCursor};
pub use store::{CappedInfo, RecordStore, RecordStoreOptions, ValidateResults};
pub use visibility::VisibilityManager;

pub use shale_common::{RecordId, StoreError, StoreResult};
