pub mod error;
pub mod record_id;
pub mod shutdown;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use record_id::RecordId;
pub use shutdown::ShutdownSignal;
