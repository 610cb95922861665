pub mod batch;
pub mod compaction;
pub mod durability;
pub mod memstore;

pub use batch::{BatchOp, WriteBatch};
pub use compaction::{CompactRequest, CompactionScheduler, CompactionStatsSnapshot};
pub use durability::{DurabilityManager, DurabilityStatsSnapshot};
pub use memstore::{EngineStatsSnapshot, KvEngine, PrefixIterator, Snapshot};
