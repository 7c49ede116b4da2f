//! Block-merge compaction.
//!
//! - [`merge`]: groups overlapping blocks per key and merges them into
//!   deduplicated, tombstone-filtered output blocks.
//! - [`planner`]: configuration and file selection.
//! - [`store`]: the live file set, leases and atomic swaps.
//! - [`driver`]: runs a pass end to end.

pub mod driver;
pub mod merge;
pub mod planner;
pub mod store;

pub use driver::{AbortHandle, CompactionOutcome, Compactor};
pub use merge::{merge_group, merge_points, BlockGroup, KeyBlocks, MergeIterator, MergeStats};
pub use planner::{CompactionConfig, CompactionPlan, CompactionPlanner, LevelConfig, LevelPlanner};
pub use store::{FileSet, FileStore, Lease};
