//! tsmerge - block-merge compaction for TSM time series files
//!
//! This crate merges the overlapping blocks of several immutable TSM files
//! into fresh files holding one deduplicated, tombstone-filtered view of the
//! data, without ever exposing a half-written result to readers.
//!
//! # Components
//!
//! - [`tsm::codec`]: typed block codecs (Gorilla timestamps and floats,
//!   LEB128 integers, packed booleans, LZ4 text)
//! - [`BlockDescriptor`]: lazily decoded view over one block of a mapped file
//! - [`TombstoneFilter`]: sorted deletion ranges for one series key
//! - [`MergeIterator`]: k-way merge of block groups in key order
//! - [`Compactor`]: runs a pass from plan to atomic swap in a [`FileStore`]
//!
//! # Example
//!
//! ```rust,ignore
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use tsmerge::compact::{AbortHandle, CompactionConfig, CompactionPlan, Compactor, FileStore};
//! use tsmerge::tsm::{Point, SeriesKey};
//!
//! let store = Arc::new(FileStore::open("/data/tsm")?);
//! let mut series = BTreeMap::new();
//! series.insert(SeriesKey::from("cpu,host=a"), vec![Point::float(10, 0.5)]);
//! let a = store.flush(&series, 1000)?;
//! let b = store.flush(&series, 1000)?;
//!
//! let compactor = Compactor::new(store.clone(), CompactionConfig::default());
//! let plan = CompactionPlan::new(vec![a.id(), b.id()], 1);
//! let outcome = compactor.compact(&plan, &AbortHandle::new())?;
//! ```

#![deny(missing_docs)]

pub mod compact;
pub mod error;
pub mod tsm;

pub use compact::{
    AbortHandle, BlockGroup, CompactionConfig, CompactionOutcome, CompactionPlan,
    CompactionPlanner, Compactor, FileSet, FileStore, LevelPlanner, MergeIterator, MergeStats,
};
pub use error::{ErrorKind, Result, TsmError};
pub use tsm::{
    BlockDescriptor, EncodedBlock, FileId, Point, SeriesKey, TimeRange, Timestamp,
    TombstoneFilter, TombstoneRange, TsmFile, Value, ValueType,
};
