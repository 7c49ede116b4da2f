//! Compaction driver: runs one pass from plan to committed output.
//!
//! A pass leases its input files, merges every key of their union in key
//! order, writes the blocks to temporary files, validates and renames them,
//! and finally swaps them into the store. Nothing becomes visible until the
//! swap; on error or abort every temporary and renamed output is removed and
//! the inputs stay untouched.

use crate::compact::merge::{BlockGroup, KeyBlocks, MergeIterator, MergeStats};
use crate::compact::planner::{CompactionConfig, CompactionPlan, CompactionPlanner};
use crate::compact::store::{sync_dir, tmp_path, FileStore};
use crate::error::{IoContext, Result, TsmError};
use crate::tsm::block::EncodedBlock;
use crate::tsm::tombstone::{self, TombstoneRange, TombstoneSet};
use crate::tsm::{FileId, SeriesKey, TimeRange, TsmFile, TsmReader, TsmWriter};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag shared between a pass and its owner.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Creates a handle that is not aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the pass to stop before commit.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Returns true once abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(TsmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of a committed pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionOutcome {
    /// Files replaced by the pass.
    pub inputs: Vec<FileId>,
    /// Files produced by the pass. Empty when every point was deleted.
    pub outputs: Vec<FileId>,
    /// Paths of the produced files.
    pub output_paths: Vec<PathBuf>,
    /// Total size of the produced files.
    pub bytes_written: u64,
    /// Merge counters.
    pub stats: MergeStats,
    /// Input tombstones whose whole range fell inside the pass span.
    pub consumed_tombstones: Vec<TombstoneRange>,
    /// Input tombstones reaching outside the pass span. They were applied to
    /// the inputs' own points and stay recorded on the live files outside the
    /// pass that hold matching data; outputs never inherit them.
    pub outstanding_tombstones: Vec<TombstoneRange>,
}

struct Output {
    id: FileId,
    tmp: PathBuf,
    path: PathBuf,
    block_count: u64,
    size: u64,
}

/// Output files of one pass, removed on drop unless committed.
struct OutputSet<'s> {
    store: &'s FileStore,
    plan: &'s CompactionPlan,
    base: FileId,
    current: Option<(TsmWriter, FileId, u64)>,
    finished: Vec<Output>,
    renamed: Vec<PathBuf>,
    committed: bool,
}

impl<'s> OutputSet<'s> {
    fn new(store: &'s FileStore, plan: &'s CompactionPlan, base: FileId) -> Self {
        Self {
            store,
            plan,
            base,
            current: None,
            finished: Vec::new(),
            renamed: Vec::new(),
            committed: false,
        }
    }

    fn write_key(&mut self, key: &SeriesKey, blocks: &[EncodedBlock<'_>]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        if self.current.is_none() {
            let id = self.store.reserve_id(self.base);
            let path = self.store.dir().join(id.file_name());
            let writer = TsmWriter::create(&tmp_path(&path), id, self.plan.target_level)?;
            self.current = Some((writer, id, 0));
        }
        let full = match self.current.as_mut() {
            Some((writer, _, block_count)) => {
                for block in blocks {
                    writer.write_block(key, block)?;
                }
                *block_count += blocks.len() as u64;
                writer.size() >= self.plan.target_file_size
            }
            None => false,
        };
        if full {
            self.roll()?;
        }
        Ok(())
    }

    /// Finishes the current output file, if any.
    fn roll(&mut self) -> Result<()> {
        if let Some((writer, id, block_count)) = self.current.take() {
            let tmp = writer.path().to_path_buf();
            let path = self.store.dir().join(id.file_name());
            // Registered before finishing so a failed finish is still cleaned.
            self.finished.push(Output {
                id,
                tmp,
                path,
                block_count,
                size: 0,
            });
            let size = writer.finish()?;
            if let Some(output) = self.finished.last_mut() {
                output.size = size;
            }
        }
        Ok(())
    }

    fn remove_quietly(path: &std::path::Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to remove {}: {:?}", path.display(), e);
            }
        }
    }
}

impl Drop for OutputSet<'_> {
    fn drop(&mut self) {
        let mut reserved: Vec<FileId> = self.finished.iter().map(|o| o.id).collect();
        if let Some((writer, id, _)) = self.current.take() {
            let tmp = writer.path().to_path_buf();
            drop(writer);
            Self::remove_quietly(&tmp);
            reserved.push(id);
        }
        if !self.committed {
            for output in &self.finished {
                Self::remove_quietly(&output.tmp);
            }
            for path in &self.renamed {
                Self::remove_quietly(path);
                // Late tombstones may already have been written at commit.
                Self::remove_quietly(&tombstone::sidecar_path(path));
            }
            debug!("Removed uncommitted outputs of aborted pass");
        }
        // Committed ids are live by now, discarded ones are gone from disk.
        self.store.release_ids(&reserved);
    }
}

/// Runs compaction passes against a [`FileStore`].
///
/// # Examples
/// ```rust,ignore
/// use std::sync::Arc;
/// use tsmerge::compact::{AbortHandle, CompactionConfig, Compactor, FileStore, LevelPlanner};
///
/// let store = Arc::new(FileStore::open("/data/tsm")?);
/// let config = CompactionConfig::default();
/// let compactor = Compactor::new(store, config.clone());
/// let planner = LevelPlanner::new(config);
/// if let Some(outcome) = compactor.compact_next(&planner, &AbortHandle::new())? {
///     println!("wrote {} bytes", outcome.bytes_written);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Compactor {
    store: Arc<FileStore>,
    config: CompactionConfig,
}

impl Compactor {
    /// Creates a compactor over `store`.
    pub fn new(store: Arc<FileStore>, config: CompactionConfig) -> Self {
        Self { store, config }
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Asks `planner` for a plan over the current snapshot and runs it.
    pub fn compact_next(
        &self,
        planner: &dyn CompactionPlanner,
        abort: &AbortHandle,
    ) -> Result<Option<CompactionOutcome>> {
        let snapshot = self.store.snapshot();
        let Some(plan) = planner.plan(&snapshot, &self.store.leased()) else {
            return Ok(None);
        };
        drop(snapshot);
        self.compact(&plan, abort)
    }

    /// Runs `plan` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        &self,
        plan: CompactionPlan,
        abort: AbortHandle,
    ) -> Result<JoinHandle<Result<Option<CompactionOutcome>>>> {
        let compactor = self.clone();
        let handle = thread::Builder::new()
            .name("tsm-compactor".to_string())
            .spawn(move || compactor.compact(&plan, &abort))?;
        Ok(handle)
    }

    /// Runs one compaction pass.
    ///
    /// Blocks while another pass holds any of the plan's files. Returns
    /// `Ok(None)` when the plan is empty, names a file that is no longer
    /// live, or is not a contiguous run of the live set (see
    /// [`FileSet::is_compactable_run`](crate::compact::FileSet::is_compactable_run)).
    /// Outputs rank right after the newest input, so a gap would let older
    /// data overtake the files in between.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::Cancelled` if aborted, `TsmError::CorruptBlock` if
    /// an input block is damaged, or an I/O error. Inputs are untouched.
    pub fn compact(
        &self,
        plan: &CompactionPlan,
        abort: &AbortHandle,
    ) -> Result<Option<CompactionOutcome>> {
        if plan.inputs.is_empty() {
            return Ok(None);
        }
        let _lease = self.store.lease(&plan.inputs);

        let snapshot = self.store.snapshot();
        let inputs: Option<Vec<Arc<TsmFile>>> = plan
            .inputs
            .iter()
            .map(|id| snapshot.get(*id).cloned())
            .collect();
        let contiguous = snapshot.is_compactable_run(&plan.inputs);
        drop(snapshot);
        let Some(inputs) = inputs else {
            info!("Skipping stale compaction plan over {} files", plan.inputs.len());
            return Ok(None);
        };
        if !contiguous {
            warn!(
                "Skipping compaction plan over {} files: inputs are not a contiguous run of the live set",
                plan.inputs.len()
            );
            return Ok(None);
        }

        info!(
            "Compacting {} files into level {}",
            inputs.len(),
            plan.target_level
        );
        let started = Instant::now();
        let base = output_base(&plan.inputs);
        let mut outputs = OutputSet::new(&self.store, plan, base);

        match self.run(plan, &inputs, &mut outputs, abort) {
            Ok(outcome) => {
                outputs.committed = true;
                info!(
                    "Compaction of {} files committed {} outputs ({} bytes, {} points, {} duplicates, {} deleted) in {:?}",
                    outcome.inputs.len(),
                    outcome.outputs.len(),
                    outcome.bytes_written,
                    outcome.stats.points_merged,
                    outcome.stats.duplicates_resolved,
                    outcome.stats.points_deleted,
                    started.elapsed()
                );
                Ok(Some(outcome))
            }
            Err(TsmError::Cancelled) => {
                info!("Compaction of {} files cancelled", inputs.len());
                Err(TsmError::Cancelled)
            }
            Err(e) => {
                error!("Compaction of {} files failed: {}", inputs.len(), e);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        plan: &CompactionPlan,
        inputs: &[Arc<TsmFile>],
        outputs: &mut OutputSet<'_>,
        abort: &AbortHandle,
    ) -> Result<CompactionOutcome> {
        abort.check()?;

        let mut tombstones = TombstoneSet::new();
        let mut seen = Vec::with_capacity(inputs.len());
        for file in inputs {
            let ranges = file.tombstones();
            seen.push(ranges.len());
            tombstones.extend(file.id(), &ranges);
        }
        let span = inputs
            .iter()
            .filter_map(|f| f.time_range())
            .reduce(|a, b| a.union(&b))
            // No data: every range is applied vacuously.
            .unwrap_or_else(TimeRange::all);
        let (consumed, outstanding) = tombstones.partition(span);

        let keys: Vec<&SeriesKey> = inputs
            .iter()
            .flat_map(|f| f.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        debug!(
            "Merging {} keys with {} tombstones ({} outstanding)",
            keys.len(),
            tombstones.len(),
            outstanding.len()
        );

        // Each block carries its own file's tombstones, so the merge applies
        // every input range to exactly the points it was recorded against.
        let stats = self.merge_keys(&keys, inputs, outputs, abort)?;
        outputs.roll()?;
        abort.check()?;

        for output in &outputs.finished {
            let reader = TsmReader::open(&output.tmp)?;
            if reader.footer().block_count != output.block_count {
                return Err(TsmError::corrupt_file(
                    &output.tmp,
                    format!(
                        "wrote {} blocks but file holds {}",
                        output.block_count,
                        reader.footer().block_count
                    ),
                ));
            }
        }
        abort.check()?;

        for output in &outputs.finished {
            outputs.renamed.push(output.path.clone());
            fs::rename(&output.tmp, &output.path).with_path(&output.path)?;
        }
        sync_dir(self.store.dir())?;

        let opened = outputs
            .finished
            .iter()
            .map(|o| TsmFile::open(&o.path).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        self.store.commit(inputs, &seen, &opened)?;

        Ok(CompactionOutcome {
            inputs: plan.inputs.clone(),
            outputs: outputs.finished.iter().map(|o| o.id).collect(),
            output_paths: outputs.finished.iter().map(|o| o.path.clone()).collect(),
            bytes_written: outputs.finished.iter().map(|o| o.size).sum(),
            stats,
            consumed_tombstones: consumed,
            outstanding_tombstones: outstanding,
        })
    }

    /// Merges keys in batches and feeds the single ordered writer.
    fn merge_keys(
        &self,
        keys: &[&SeriesKey],
        inputs: &[Arc<TsmFile>],
        outputs: &mut OutputSet<'_>,
        abort: &AbortHandle,
    ) -> Result<MergeStats> {
        let max_points = self.config.max_points_per_block.max(1);
        let batches: Vec<&[&SeriesKey]> = keys.chunks(self.config.keys_per_batch.max(1)).collect();
        let mut stats = MergeStats::default();

        for wave in batches.chunks(self.config.parallelism.max(1)) {
            abort.check()?;
            let results: Vec<Result<(Vec<KeyBlocks<'_>>, MergeStats)>> = if wave.len() > 1 {
                wave.par_iter()
                    .map(|batch| merge_batch(batch, inputs, max_points, abort))
                    .collect()
            } else {
                wave.iter()
                    .map(|batch| merge_batch(batch, inputs, max_points, abort))
                    .collect()
            };
            for result in results {
                let (merged, batch_stats) = result?;
                stats += batch_stats;
                for key_blocks in &merged {
                    outputs.write_key(&key_blocks.key, &key_blocks.blocks)?;
                }
            }
        }
        Ok(stats)
    }
}

/// Merges one batch of keys.
fn merge_batch<'a>(
    keys: &[&SeriesKey],
    inputs: &'a [Arc<TsmFile>],
    max_points: usize,
    abort: &AbortHandle,
) -> Result<(Vec<KeyBlocks<'a>>, MergeStats)> {
    let groups = keys
        .iter()
        .filter_map(|key| BlockGroup::from_files(key, inputs));
    let mut merge = MergeIterator::new(groups, max_points);
    let mut merged = Vec::with_capacity(keys.len());
    while let Some(result) = merge.next_key() {
        abort.check()?;
        merged.push(result?);
    }
    Ok((merged, merge.stats()))
}

/// Base id for outputs: the newest input's generation, one sequence past the
/// newest sequence used in that generation.
fn output_base(inputs: &[FileId]) -> FileId {
    let generation = inputs.iter().map(|id| id.generation).max().unwrap_or(0);
    let sequence = inputs
        .iter()
        .filter(|id| id.generation == generation)
        .map(|id| id.sequence)
        .max()
        .unwrap_or(0);
    FileId::new(generation, sequence + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsm::Point;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn flush(store: &FileStore, key: &str, ts: i64) -> FileId {
        let mut series = BTreeMap::new();
        series.insert(SeriesKey::from(key), vec![Point::float(ts, ts as f64)]);
        store.flush(&series, 1000).unwrap().id()
    }

    #[test]
    fn test_output_base() {
        assert_eq!(
            output_base(&[FileId::new(3, 0), FileId::new(5, 0), FileId::new(5, 2)]),
            FileId::new(5, 3)
        );
        assert_eq!(output_base(&[FileId::new(1, 0)]), FileId::new(1, 1));
    }

    #[test]
    fn test_abort_handle() {
        let abort = AbortHandle::new();
        let clone = abort.clone();
        assert!(abort.check().is_ok());
        clone.abort();
        assert!(abort.is_aborted());
        assert!(matches!(abort.check(), Err(TsmError::Cancelled)));
    }

    #[test]
    fn test_output_ids_released_after_pass() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let compactor = Compactor::new(Arc::clone(&store), CompactionConfig::default().with_parallelism(1));

        let inputs = vec![flush(&store, "cpu", 1), flush(&store, "mem", 2)];
        // One output per key.
        let plan = CompactionPlan::new(inputs, 1).with_target_file_size(1);
        let outcome = compactor.compact(&plan, &AbortHandle::new()).unwrap().unwrap();
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(store.reserved_count(), 0);

        let abort = AbortHandle::new();
        abort.abort();
        let plan = CompactionPlan::new(outcome.outputs.clone(), 1);
        assert!(matches!(compactor.compact(&plan, &abort), Err(TsmError::Cancelled)));
        assert_eq!(store.reserved_count(), 0);
    }
}
