//! Compaction configuration and file selection.

use crate::compact::store::FileSet;
use crate::tsm::{FileId, DEFAULT_MAX_POINTS_PER_BLOCK};
use std::collections::HashSet;

/// Compaction level configuration.
///
/// # Examples
/// ```rust,ignore
/// use tsmerge::compact::LevelConfig;
///
/// let level = LevelConfig {
///     level: 0,
///     max_files: 4,
///     target_file_size: 4 * 1024 * 1024,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelConfig {
    /// Level number (L0, L1, ...).
    pub level: u16,
    /// Max number of files before compaction triggers.
    pub max_files: usize,
    /// Target output file size in bytes.
    pub target_file_size: u64,
}

impl LevelConfig {
    /// Creates a level configuration.
    pub fn new(level: u16, max_files: usize, target_file_size: u64) -> Self {
        Self {
            level,
            max_files,
            target_file_size,
        }
    }
}

/// Compaction configuration.
///
/// # Examples
/// ```rust,ignore
/// use tsmerge::compact::CompactionConfig;
///
/// let config = CompactionConfig::default()
///     .with_max_points_per_block(500)
///     .with_parallelism(4);
/// ```
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Maximum points per output block.
    pub max_points_per_block: usize,
    /// Level configurations sorted by level.
    pub levels: Vec<LevelConfig>,
    /// Number of key batches merged concurrently. 1 merges on the calling
    /// thread.
    pub parallelism: usize,
    /// Keys per merge batch.
    pub keys_per_batch: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_points_per_block: DEFAULT_MAX_POINTS_PER_BLOCK,
            levels: vec![
                LevelConfig::new(0, 4, 4 * 1024 * 1024),
                LevelConfig::new(1, 10, 40 * 1024 * 1024),
                LevelConfig::new(2, 100, 400 * 1024 * 1024),
            ],
            parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            keys_per_batch: 256,
        }
    }
}

impl CompactionConfig {
    /// Sets the maximum points per output block.
    pub fn with_max_points_per_block(mut self, max_points: usize) -> Self {
        self.max_points_per_block = max_points.max(1);
        self
    }

    /// Replaces the level configurations.
    pub fn with_levels(mut self, mut levels: Vec<LevelConfig>) -> Self {
        levels.sort_by_key(|l| l.level);
        self.levels = levels;
        self
    }

    /// Sets the number of concurrently merged batches.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the number of keys per merge batch.
    pub fn with_keys_per_batch(mut self, keys: usize) -> Self {
        self.keys_per_batch = keys.max(1);
        self
    }

    /// Returns level configuration for the given level.
    pub fn level_config(&self, level: u16) -> Option<&LevelConfig> {
        self.levels.iter().find(|config| config.level == level)
    }
}

/// A set of files to merge and where the output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Input files, ascending.
    pub inputs: Vec<FileId>,
    /// Level of the output files.
    pub target_level: u16,
    /// Output files roll over at the first key boundary past this size.
    pub target_file_size: u64,
}

impl CompactionPlan {
    /// Creates a plan with no output size limit.
    pub fn new(mut inputs: Vec<FileId>, target_level: u16) -> Self {
        inputs.sort();
        inputs.dedup();
        Self {
            inputs,
            target_level,
            target_file_size: u64::MAX,
        }
    }

    /// Sets the output roll-over size.
    pub fn with_target_file_size(mut self, size: u64) -> Self {
        self.target_file_size = size.max(1);
        self
    }
}

/// File selection policy.
pub trait CompactionPlanner: Send + Sync {
    /// Picks the next set of files to compact, skipping `leased` ones.
    fn plan(&self, files: &FileSet, leased: &HashSet<FileId>) -> Option<CompactionPlan>;
}

/// Level-based selection: the first level holding more than `max_files`
/// free files is compacted into the next level.
///
/// A pass only takes adjacent files (see [`FileSet::is_compactable_run`]),
/// so a leased file or a file of another level splits a level into runs.
/// The longest run of at least two files is picked, oldest first on ties.
#[derive(Debug, Clone)]
pub struct LevelPlanner {
    config: CompactionConfig,
}

impl LevelPlanner {
    /// Creates a planner over the configured levels.
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }
}

impl CompactionPlanner for LevelPlanner {
    fn plan(&self, files: &FileSet, leased: &HashSet<FileId>) -> Option<CompactionPlan> {
        for level_config in &self.config.levels {
            let runs = free_runs(files, level_config.level, leased);
            let free: usize = runs.iter().map(Vec::len).sum();
            if free <= level_config.max_files {
                continue;
            }
            let Some(run) = runs
                .into_iter()
                .filter(|run| run.len() > 1)
                .rev()
                .max_by_key(Vec::len)
            else {
                continue;
            };
            let target = self.config.level_config(level_config.level + 1)?;
            return Some(
                CompactionPlan::new(run, target.level).with_target_file_size(target.target_file_size),
            );
        }
        None
    }
}

/// Maximal compactable runs of unleased files at `level`, in id order.
fn free_runs(files: &FileSet, level: u16, leased: &HashSet<FileId>) -> Vec<Vec<FileId>> {
    let mut runs = Vec::new();
    let mut run = Vec::new();
    for file in files.iter() {
        if file.level() == level && !leased.contains(&file.id()) {
            run.push(file.id());
        } else if !run.is_empty() {
            runs.push(std::mem::take(&mut run));
        }
    }
    if !run.is_empty() {
        runs.push(run);
    }
    for run in &mut runs {
        // Drop trailing files whose generation continues past the run.
        while !run.is_empty() && !files.is_compactable_run(run) {
            run.pop();
        }
    }
    runs.retain(|run| !run.is_empty());
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::store::FileStore;
    use crate::tsm::{EncodedBlock, Point, SeriesKey, TsmWriter, ValueType};
    use tempfile::TempDir;

    fn add(store: &FileStore, id: FileId, level: u16) -> FileId {
        let path = store.dir().join(id.file_name());
        let mut writer = TsmWriter::create(&path, id, level).unwrap();
        let block = EncodedBlock::encode(ValueType::Float, &[Point::float(id.generation as i64, 1.0)]);
        writer.write_block(&SeriesKey::from("cpu"), &block).unwrap();
        writer.finish().unwrap();
        store.add_file(&path).unwrap().id()
    }

    fn planner(max_files: usize) -> LevelPlanner {
        LevelPlanner::new(CompactionConfig::default().with_levels(vec![
            LevelConfig::new(0, max_files, 1024),
            LevelConfig::new(1, 100, 1024),
        ]))
    }

    #[test]
    fn test_default_config() {
        let config = CompactionConfig::default();
        assert_eq!(config.max_points_per_block, 1000);
        assert_eq!(config.levels.len(), 3);
        assert!(config.parallelism >= 1);
        assert_eq!(config.level_config(1).map(|l| l.max_files), Some(10));
        assert!(config.level_config(7).is_none());
    }

    #[test]
    fn test_builders_clamp_to_one() {
        let config = CompactionConfig::default()
            .with_max_points_per_block(0)
            .with_parallelism(0)
            .with_keys_per_batch(0)
            .with_levels(vec![LevelConfig::new(1, 2, 10), LevelConfig::new(0, 1, 5)]);
        assert_eq!(config.max_points_per_block, 1);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.keys_per_batch, 1);
        assert_eq!(config.levels[0].level, 0);
    }

    #[test]
    fn test_plan_sorts_and_dedups_inputs() {
        let plan = CompactionPlan::new(
            vec![FileId::new(3, 0), FileId::new(1, 0), FileId::new(3, 0)],
            1,
        );
        assert_eq!(plan.inputs, vec![FileId::new(1, 0), FileId::new(3, 0)]);
        assert_eq!(plan.target_file_size, u64::MAX);
    }

    #[test]
    fn test_leased_file_splits_level_into_runs() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let ids: Vec<FileId> = (1..=6).map(|g| add(&store, FileId::new(g, 0), 0)).collect();
        let leased: HashSet<FileId> = [ids[2]].into_iter().collect();
        let snapshot = store.snapshot();

        let plan = planner(3).plan(&snapshot, &leased).unwrap();
        assert_eq!(plan.inputs, ids[3..].to_vec());
        assert_eq!(plan.target_level, 1);
        assert!(snapshot.is_compactable_run(&plan.inputs));
    }

    #[test]
    fn test_other_level_file_splits_level_into_runs() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let a = add(&store, FileId::new(1, 0), 0);
        let b = add(&store, FileId::new(2, 0), 0);
        let c = add(&store, FileId::new(3, 0), 0);
        add(&store, FileId::new(4, 0), 1);
        add(&store, FileId::new(5, 0), 0);
        add(&store, FileId::new(6, 0), 0);

        let plan = planner(3).plan(&store.snapshot(), &HashSet::new()).unwrap();
        assert_eq!(plan.inputs, vec![a, b, c]);
    }

    #[test]
    fn test_run_stops_before_shared_generation() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let a = add(&store, FileId::new(1, 0), 0);
        let b = add(&store, FileId::new(2, 0), 0);
        add(&store, FileId::new(3, 1), 0);
        add(&store, FileId::new(3, 2), 1);

        let plan = planner(1).plan(&store.snapshot(), &HashSet::new()).unwrap();
        assert_eq!(plan.inputs, vec![a, b]);
    }

    #[test]
    fn test_no_plan_when_only_single_files_are_free() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let ids: Vec<FileId> = (1..=5).map(|g| add(&store, FileId::new(g, 0), 0)).collect();
        let leased: HashSet<FileId> = [ids[1], ids[3]].into_iter().collect();
        assert!(planner(2).plan(&store.snapshot(), &leased).is_none());
    }
}
