//! The live file set, snapshot reads and pass coordination.
//!
//! Readers clone an `Arc<FileSet>` and never wait on compaction. A pass swaps
//! in a new set under a short write lock; replaced files are marked obsolete
//! and removed from disk when the last snapshot holding them is dropped.

use crate::compact::merge::{merge_points, BlockGroup};
use crate::error::{IoContext, Result, TsmError};
use crate::tsm::block::EncodedBlock;
use crate::tsm::tombstone::TombstoneRange;
use crate::tsm::{FileId, Point, SeriesKey, TimeRange, TsmFile, TsmWriter};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Suffix of files still being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// Immutable set of open files, ordered by id.
#[derive(Debug, Default)]
pub struct FileSet {
    files: Vec<Arc<TsmFile>>,
}

impl FileSet {
    /// Creates a set, sorting files by id.
    pub fn new(mut files: Vec<Arc<TsmFile>>) -> Self {
        files.sort_by_key(|f| f.id());
        Self { files }
    }

    /// Returns the files in id order.
    pub fn files(&self) -> &[Arc<TsmFile>] {
        &self.files
    }

    /// Iterates the files in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TsmFile>> {
        self.files.iter()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the set holds no file.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Looks up a file by id.
    pub fn get(&self, id: FileId) -> Option<&Arc<TsmFile>> {
        self.files
            .binary_search_by_key(&id, |f| f.id())
            .ok()
            .map(|i| &self.files[i])
    }

    /// Returns true if the set holds `id`.
    pub fn contains(&self, id: FileId) -> bool {
        self.get(id).is_some()
    }

    /// Returns every file id in ascending order.
    pub fn ids(&self) -> Vec<FileId> {
        self.files.iter().map(|f| f.id()).collect()
    }

    /// Total size of all files in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size()).sum()
    }

    /// Sorted union of keys across all files.
    pub fn keys(&self) -> Vec<SeriesKey> {
        let keys: BTreeSet<&SeriesKey> = self.files.iter().flat_map(|f| f.keys()).collect();
        keys.into_iter().cloned().collect()
    }

    /// Reads the merged, tombstone-filtered points of `key` within `range`.
    ///
    /// Overlapping files resolve exactly as a compaction of the whole set
    /// would: the most recent write wins, then the winner is dropped if its
    /// own file recorded a deletion over it.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptBlock` if a block fails to decode.
    pub fn read_points(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Point>> {
        let Some(group) = BlockGroup::from_files(key, self.files.as_slice()) else {
            return Ok(Vec::new());
        };
        let mut points = merge_points(&group)?;
        points.retain(|p| range.contains(p.timestamp));
        Ok(points)
    }

    /// Checks that `ids` can be replaced by files ranked right after the
    /// newest of them.
    ///
    /// `ids` must be sorted, live and adjacent in id order, and the next
    /// live file (if any) must belong to a newer generation. Otherwise an
    /// output would either skip over an uncompacted file in between or sort
    /// after a newer file of the same generation.
    pub fn is_compactable_run(&self, ids: &[FileId]) -> bool {
        let Some(first) = ids.first() else {
            return false;
        };
        let Ok(start) = self.files.binary_search_by_key(first, |f| f.id()) else {
            return false;
        };
        let end = start + ids.len();
        let Some(run) = self.files.get(start..end) else {
            return false;
        };
        if !run.iter().map(|f| f.id()).eq(ids.iter().copied()) {
            return false;
        }
        let last = ids[ids.len() - 1];
        self.files
            .get(end)
            .map_or(true, |next| next.id().generation > last.generation)
    }
}

/// Exclusive claim on a set of files, released on drop.
#[derive(Debug)]
pub struct Lease<'s> {
    store: &'s FileStore,
    ids: Vec<FileId>,
}

impl Lease<'_> {
    /// Returns the leased ids.
    pub fn ids(&self) -> &[FileId] {
        &self.ids
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut held = self.store.leases.lock();
        for id in &self.ids {
            held.remove(id);
        }
        self.store.lease_released.notify_all();
    }
}

/// Directory of TSM files with atomic snapshot swaps.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    current: RwLock<Arc<FileSet>>,
    leases: Mutex<HashSet<FileId>>,
    lease_released: Condvar,
    reserved: Mutex<HashSet<FileId>>,
    commit_lock: Mutex<()>,
    next_generation: AtomicU64,
}

impl FileStore {
    /// Opens every TSM file in `dir`, creating the directory if needed.
    ///
    /// Leftover temporary files from an interrupted pass are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file is corrupt.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_path(&dir)?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let path = entry.with_path(&dir)?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                warn!("Removing leftover temporary file {}", path.display());
                fs::remove_file(&path).with_path(&path)?;
                continue;
            }
            let Some(id) = FileId::parse_file_name(name) else {
                continue;
            };
            let file = TsmFile::open(&path)?;
            if file.id() != id {
                return Err(TsmError::corrupt_file(
                    &path,
                    format!("header id {} does not match file name", file.id()),
                ));
            }
            files.push(Arc::new(file));
        }

        let next_generation = files.iter().map(|f| f.id().generation + 1).max().unwrap_or(1);
        info!("Opened file store {} with {} files", dir.display(), files.len());

        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(FileSet::new(files))),
            leases: Mutex::new(HashSet::new()),
            lease_released: Condvar::new(),
            reserved: Mutex::new(HashSet::new()),
            commit_lock: Mutex::new(()),
            next_generation: AtomicU64::new(next_generation),
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the current file set.
    pub fn snapshot(&self) -> Arc<FileSet> {
        Arc::clone(&self.current.read())
    }

    /// Reads `key` from the current snapshot.
    pub fn read_points(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Point>> {
        self.snapshot().read_points(key, range)
    }

    /// Writes `series` as a new level-0 file and adds it to the set.
    ///
    /// Points of each key must have strictly increasing timestamps and one
    /// value type. Empty series are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn flush(
        &self,
        series: &BTreeMap<SeriesKey, Vec<Point>>,
        max_points_per_block: usize,
    ) -> Result<Arc<TsmFile>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let id = self.reserve_id(FileId::new(generation, 0));
        let path = self.dir.join(id.file_name());
        let tmp_path = tmp_path(&path);

        let result = self
            .write_series(&tmp_path, &path, id, series, max_points_per_block)
            .and_then(|()| TsmFile::open(&path));
        let file = match result {
            Ok(file) => Arc::new(file),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp_path) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        error!(
                            "Failed to remove {} after failed flush: {:?}",
                            tmp_path.display(),
                            cleanup
                        );
                    }
                }
                self.release_ids(&[id]);
                return Err(e);
            }
        };
        self.install(Arc::clone(&file));
        self.release_ids(&[id]);
        debug!("Flushed {} keys to {}", series.len(), path.display());
        Ok(file)
    }

    fn write_series(
        &self,
        tmp_path: &Path,
        path: &Path,
        id: FileId,
        series: &BTreeMap<SeriesKey, Vec<Point>>,
        max_points_per_block: usize,
    ) -> Result<()> {
        let mut writer = TsmWriter::create(tmp_path, id, 0)?;
        for (key, points) in series {
            for chunk in points.chunks(max_points_per_block.max(1)) {
                let block = EncodedBlock::encode(chunk[0].value.value_type(), chunk);
                writer.write_block(key, &block)?;
            }
        }
        writer.finish()?;
        fs::rename(tmp_path, path).with_path(path)?;
        sync_dir(&self.dir)
    }

    /// Opens an existing TSM file and adds it to the set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or corrupt.
    pub fn add_file(&self, path: &Path) -> Result<Arc<TsmFile>> {
        let file = Arc::new(TsmFile::open(path)?);
        self.next_generation
            .fetch_max(file.id().generation + 1, Ordering::SeqCst);
        self.install(Arc::clone(&file));
        Ok(file)
    }

    fn install(&self, file: Arc<TsmFile>) {
        let _guard = self.commit_lock.lock();
        let mut current = self.current.write();
        let mut files = current.files.clone();
        files.push(file);
        *current = Arc::new(FileSet::new(files));
    }

    /// Records deletions against every live file that may hold matching data.
    ///
    /// Returns the number of files that received at least one range.
    ///
    /// # Errors
    ///
    /// Returns an error if a tombstone sidecar cannot be written.
    pub fn delete(&self, ranges: &[TombstoneRange]) -> Result<usize> {
        let _guard = self.commit_lock.lock();
        let snapshot = self.snapshot();
        let mut touched = 0;
        for file in snapshot.iter() {
            let Some(span) = file.time_range() else {
                continue;
            };
            let matching: Vec<TombstoneRange> = ranges
                .iter()
                .filter(|r| {
                    r.min <= r.max
                        && span.overlaps(r.min, r.max)
                        && r.key.as_ref().map_or(true, |k| file.contains_key(k))
                })
                .cloned()
                .collect();
            if !matching.is_empty() {
                file.add_tombstones(&matching)?;
                touched += 1;
            }
        }
        debug!("Recorded {} tombstones on {} files", ranges.len(), touched);
        Ok(touched)
    }

    /// Claims `ids`, blocking while any of them is held by another pass.
    pub fn lease(&self, ids: &[FileId]) -> Lease<'_> {
        let mut held = self.leases.lock();
        while ids.iter().any(|id| held.contains(id)) {
            self.lease_released.wait(&mut held);
        }
        held.extend(ids.iter().copied());
        Lease {
            store: self,
            ids: ids.to_vec(),
        }
    }

    /// Claims `ids` only if none of them is held.
    pub fn try_lease(&self, ids: &[FileId]) -> Option<Lease<'_>> {
        let mut held = self.leases.lock();
        if ids.iter().any(|id| held.contains(id)) {
            return None;
        }
        held.extend(ids.iter().copied());
        Some(Lease {
            store: self,
            ids: ids.to_vec(),
        })
    }

    /// Returns the ids currently held by running passes.
    pub fn leased(&self) -> HashSet<FileId> {
        self.leases.lock().clone()
    }

    /// Reserves the first unused id at or after `base` within its generation.
    ///
    /// The id stays reserved until [`FileStore::release_ids`] is called,
    /// once the file is live or discarded.
    pub(crate) fn reserve_id(&self, base: FileId) -> FileId {
        let mut reserved = self.reserved.lock();
        let snapshot = self.snapshot();
        let mut id = base;
        while reserved.contains(&id)
            || snapshot.contains(id)
            || self.dir.join(id.file_name()).exists()
        {
            id = FileId::new(id.generation, id.sequence + 1);
        }
        reserved.insert(id);
        id
    }

    /// Returns reserved ids to the pool.
    pub(crate) fn release_ids(&self, ids: &[FileId]) {
        let mut reserved = self.reserved.lock();
        for id in ids {
            reserved.remove(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    /// Replaces `inputs` with `outputs` in the live set.
    ///
    /// `seen` holds, per input, how many tombstones the pass observed.
    /// Tombstones recorded after that are carried onto every output, whose
    /// points all predate them, so no delete is lost. Inputs are marked
    /// obsolete once swapped out.
    pub(crate) fn commit(
        &self,
        inputs: &[Arc<TsmFile>],
        seen: &[usize],
        outputs: &[Arc<TsmFile>],
    ) -> Result<()> {
        let _guard = self.commit_lock.lock();

        let late: Vec<TombstoneRange> = inputs
            .iter()
            .zip(seen)
            .flat_map(|(file, &n)| file.tombstones().into_iter().skip(n))
            .collect();
        if !late.is_empty() {
            debug!("Carrying {} late tombstones onto outputs", late.len());
            for output in outputs {
                output.add_tombstones(&late)?;
            }
        }

        let replaced: HashSet<FileId> = inputs.iter().map(|f| f.id()).collect();
        {
            let mut current = self.current.write();
            let files: Vec<Arc<TsmFile>> = current
                .files
                .iter()
                .filter(|f| !replaced.contains(&f.id()))
                .cloned()
                .chain(outputs.iter().cloned())
                .collect();
            *current = Arc::new(FileSet::new(files));
        }

        for input in inputs {
            input.mark_obsolete();
        }
        Ok(())
    }
}

/// Returns the temporary path used while writing `path`.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Persists directory entries (renames, creations).
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir).with_path(dir)?.sync_all().with_path(dir)
}
