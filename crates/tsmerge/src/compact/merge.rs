//! K-way block merge with last-write-wins deduplication.
//!
//! Each key's blocks form a [`BlockGroup`]. The merge walks all blocks of a
//! group through a binary heap ordered by timestamp, keeps the most recent
//! value for every timestamp, drops winners deleted by their own file's
//! tombstones and re-chunks the survivors into blocks of at most
//! `max_points_per_block` points.
//!
//! Blocks are decoded lazily: a block stays a pending heap entry keyed by its
//! `min_time` until the merge reaches that timestamp.

use crate::error::Result;
use crate::tsm::block::{BlockDescriptor, EncodedBlock};
use crate::tsm::{Point, SeriesKey, TimeRange, Timestamp, TsmFile, ValueType};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::AddAssign;
use tracing::warn;

/// Every block of one key across the pass's input files.
///
/// Blocks are ordered by source file id, then by `min_time`, so a larger
/// position means a more recent write.
#[derive(Debug)]
pub struct BlockGroup<'a> {
    key: SeriesKey,
    value_type: ValueType,
    blocks: Vec<BlockDescriptor<'a>>,
}

impl<'a> BlockGroup<'a> {
    /// Builds a group from the blocks of `key`.
    ///
    /// # Panics
    ///
    /// Panics if `blocks` is empty or mixes value types.
    pub fn new(key: SeriesKey, mut blocks: Vec<BlockDescriptor<'a>>) -> Self {
        assert!(!blocks.is_empty(), "block group for key {} is empty", key);
        blocks.sort_by_key(|b| (b.source(), b.time_range().min));

        let value_type = blocks[0].value_type();
        for block in &blocks[1..] {
            assert!(
                block.value_type() == value_type,
                "value type mismatch for key {}: {} in {} vs {} in {}",
                key,
                value_type,
                blocks[0].source(),
                block.value_type(),
                block.source()
            );
        }

        Self {
            key,
            value_type,
            blocks,
        }
    }

    /// Collects the blocks of `key` from every file, or `None` if no file
    /// holds the key.
    pub fn from_files<F>(key: &SeriesKey, files: &'a [F]) -> Option<Self>
    where
        F: AsRef<TsmFile>,
    {
        let blocks: Vec<_> = files.iter().flat_map(|f| f.as_ref().blocks(key)).collect();
        (!blocks.is_empty()).then(|| Self::new(key.clone(), blocks))
    }

    /// Returns the group's key.
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Returns the value type shared by every block.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns the blocks in recency order.
    pub fn blocks(&self) -> &[BlockDescriptor<'a>] {
        &self.blocks
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false; groups hold at least one block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Time span of all blocks.
    pub fn time_range(&self) -> TimeRange {
        self.blocks
            .iter()
            .map(BlockDescriptor::time_range)
            .reduce(|a, b| a.union(&b))
            .unwrap_or_else(TimeRange::all)
    }

    /// Stored points across all blocks, duplicates included.
    pub fn point_count(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.point_count())).sum()
    }
}

/// Counters collected while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Points emitted to output blocks.
    pub points_merged: u64,
    /// Tied points discarded in favour of a more recent write.
    pub duplicates_resolved: u64,
    /// Points discarded by a tombstone.
    pub points_deleted: u64,
    /// Blocks copied through without decoding.
    pub blocks_copied: u64,
    /// Blocks produced by encoding merged points.
    pub blocks_reencoded: u64,
}

impl AddAssign for MergeStats {
    fn add_assign(&mut self, other: Self) {
        self.points_merged += other.points_merged;
        self.duplicates_resolved += other.duplicates_resolved;
        self.points_deleted += other.points_deleted;
        self.blocks_copied += other.blocks_copied;
        self.blocks_reencoded += other.blocks_reencoded;
    }
}

/// Heap entry for one block cursor.
///
/// `BinaryHeap` is a max-heap, so the ordering is reversed on timestamp:
/// the greatest entry is the smallest timestamp, then a pending (undecoded)
/// block, then the most recent block.
#[derive(Debug, PartialEq, Eq)]
struct Cursor {
    ts: Timestamp,
    pending: bool,
    block: usize,
    pos: usize,
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ts
            .cmp(&self.ts)
            .then(self.pending.cmp(&other.pending))
            .then(self.block.cmp(&other.block))
            .then(other.pos.cmp(&self.pos))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deduplicating point stream over one group.
struct PointMerger<'g, 'a> {
    blocks: &'g [BlockDescriptor<'a>],
    decoded: Vec<&'g [Point]>,
    heap: BinaryHeap<Cursor>,
    duplicates: u64,
    deleted: u64,
}

impl<'g, 'a> PointMerger<'g, 'a> {
    fn new(group: &'g BlockGroup<'a>) -> Self {
        let heap = group
            .blocks
            .iter()
            .enumerate()
            .map(|(block, desc)| Cursor {
                ts: desc.time_range().min,
                pending: true,
                block,
                pos: 0,
            })
            .collect();
        Self {
            blocks: &group.blocks,
            decoded: vec![&[][..]; group.blocks.len()],
            heap,
            duplicates: 0,
            deleted: 0,
        }
    }

    /// Pushes the cursor's successor, if the block has more points.
    fn advance(&mut self, block: usize, pos: usize) {
        let points = self.decoded[block];
        if let Some(next) = points.get(pos + 1) {
            self.heap.push(Cursor {
                ts: next.timestamp,
                pending: false,
                block,
                pos: pos + 1,
            });
        }
    }

    fn decode(&mut self, block: usize) -> Result<()> {
        let blocks: &'g [BlockDescriptor<'a>] = self.blocks;
        let points = blocks[block].decode()?;
        self.decoded[block] = points;
        if let Some(first) = points.first() {
            self.heap.push(Cursor {
                ts: first.timestamp,
                pending: false,
                block,
                pos: 0,
            });
        }
        Ok(())
    }

    /// Returns the next winning point in timestamp order, with its block.
    fn next_point(&mut self) -> Result<Option<(&'g BlockDescriptor<'a>, &'g Point)>> {
        loop {
            let Some(top) = self.heap.pop() else {
                return Ok(None);
            };
            if top.pending {
                self.decode(top.block)?;
                continue;
            }

            // Pending blocks at this timestamp sort first, so every source
            // holding `top.ts` is decoded by now and `top` is the newest.
            let blocks: &'g [BlockDescriptor<'a>] = self.blocks;
            let points: &'g [Point] = self.decoded[top.block];
            let winner = &points[top.pos];
            self.advance(top.block, top.pos);

            while self.heap.peek().is_some_and(|c| c.ts == top.ts) {
                if let Some(tied) = self.heap.pop() {
                    if tied.pending {
                        self.decode(tied.block)?;
                        continue;
                    }
                    self.duplicates += 1;
                    self.advance(tied.block, tied.pos);
                }
            }
            return Ok(Some((&blocks[top.block], winner)));
        }
    }

    /// Returns the next winner its own file has not deleted.
    ///
    /// A losing write never resurfaces: once the newest write of a timestamp
    /// is deleted, the timestamp is gone from the merge.
    fn next_live(&mut self) -> Result<Option<&'g Point>> {
        while let Some((block, point)) = self.next_point()? {
            if block.is_deleted(point.timestamp) {
                self.deleted += 1;
                continue;
            }
            return Ok(Some(point));
        }
        Ok(None)
    }
}

/// Merges one group and re-chunks the result into output blocks.
///
/// Points are deduplicated first. The winner is then checked against the
/// tombstones of the file that wrote it, so a deletion never reaches a write
/// made after it. A group holding a single conforming, untombstoned block is
/// copied through without decoding if its header and checksum validate.
///
/// # Errors
///
/// Returns `TsmError::CorruptBlock` if a block fails to decode.
///
/// # Panics
///
/// Panics if `max_points` is zero.
pub fn merge_group<'a>(
    group: &BlockGroup<'a>,
    max_points: usize,
    stats: &mut MergeStats,
) -> Result<Vec<EncodedBlock<'a>>> {
    assert!(max_points > 0, "max_points_per_block must be positive");

    if let [only] = group.blocks() {
        let range = only.time_range();
        if only.point_count() as usize <= max_points
            && !only.tombstones().overlaps(range.min, range.max)
        {
            if only.validate_header() {
                stats.blocks_copied += 1;
                stats.points_merged += u64::from(only.point_count());
                return Ok(vec![EncodedBlock::copied(only)]);
            }
            warn!(
                "Block for key {} at offset {} in {} failed validation, re-encoding",
                group.key(),
                only.offset(),
                only.source()
            );
        }
    }

    let value_type = group.value_type();
    let mut merger = PointMerger::new(group);
    let mut out = Vec::new();
    let mut buf: Vec<Point> = Vec::with_capacity(max_points.min(group.point_count() as usize));

    while let Some(point) = merger.next_live()? {
        buf.push(point.clone());
        if buf.len() == max_points {
            out.push(EncodedBlock::encode(value_type, &buf));
            stats.points_merged += buf.len() as u64;
            buf.clear();
        }
    }
    if !buf.is_empty() {
        out.push(EncodedBlock::encode(value_type, &buf));
        stats.points_merged += buf.len() as u64;
    }

    stats.duplicates_resolved += merger.duplicates;
    stats.points_deleted += merger.deleted;
    stats.blocks_reencoded += out.len() as u64;
    Ok(out)
}

/// Merges one group into a single filtered point sequence without chunking.
///
/// This is the read path over a snapshot of overlapping files.
pub fn merge_points(group: &BlockGroup<'_>) -> Result<Vec<Point>> {
    let mut merger = PointMerger::new(group);
    let mut out = Vec::new();
    while let Some(point) = merger.next_live()? {
        out.push(point.clone());
    }
    Ok(out)
}

/// Output of one key: its blocks in ascending time order.
///
/// `blocks` is empty when every point of the key was deleted.
#[derive(Debug)]
pub struct KeyBlocks<'a> {
    /// The series key.
    pub key: SeriesKey,
    /// Output blocks.
    pub blocks: Vec<EncodedBlock<'a>>,
}

/// Drives [`merge_group`] over groups supplied in ascending key order.
///
/// # Examples
/// ```rust,ignore
/// let groups = keys.iter().filter_map(|k| BlockGroup::from_files(k, &files));
/// let mut merge = MergeIterator::new(groups, 1000);
/// while let Some(out) = merge.next_key() {
///     let out = out?;
///     for block in &out.blocks {
///         writer.write_block(&out.key, block)?;
///     }
/// }
/// ```
pub struct MergeIterator<'a, G> {
    groups: G,
    max_points: usize,
    last_key: Option<SeriesKey>,
    stats: MergeStats,
    _blocks: std::marker::PhantomData<EncodedBlock<'a>>,
}

impl<'a, G> MergeIterator<'a, G>
where
    G: Iterator<Item = BlockGroup<'a>>,
{
    /// Creates an iterator emitting blocks of at most `max_points` points.
    ///
    /// # Panics
    ///
    /// Panics if `max_points` is zero.
    pub fn new(groups: G, max_points: usize) -> Self {
        assert!(max_points > 0, "max_points_per_block must be positive");
        Self {
            groups,
            max_points,
            last_key: None,
            stats: MergeStats::default(),
            _blocks: std::marker::PhantomData,
        }
    }

    /// Merges the next key, or returns `None` once every group is drained.
    ///
    /// # Panics
    ///
    /// Panics if groups arrive out of key order.
    pub fn next_key(&mut self) -> Option<Result<KeyBlocks<'a>>> {
        let group = self.groups.next()?;
        if let Some(last) = &self.last_key {
            assert!(
                group.key() > last,
                "group for key {} arrived after {}",
                group.key(),
                last
            );
        }
        self.last_key = Some(group.key().clone());

        let result = merge_group(&group, self.max_points, &mut self.stats);
        Some(result.map(|blocks| KeyBlocks {
            key: group.key().clone(),
            blocks,
        }))
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> MergeStats {
        self.stats
    }
}

impl<'a, G> Iterator for MergeIterator<'a, G>
where
    G: Iterator<Item = BlockGroup<'a>>,
{
    type Item = Result<KeyBlocks<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TsmError;
    use crate::tsm::codec;
    use crate::tsm::tombstone::TombstoneFilter;
    use crate::tsm::FileId;

    /// Owns encoded block bytes so descriptors can borrow them.
    struct Fixture {
        key: SeriesKey,
        blocks: Vec<(FileId, Vec<Point>, Vec<u8>, Vec<TimeRange>)>,
    }

    impl Fixture {
        fn new(key: &str) -> Self {
            Self {
                key: SeriesKey::from(key),
                blocks: Vec::new(),
            }
        }

        fn block(mut self, generation: u64, points: Vec<Point>) -> Self {
            let ty = points[0].value.value_type();
            let data = codec::encode_block(ty, &points);
            self.blocks.push((FileId::new(generation, 0), points, data, Vec::new()));
            self
        }

        /// Records a deletion against the file of the last added block.
        fn deleting(mut self, min: i64, max: i64) -> Self {
            if let Some(last) = self.blocks.last_mut() {
                last.3.push(TimeRange::new(min, max));
            }
            self
        }

        fn group(&self) -> BlockGroup<'_> {
            let descs = self
                .blocks
                .iter()
                .enumerate()
                .map(|(i, (id, points, data, deleted))| {
                    BlockDescriptor::new(
                        &self.key,
                        TimeRange::new(points[0].timestamp, points[points.len() - 1].timestamp),
                        points[0].value.value_type(),
                        points.len() as u32,
                        *id,
                        i as u64 * 100,
                        data,
                    )
                    .with_tombstones(TombstoneFilter::from_time_ranges(&mut deleted.clone()))
                })
                .collect();
            BlockGroup::new(self.key.clone(), descs)
        }
    }

    fn floats(points: &[(i64, f64)]) -> Vec<Point> {
        points.iter().map(|&(t, v)| Point::float(t, v)).collect()
    }

    fn decode_all(blocks: &[EncodedBlock<'_>]) -> Vec<Point> {
        blocks.iter().flat_map(|b| b.decode().unwrap()).collect()
    }

    #[test]
    fn test_newest_write_wins() {
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(10, 1.0), (20, 2.0), (30, 3.0)]))
            .block(2, floats(&[(20, 9.0)]));
        let group = fx.group();
        let mut stats = MergeStats::default();
        let blocks = merge_group(&group, 1000, &mut stats).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(
            decode_all(&blocks),
            floats(&[(10, 1.0), (20, 9.0), (30, 3.0)])
        );
        assert_eq!(stats.duplicates_resolved, 1);
        assert_eq!(stats.points_merged, 3);
        assert_eq!(stats.blocks_reencoded, 1);
    }

    #[test]
    fn test_recency_is_by_file_id_not_input_order() {
        let fx = Fixture::new("cpu")
            .block(5, floats(&[(1, 5.0), (2, 5.0)]))
            .block(3, floats(&[(1, 3.0), (2, 3.0), (3, 3.0)]))
            .block(4, floats(&[(2, 4.0), (3, 4.0)]));
        let points = merge_points(&fx.group()).unwrap();
        assert_eq!(points, floats(&[(1, 5.0), (2, 5.0), (3, 4.0)]));
    }

    #[test]
    fn test_tombstones_applied_after_dedup() {
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(10, 1.0), (20, 2.0)]))
            .deleting(20, 20)
            .block(2, floats(&[(20, 9.0), (30, 3.0)]))
            .deleting(20, 20);
        let mut stats = MergeStats::default();
        let blocks = merge_group(&fx.group(), 1000, &mut stats).unwrap();

        assert_eq!(decode_all(&blocks), floats(&[(10, 1.0), (30, 3.0)]));
        assert_eq!(stats.duplicates_resolved, 1);
        assert_eq!(stats.points_deleted, 1);
    }

    #[test]
    fn test_deletion_spares_later_writes() {
        // The older file was deleted over [0, 100]; the newer one rewrote
        // part of that range afterwards.
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(10, 1.0), (20, 2.0)]))
            .deleting(0, 100)
            .block(2, floats(&[(20, 9.0), (50, 5.0)]));
        let mut stats = MergeStats::default();
        let blocks = merge_group(&fx.group(), 1000, &mut stats).unwrap();

        assert_eq!(decode_all(&blocks), floats(&[(20, 9.0), (50, 5.0)]));
        assert_eq!(stats.duplicates_resolved, 1);
        assert_eq!(stats.points_deleted, 1);
        assert_eq!(merge_points(&fx.group()).unwrap(), decode_all(&blocks));
    }

    #[test]
    fn test_deleted_winner_hides_older_write() {
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(20, 2.0), (30, 3.0)]))
            .block(2, floats(&[(20, 9.0)]))
            .deleting(20, 20);
        assert_eq!(merge_points(&fx.group()).unwrap(), floats(&[(30, 3.0)]));
    }

    #[test]
    fn test_fully_deleted_group_emits_nothing() {
        let fx = Fixture::new("mem")
            .block(1, floats(&[(0, 1.0), (50, 2.0), (100, 3.0)]))
            .deleting(0, 100);
        let mut stats = MergeStats::default();
        let blocks = merge_group(&fx.group(), 1000, &mut stats).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(stats.points_deleted, 3);
    }

    #[test]
    fn test_rechunk_bounds_block_size() {
        let fx = Fixture::new("cpu")
            .block(1, (0..700).map(|i| Point::integer(i * 2, i)).collect())
            .block(2, (0..700).map(|i| Point::integer(i * 2 + 1, -i)).collect());
        let mut stats = MergeStats::default();
        let blocks = merge_group(&fx.group(), 500, &mut stats).unwrap();

        let counts: Vec<u32> = blocks.iter().map(|b| b.point_count).collect();
        assert_eq!(counts, vec![500, 500, 400]);
        let ts: Vec<i64> = decode_all(&blocks).iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, (0..1400).collect::<Vec<_>>());
        for pair in blocks.windows(2) {
            assert!(pair[0].max_time < pair[1].min_time);
        }
    }

    #[test]
    fn test_fast_path_copies_bytes() {
        let fx = Fixture::new("cpu").block(1, floats(&[(1, 1.5), (2, 2.5)]));
        let group = fx.group();
        let mut stats = MergeStats::default();
        let blocks = merge_group(&group, 1000, &mut stats).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data.as_ref(), fx.blocks[0].2.as_slice());
        assert_eq!(stats.blocks_copied, 1);
        assert!(!group.blocks()[0].is_decoded());
    }

    #[test]
    fn test_fast_path_skipped_when_tombstoned_or_oversized() {
        let points = floats(&[(1, 1.5), (2, 2.5), (3, 3.5)]);

        let tombstoned = Fixture::new("cpu").block(1, points.clone()).deleting(3, 10);
        let mut stats = MergeStats::default();
        let blocks = merge_group(&tombstoned.group(), 1000, &mut stats).unwrap();
        assert_eq!(stats.blocks_copied, 0);
        assert_eq!(decode_all(&blocks), floats(&[(1, 1.5), (2, 2.5)]));

        let clean = Fixture::new("cpu").block(1, points);
        let mut stats = MergeStats::default();
        let blocks = merge_group(&clean.group(), 2, &mut stats).unwrap();
        assert_eq!(stats.blocks_copied, 0);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_corrupt_block_falls_back_and_reports() {
        let mut fx = Fixture::new("disk").block(1, floats(&[(1, 1.0), (2, 2.0)]));
        let last = fx.blocks[0].2.len() - 1;
        fx.blocks[0].2[last] ^= 0xff;
        let group = fx.group();
        let mut stats = MergeStats::default();
        let err = merge_group(&group, 1000, &mut stats).unwrap_err();
        match err {
            TsmError::CorruptBlock { key, offset, .. } => {
                assert_eq!(key, "disk");
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_lazy_decode_of_disjoint_blocks() {
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(1, 1.0), (2, 2.0)]))
            .block(2, floats(&[(100, 1.0), (200, 2.0)]));
        let group = fx.group();
        let mut merger = PointMerger::new(&group);
        assert_eq!(merger.next_point().unwrap().unwrap().1.timestamp, 1);
        assert!(group.blocks()[0].is_decoded());
        assert!(!group.blocks()[1].is_decoded());
        assert_eq!(merger.next_point().unwrap().unwrap().1.timestamp, 2);
        let (block, point) = merger.next_point().unwrap().unwrap();
        assert_eq!(point.timestamp, 100);
        assert_eq!(block.source(), FileId::new(2, 0));
        assert!(group.blocks()[1].is_decoded());
    }

    #[test]
    #[should_panic(expected = "value type mismatch")]
    fn test_mixed_value_types_panic() {
        let fx = Fixture::new("cpu")
            .block(1, floats(&[(1, 1.0)]))
            .block(2, vec![Point::integer(2, 1)]);
        fx.group();
    }

    #[test]
    fn test_merge_iterator_drains_keys_in_order() {
        let a = Fixture::new("a").block(1, floats(&[(1, 1.0)]));
        let b = Fixture::new("b").block(1, floats(&[(1, 1.0)])).deleting(0, 10);
        let groups = vec![a.group(), b.group()];
        let mut merge = MergeIterator::new(groups.into_iter(), 1000);

        let first = merge.next_key().unwrap().unwrap();
        assert_eq!(first.key, SeriesKey::from("a"));
        assert_eq!(first.blocks.len(), 1);
        let second = merge.next_key().unwrap().unwrap();
        assert_eq!(second.key, SeriesKey::from("b"));
        assert!(second.blocks.is_empty());
        assert!(merge.next_key().is_none());

        let stats = merge.stats();
        assert_eq!(stats.blocks_copied, 1);
        assert_eq!(stats.points_deleted, 1);
    }
}
