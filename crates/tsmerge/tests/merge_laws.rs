//! Property tests: a compaction pass preserves the visible view of the data.
//!
//! For random interleavings of file writes and deletions, the store must read
//! the same points before and after a pass, and that view must match a simple
//! model: the newest file wins a timestamp, and the winner disappears only if
//! a deletion issued after its file was written covers it.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;
use tsmerge::compact::{AbortHandle, CompactionConfig, CompactionPlan, Compactor, FileStore};
use tsmerge::tsm::{EncodedBlock, FileId, Point, SeriesKey, TimeRange, TombstoneRange, TsmWriter};

const KEYS: [&str; 2] = ["cpu", "mem"];

/// Per file, per key: the timestamps written.
type FileLayout = Vec<BTreeSet<i64>>;

/// (key index or wildcard, min, width)
type DeleteCase = (usize, i64, i64);

fn file_strategy() -> impl Strategy<Value = FileLayout> {
    prop::collection::vec(prop::collection::btree_set(0i64..200, 0..40), KEYS.len())
}

fn delete_strategy() -> impl Strategy<Value = DeleteCase> {
    (0..=KEYS.len(), 0i64..200, 0i64..60)
}

#[derive(Debug, Clone)]
enum Op {
    Write(FileLayout),
    Delete(DeleteCase),
}

/// A first write, then writes and deletes in any order.
fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        2 => file_strategy().prop_map(Op::Write),
        1 => delete_strategy().prop_map(Op::Delete),
    ];
    (file_strategy(), prop::collection::vec(op, 0..8)).prop_map(|(first, rest)| {
        let mut ops = vec![Op::Write(first)];
        ops.extend(rest);
        ops
    })
}

fn value_of(file: usize, ts: i64) -> i64 {
    (file as i64) * 1000 + ts
}

fn tombstone(case: &DeleteCase) -> TombstoneRange {
    let &(target, min, width) = case;
    match KEYS.get(target) {
        Some(name) => TombstoneRange::for_key(*name, min, min + width),
        None => TombstoneRange::wildcard(min, min + width),
    }
}

fn write_file(store: &FileStore, i: usize, layout: &FileLayout) -> FileId {
    let id = FileId::new(i as u64 + 1, 0);
    let path = store.dir().join(id.file_name());
    let mut writer = TsmWriter::create(&path, id, 0).unwrap();
    for (name, timestamps) in KEYS.iter().zip(layout) {
        let points: Vec<Point> = timestamps
            .iter()
            .map(|&ts| Point::integer(ts, value_of(i, ts)))
            .collect();
        // Small blocks so groups hold several blocks per file.
        for chunk in points.chunks(7) {
            let block = EncodedBlock::encode(chunk[0].value.value_type(), chunk);
            writer.write_block(&SeriesKey::from(*name), &block).unwrap();
        }
    }
    writer.finish().unwrap();
    store.add_file(&path).unwrap().id()
}

/// Applies `ops` in order and returns the written file ids.
fn apply(store: &FileStore, ops: &[Op]) -> Vec<FileId> {
    let mut ids = Vec::new();
    for op in ops {
        match op {
            Op::Write(layout) => ids.push(write_file(store, ids.len(), layout)),
            Op::Delete(case) => {
                store.delete(&[tombstone(case)]).unwrap();
            }
        }
    }
    ids
}

/// A deletion reaches the files written before it, never later ones.
fn model(ops: &[Op]) -> BTreeMap<SeriesKey, Vec<Point>> {
    let mut files: Vec<(&FileLayout, Vec<TombstoneRange>)> = Vec::new();
    for op in ops {
        match op {
            Op::Write(layout) => files.push((layout, Vec::new())),
            Op::Delete(case) => {
                for (_, deleted) in &mut files {
                    deleted.push(tombstone(case));
                }
            }
        }
    }

    let mut view = BTreeMap::new();
    for (k, name) in KEYS.iter().enumerate() {
        let key = SeriesKey::from(*name);
        // Newest writer of each timestamp.
        let mut latest: BTreeMap<i64, usize> = BTreeMap::new();
        for (i, (layout, _)) in files.iter().enumerate() {
            for &ts in &layout[k] {
                latest.insert(ts, i);
            }
        }
        let points: Vec<Point> = latest
            .into_iter()
            .filter(|&(ts, i)| {
                !files[i]
                    .1
                    .iter()
                    .any(|r| r.applies_to(&key) && r.time_range().contains(ts))
            })
            .map(|(ts, i)| Point::integer(ts, value_of(i, ts)))
            .collect();
        view.insert(key, points);
    }
    view
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn compaction_preserves_visible_points(
        ops in ops_strategy(),
        max_points in 1usize..50,
        parallelism in 1usize..3,
    ) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let inputs = apply(&store, &ops);

        let expected = model(&ops);
        for (key, points) in &expected {
            prop_assert_eq!(&store.read_points(key, TimeRange::all()).unwrap(), points);
        }

        let config = CompactionConfig::default()
            .with_max_points_per_block(max_points)
            .with_parallelism(parallelism)
            .with_keys_per_batch(1);
        let compactor = Compactor::new(Arc::clone(&store), config);
        let outcome = compactor
            .compact(&CompactionPlan::new(inputs, 1), &AbortHandle::new())
            .unwrap()
            .unwrap();

        let total: usize = expected.values().map(Vec::len).sum();
        prop_assert_eq!(outcome.stats.points_merged, total as u64);

        for (key, points) in &expected {
            prop_assert_eq!(&store.read_points(key, TimeRange::all()).unwrap(), points);
        }

        let snapshot = store.snapshot();
        for file in snapshot.iter() {
            for key in file.keys() {
                let blocks = file.blocks(key);
                prop_assert!(!blocks.is_empty());
                for block in &blocks {
                    prop_assert!(block.point_count() as usize <= max_points);
                    prop_assert!(block.point_count() > 0);
                }
                for pair in blocks.windows(2) {
                    prop_assert!(pair[0].time_range().max < pair[1].time_range().min);
                }
            }
        }
    }
}
