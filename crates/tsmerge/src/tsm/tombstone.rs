//! Deletion ranges, the per-key deletion filter, and tombstone sidecar files.
//!
//! Deletes are recorded as [`TombstoneRange`]s in an append-only sidecar next
//! to each TSM file. A range deletes points of the file it was recorded
//! against and nothing else: every block of that file carries a
//! [`TombstoneFilter`] with the minimal disjoint set of ranges for its key.
//! A compaction pass gathers its inputs' ranges into a [`TombstoneSet`] only
//! to report which of them it consumed.

use crate::error::{IoContext, Result, TsmError};
use crate::tsm::{FileId, SeriesKey, TimeRange, Timestamp};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sidecar file extension, appended to the TSM file name.
pub const TOMBSTONE_EXTENSION: &str = "tombstone";

/// Record header: length (4) + crc (4).
const RECORD_HEADER_SIZE: usize = 8;

/// A deletion of every point of `key` (or of every key) in `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TombstoneRange {
    /// Target series; `None` applies to all keys.
    pub key: Option<SeriesKey>,
    /// Minimum timestamp (inclusive).
    pub min: Timestamp,
    /// Maximum timestamp (inclusive).
    pub max: Timestamp,
}

impl TombstoneRange {
    /// Deletes `[min, max]` for one key.
    pub fn for_key(key: impl Into<SeriesKey>, min: Timestamp, max: Timestamp) -> Self {
        Self {
            key: Some(key.into()),
            min,
            max,
        }
    }

    /// Deletes `[min, max]` for every key.
    pub fn wildcard(min: Timestamp, max: Timestamp) -> Self {
        Self {
            key: None,
            min,
            max,
        }
    }

    /// Returns true if the range targets `key`.
    pub fn applies_to(&self, key: &SeriesKey) -> bool {
        self.key.as_ref().map_or(true, |k| k == key)
    }

    /// Returns the deleted time range.
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min, self.max)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let key = self.key.as_ref().map_or(&[][..], SeriesKey::as_bytes);
        let mut buf = Vec::with_capacity(1 + 4 + key.len() + 16);
        buf.push(u8::from(self.key.is_some()));
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&self.min.to_le_bytes());
        buf.extend_from_slice(&self.max.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let has_key = match *buf.first()? {
            0 => false,
            1 => true,
            _ => return None,
        };
        let key_len = u32::from_le_bytes(buf.get(1..5)?.try_into().ok()?) as usize;
        let key_end = 5usize.checked_add(key_len)?;
        let key = buf.get(5..key_end)?;
        let rest = buf.get(key_end..)?;
        if rest.len() != 16 || (!has_key && key_len != 0) {
            return None;
        }
        let min = i64::from_le_bytes(rest[..8].try_into().ok()?);
        let max = i64::from_le_bytes(rest[8..].try_into().ok()?);
        Some(Self {
            key: has_key.then(|| SeriesKey::from(key)),
            min,
            max,
        })
    }
}

/// Minimal disjoint set of deleted ranges for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneFilter {
    ranges: Vec<TimeRange>,
}

impl TombstoneFilter {
    /// Builds the filter for `key` from every candidate range.
    ///
    /// Ranges for other keys are ignored. The rest are sorted and merged;
    /// overlapping and adjacent ranges (`a.max + 1 == b.min`) coalesce.
    pub fn new<'r>(key: &SeriesKey, ranges: impl IntoIterator<Item = &'r TombstoneRange>) -> Self {
        let mut matching: Vec<TimeRange> = ranges
            .into_iter()
            .filter(|r| r.applies_to(key) && r.min <= r.max)
            .map(TombstoneRange::time_range)
            .collect();
        Self::from_time_ranges(&mut matching)
    }

    /// Builds a filter from raw time ranges, all of which apply.
    pub fn from_time_ranges(ranges: &mut [TimeRange]) -> Self {
        ranges.sort_unstable_by_key(|r| (r.min, r.max));

        let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
        for range in ranges.iter().filter(|r| r.min <= r.max) {
            match merged.last_mut() {
                Some(last) if range.min <= last.max.saturating_add(1) => {
                    last.max = last.max.max(range.max);
                }
                _ => merged.push(*range),
            }
        }
        Self { ranges: merged }
    }

    /// Returns true if no range applies.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the merged ranges in ascending order.
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    /// First range that ends at or after `ts`.
    fn first_ending_at_or_after(&self, ts: Timestamp) -> Option<&TimeRange> {
        let idx = self.ranges.partition_point(|r| r.max < ts);
        self.ranges.get(idx)
    }

    /// Returns true if `ts` is deleted.
    pub fn is_deleted(&self, ts: Timestamp) -> bool {
        self.first_ending_at_or_after(ts)
            .map_or(false, |r| r.min <= ts)
    }

    /// Returns true if any deleted timestamp falls in `[min, max]`.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.first_ending_at_or_after(min)
            .map_or(false, |r| r.min <= max)
    }

    /// Returns true if every timestamp in `[min, max]` is deleted.
    pub fn covers(&self, min: Timestamp, max: Timestamp) -> bool {
        self.first_ending_at_or_after(min)
            .map_or(false, |r| r.min <= min && max <= r.max)
    }
}

/// Pass-wide tombstones, each tagged with the file it was recorded against.
#[derive(Debug, Clone, Default)]
pub struct TombstoneSet {
    entries: Vec<(FileId, TombstoneRange)>,
}

impl TombstoneSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one range recorded against `origin`.
    pub fn insert(&mut self, origin: FileId, range: TombstoneRange) {
        self.entries.push((origin, range));
    }

    /// Adds every range recorded against `origin`.
    pub fn extend(&mut self, origin: FileId, ranges: &[TombstoneRange]) {
        self.entries
            .extend(ranges.iter().cloned().map(|r| (origin, r)));
    }

    /// Number of recorded ranges, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the set holds no range.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(origin, range)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = &(FileId, TombstoneRange)> {
        self.entries.iter()
    }

    /// Splits ranges into fully applied and outstanding.
    ///
    /// A range is fully applied when `span`, the combined time span of the
    /// compacted inputs, contains it. An outstanding range still names time
    /// outside the pass; it stays recorded on the live files outside the pass
    /// that hold matching data. Both lists are sorted and free of duplicates.
    pub fn partition(&self, span: TimeRange) -> (Vec<TombstoneRange>, Vec<TombstoneRange>) {
        let (mut consumed, mut outstanding): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .map(|(_, r)| r.clone())
            .partition(|r| span.covers(&r.time_range()));
        consumed.sort();
        consumed.dedup();
        outstanding.sort();
        outstanding.dedup();
        (consumed, outstanding)
    }
}

/// Returns the sidecar path for a TSM file path.
pub fn sidecar_path(tsm_path: &Path) -> PathBuf {
    let mut name = tsm_path.as_os_str().to_owned();
    name.push(".");
    name.push(TOMBSTONE_EXTENSION);
    PathBuf::from(name)
}

/// Appends ranges to a sidecar file and syncs it.
pub fn append_sidecar(path: &Path, ranges: &[TombstoneRange]) -> Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for range in ranges {
        let payload = range.to_bytes();
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_path(path)?;
    file.write_all(&buf).with_path(path)?;
    file.sync_all().with_path(path)?;
    debug!("Appended {} tombstones to {}", ranges.len(), path.display());
    Ok(())
}

/// Reads every range from a sidecar file.
///
/// A missing file holds no ranges. A torn final record is skipped with a
/// warning; a damaged record followed by more data is an error.
pub fn read_sidecar(path: &Path) -> Result<Vec<TombstoneRange>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_path(path),
    };

    let mut ranges = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let rest = &buf[pos..];
        if rest.len() < RECORD_HEADER_SIZE {
            warn!(
                "Ignoring torn tombstone record at offset {} in {}",
                pos,
                path.display()
            );
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let end = RECORD_HEADER_SIZE.saturating_add(len);
        if rest.len() < end {
            warn!(
                "Ignoring torn tombstone record at offset {} in {}",
                pos,
                path.display()
            );
            break;
        }

        let payload = &rest[RECORD_HEADER_SIZE..end];
        let is_last = rest.len() == end;
        if crc32fast::hash(payload) != crc {
            if is_last {
                warn!(
                    "Ignoring tombstone record with bad checksum at tail of {}",
                    path.display()
                );
                break;
            }
            return Err(TsmError::corrupt_file(
                path,
                format!("tombstone checksum mismatch at offset {}", pos),
            ));
        }
        let range = TombstoneRange::from_bytes(payload).ok_or_else(|| {
            TsmError::corrupt_file(path, format!("malformed tombstone at offset {}", pos))
        })?;
        ranges.push(range);
        pos += end;
    }
    Ok(ranges)
}
