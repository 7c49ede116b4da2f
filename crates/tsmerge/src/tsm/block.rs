//! Block descriptors over stored blocks, and owned merge output blocks.

use crate::error::{Result, TsmError};
use crate::tsm::codec::{self, BlockHeader};
use crate::tsm::tombstone::TombstoneFilter;
use crate::tsm::{FileId, Point, SeriesKey, TimeRange, Timestamp, ValueType};
use once_cell::unsync::OnceCell;
use std::borrow::Cow;

/// Handle describing one stored block without decoding it.
///
/// The descriptor borrows the encoded bytes from its file's memory map. The
/// first call to [`BlockDescriptor::decode`] decodes and memoizes the points
/// for the descriptor's lifetime; the backing bytes are never modified.
#[derive(Debug)]
pub struct BlockDescriptor<'a> {
    key: &'a SeriesKey,
    range: TimeRange,
    value_type: ValueType,
    point_count: u32,
    source: FileId,
    offset: u64,
    data: &'a [u8],
    tombstones: TombstoneFilter,
    decoded: OnceCell<Vec<Point>>,
}

impl<'a> BlockDescriptor<'a> {
    /// Creates a descriptor from index metadata and the block's bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &'a SeriesKey,
        range: TimeRange,
        value_type: ValueType,
        point_count: u32,
        source: FileId,
        offset: u64,
        data: &'a [u8],
    ) -> Self {
        Self {
            key,
            range,
            value_type,
            point_count,
            source,
            offset,
            data,
            tombstones: TombstoneFilter::default(),
            decoded: OnceCell::new(),
        }
    }

    /// Attaches the deletion ranges recorded against this block's file.
    ///
    /// They apply to this block's points only, never to other files' writes
    /// of the same timestamps.
    pub fn with_tombstones(mut self, tombstones: TombstoneFilter) -> Self {
        self.tombstones = tombstones;
        self
    }

    /// Returns the owning series key.
    pub fn key(&self) -> &'a SeriesKey {
        self.key
    }

    /// Returns the block's time range as recorded in the index.
    pub fn time_range(&self) -> TimeRange {
        self.range
    }

    /// Returns the value type recorded in the index.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns the number of points recorded in the index.
    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    /// Returns the id of the file holding this block.
    pub fn source(&self) -> FileId {
        self.source
    }

    /// Returns the block's byte offset inside its file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the encoded bytes.
    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    /// Deletion ranges from this block's own file.
    pub fn tombstones(&self) -> &TombstoneFilter {
        &self.tombstones
    }

    /// Checks if the block intersects `[min, max]`.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.range.overlaps(min, max)
    }

    /// Returns true if this block's own file deleted `ts`.
    pub fn is_deleted(&self, ts: Timestamp) -> bool {
        self.tombstones.is_deleted(ts)
    }

    /// Returns true once the block has been decoded.
    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Decodes the block, memoizing the result.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptBlock` carrying the key and offset when the
    /// bytes fail to decode or disagree with the index metadata.
    pub fn decode(&self) -> Result<&[Point]> {
        self.decoded
            .get_or_try_init(|| self.decode_uncached())
            .map(Vec::as_slice)
    }

    fn decode_uncached(&self) -> Result<Vec<Point>> {
        let (value_type, points) =
            codec::decode_block(self.data).map_err(|e| e.at_block(self.key, self.offset))?;
        let fail = |reason: String| Err(TsmError::corrupt(reason).at_block(self.key, self.offset));

        if value_type != self.value_type {
            return fail(format!(
                "block holds {} values but index says {}",
                value_type, self.value_type
            ));
        }
        if points.len() != self.point_count as usize {
            return fail(format!(
                "block holds {} points but index says {}",
                points.len(),
                self.point_count
            ));
        }
        let first = points.first().map_or(Timestamp::MAX, |p| p.timestamp);
        let last = points.last().map_or(Timestamp::MIN, |p| p.timestamp);
        if first != self.range.min || last != self.range.max {
            return fail(format!(
                "block spans [{}, {}] but index says [{}, {}]",
                first, last, self.range.min, self.range.max
            ));
        }
        Ok(points)
    }

    /// Cheap structural validation used before copying a block verbatim.
    ///
    /// Checks the tag, point count and checksum against the index without
    /// decoding the columns.
    pub fn validate_header(&self) -> bool {
        match codec::read_header(self.data) {
            Ok(BlockHeader {
                value_type,
                point_count,
                ..
            }) => {
                value_type == self.value_type
                    && point_count == self.point_count
                    && point_count > 0
                    && self.range.min <= self.range.max
                    && codec::verify_checksum(self.data)
            }
            Err(_) => false,
        }
    }
}

/// A finished block emitted by the merge, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock<'a> {
    /// First timestamp in the block.
    pub min_time: Timestamp,
    /// Last timestamp in the block.
    pub max_time: Timestamp,
    /// Value type.
    pub value_type: ValueType,
    /// Number of points.
    pub point_count: u32,
    /// Encoded bytes; borrowed when copied through from a source file.
    pub data: Cow<'a, [u8]>,
}

impl<'a> EncodedBlock<'a> {
    /// Encodes a run of points into a new block.
    ///
    /// # Panics
    ///
    /// Panics on an empty slice or a value type mismatch.
    pub fn encode(value_type: ValueType, points: &[Point]) -> Self {
        let data = codec::encode_block(value_type, points);
        Self {
            min_time: points[0].timestamp,
            max_time: points[points.len() - 1].timestamp,
            value_type,
            point_count: points.len() as u32,
            data: Cow::Owned(data),
        }
    }

    /// Wraps a stored block's bytes without re-encoding.
    pub fn copied(desc: &BlockDescriptor<'a>) -> Self {
        Self {
            min_time: desc.range.min,
            max_time: desc.range.max,
            value_type: desc.value_type,
            point_count: desc.point_count,
            data: Cow::Borrowed(desc.data),
        }
    }

    /// Returns the block's time range.
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_time, self.max_time)
    }

    /// Decodes the block's points.
    pub fn decode(&self) -> Result<Vec<Point>> {
        codec::decode_block(&self.data).map(|(_, points)| points)
    }

    /// Detaches the block from any borrowed file bytes.
    pub fn into_owned(self) -> EncodedBlock<'static> {
        EncodedBlock {
            min_time: self.min_time,
            max_time: self.max_time,
            value_type: self.value_type,
            point_count: self.point_count,
            data: Cow::Owned(self.data.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor<'a>(key: &'a SeriesKey, data: &'a [u8], range: TimeRange, count: u32) -> BlockDescriptor<'a> {
        BlockDescriptor::new(key, range, ValueType::Float, count, FileId::new(1, 0), 64, data)
    }

    #[test]
    fn test_decode_is_lazy_and_memoized() {
        let key = SeriesKey::from("cpu,host=a");
        let points = vec![Point::float(10, 1.0), Point::float(20, 2.0)];
        let data = codec::encode_block(ValueType::Float, &points);
        let desc = descriptor(&key, &data, TimeRange::new(10, 20), 2);

        assert!(!desc.is_decoded());
        assert_eq!(desc.decode().unwrap(), points.as_slice());
        assert!(desc.is_decoded());
        let first = desc.decode().unwrap().as_ptr();
        let second = desc.decode().unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_overlaps_and_range() {
        let key = SeriesKey::from("k");
        let data = codec::encode_block(ValueType::Float, &[Point::float(10, 1.0), Point::float(20, 2.0)]);
        let desc = descriptor(&key, &data, TimeRange::new(10, 20), 2);
        assert_eq!(desc.time_range(), TimeRange::new(10, 20));
        assert!(desc.overlaps(0, 10));
        assert!(desc.overlaps(15, 16));
        assert!(!desc.overlaps(21, 100));
        assert!(desc.validate_header());
    }

    #[test]
    fn test_corrupt_block_reports_key_and_offset() {
        let key = SeriesKey::from("mem");
        let mut data = codec::encode_block(ValueType::Float, &[Point::float(1, 1.0), Point::float(2, 2.0)]);
        data[12] ^= 0x55;
        let desc = descriptor(&key, &data, TimeRange::new(1, 2), 2);
        assert!(!desc.validate_header());
        match desc.decode() {
            Err(TsmError::CorruptBlock { key, offset, .. }) => {
                assert_eq!(key, "mem");
                assert_eq!(offset, 64);
            }
            other => panic!("expected corrupt block, got {:?}", other),
        }
    }

    #[test]
    fn test_index_mismatch_is_corruption() {
        let key = SeriesKey::from("k");
        let data = codec::encode_block(ValueType::Float, &[Point::float(1, 1.0), Point::float(2, 2.0)]);

        let wrong_range = descriptor(&key, &data, TimeRange::new(1, 3), 2);
        assert!(wrong_range.decode().is_err());

        let wrong_count = descriptor(&key, &data, TimeRange::new(1, 2), 3);
        assert!(!wrong_count.validate_header());
        assert!(wrong_count.decode().is_err());

        let wrong_type = BlockDescriptor::new(
            &key,
            TimeRange::new(1, 2),
            ValueType::Integer,
            2,
            FileId::default(),
            0,
            &data,
        );
        assert!(!wrong_type.validate_header());
        assert!(wrong_type.decode().is_err());
    }

    #[test]
    fn test_encoded_block_copy_borrows() {
        let key = SeriesKey::from("k");
        let data = codec::encode_block(ValueType::Float, &[Point::float(5, 1.0)]);
        let desc = descriptor(&key, &data, TimeRange::new(5, 5), 1);
        let copied = EncodedBlock::copied(&desc);
        assert!(matches!(copied.data, Cow::Borrowed(_)));
        assert_eq!(copied.data.as_ref(), data.as_slice());
        assert_eq!(copied.time_range(), TimeRange::new(5, 5));

        let encoded = EncodedBlock::encode(ValueType::Float, &[Point::float(5, 1.0)]);
        assert_eq!(encoded, copied.into_owned());
    }
}
