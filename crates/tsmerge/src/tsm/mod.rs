//! TSM storage primitives: series keys, typed points, block codecs, block
//! descriptors, tombstones and the on-disk file container.

pub mod block;
pub mod codec;
pub mod file;
pub mod tombstone;

use std::fmt;

pub use block::{BlockDescriptor, EncodedBlock};
pub use codec::{decode_block, encode_block};
pub use file::{TsmFile, TsmReader, TsmWriter};
pub use tombstone::{TombstoneFilter, TombstoneRange, TombstoneSet};

/// Timestamp type (nanoseconds since Unix epoch).
pub type Timestamp = i64;

/// Default ceiling on the number of points stored in one block.
pub const DEFAULT_MAX_POINTS_PER_BLOCK: usize = 1000;

/// Opaque series identifier. Ordered byte-lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SeriesKey(Vec<u8>);

impl SeriesKey {
    /// Creates a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SeriesKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for SeriesKey {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Value type of a series. Fixed for the lifetime of a key in a file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// 64-bit IEEE 754 floating point.
    Float = 0,
    /// Signed 64-bit integer.
    Integer = 1,
    /// Unsigned 64-bit integer.
    Unsigned = 2,
    /// Boolean.
    Boolean = 3,
    /// UTF-8 text.
    Text = 4,
}

impl ValueType {
    /// Creates a ValueType from its on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Float),
            1 => Some(Self::Integer),
            2 => Some(Self::Unsigned),
            3 => Some(Self::Boolean),
            4 => Some(Self::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Unsigned => "unsigned",
            Self::Boolean => "boolean",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// A typed point value.
///
/// Float equality compares bit patterns so that NaN payloads and signed zeros
/// are treated as exact values.
#[derive(Debug, Clone)]
pub enum Value {
    /// Float payload.
    Float(f64),
    /// Integer payload.
    Integer(i64),
    /// Unsigned payload.
    Unsigned(u64),
    /// Boolean payload.
    Boolean(bool),
    /// Text payload.
    Text(String),
}

impl Value {
    /// Returns the value's type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Float(_) => ValueType::Float,
            Self::Integer(_) => ValueType::Integer,
            Self::Unsigned(_) => ValueType::Unsigned,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Text(_) => ValueType::Text,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Unsigned(a), Self::Unsigned(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// A single timestamped value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    /// Timestamp in nanoseconds.
    pub timestamp: Timestamp,
    /// The value.
    pub value: Value,
}

impl Point {
    /// Creates a new point.
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }

    /// Creates a float point.
    pub fn float(timestamp: Timestamp, value: f64) -> Self {
        Self::new(timestamp, Value::Float(value))
    }

    /// Creates an integer point.
    pub fn integer(timestamp: Timestamp, value: i64) -> Self {
        Self::new(timestamp, Value::Integer(value))
    }

    /// Creates an unsigned point.
    pub fn unsigned(timestamp: Timestamp, value: u64) -> Self {
        Self::new(timestamp, Value::Unsigned(value))
    }

    /// Creates a boolean point.
    pub fn boolean(timestamp: Timestamp, value: bool) -> Self {
        Self::new(timestamp, Value::Boolean(value))
    }

    /// Creates a text point.
    pub fn text(timestamp: Timestamp, value: impl Into<String>) -> Self {
        Self::new(timestamp, Value::Text(value.into()))
    }
}

/// Inclusive time range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Minimum timestamp (inclusive).
    pub min: Timestamp,
    /// Maximum timestamp (inclusive).
    pub max: Timestamp,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(min: Timestamp, max: Timestamp) -> Self {
        Self { min, max }
    }

    /// The range covering every representable timestamp.
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Checks if a timestamp is within this range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.min <= ts && ts <= self.max
    }

    /// Checks if this range intersects `[min, max]`.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.min <= max && min <= self.max
    }

    /// Checks if this range contains all of `other`.
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Smallest range containing both.
    pub fn union(&self, other: &TimeRange) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }
}

/// File identity and write-recency order.
///
/// Files compare by generation, then sequence. A greater id is more recent
/// and wins timestamp ties during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId {
    /// Write generation.
    pub generation: u64,
    /// Sequence within a generation (bumped by compaction outputs).
    pub sequence: u32,
}

impl FileId {
    /// Creates a new file id.
    pub fn new(generation: u64, sequence: u32) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    /// Builds a file name using `{generation:09}-{sequence:09}.tsm`.
    pub fn file_name(&self) -> String {
        format!("{:09}-{:09}.tsm", self.generation, self.sequence)
    }

    /// Parses a file name produced by [`FileId::file_name`].
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let name = name.strip_suffix(".tsm")?;
        let (gen_part, seq_part) = name.split_once('-')?;
        if gen_part.is_empty() || seq_part.is_empty() {
            return None;
        }
        let generation = gen_part.parse::<u64>().ok()?;
        let sequence = seq_part.parse::<u32>().ok()?;
        Some(Self::new(generation, sequence))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_order_is_bytewise() {
        let mut keys = vec![
            SeriesKey::from("mem"),
            SeriesKey::from("cpu,host=b"),
            SeriesKey::from("cpu,host=a"),
            SeriesKey::new(vec![0xff]),
            SeriesKey::from("cpu"),
        ];
        keys.sort();
        let printed: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(printed[0], "cpu");
        assert_eq!(printed[1], "cpu,host=a");
        assert_eq!(printed[2], "cpu,host=b");
        assert_eq!(printed[3], "mem");
        assert_eq!(keys[4].as_bytes(), &[0xff]);
    }

    #[test]
    fn test_value_type_from_u8() {
        for ty in [
            ValueType::Float,
            ValueType::Integer,
            ValueType::Unsigned,
            ValueType::Boolean,
            ValueType::Text,
        ] {
            assert_eq!(ValueType::from_u8(ty as u8), Some(ty));
        }
        assert_eq!(ValueType::from_u8(5), None);
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(1.0), Value::Integer(1));
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(range.overlaps(20, 30));
        assert!(!range.overlaps(21, 30));
        assert!(range.covers(&TimeRange::new(12, 18)));
        assert!(!range.covers(&TimeRange::new(5, 18)));
        assert_eq!(range.union(&TimeRange::new(5, 8)), TimeRange::new(5, 20));
    }

    #[test]
    fn test_file_id_order_and_names() {
        let older = FileId::new(3, 7);
        let newer = FileId::new(4, 1);
        assert!(newer > older);
        assert!(FileId::new(4, 2) > newer);

        let name = newer.file_name();
        assert_eq!(name, "000000004-000000001.tsm");
        assert_eq!(FileId::parse_file_name(&name), Some(newer));
        assert_eq!(FileId::parse_file_name("4-1.tsm"), Some(newer));
        assert_eq!(FileId::parse_file_name("garbage.tsm"), None);
        assert_eq!(FileId::parse_file_name("000000004-000000001.log"), None);
    }
}
