//! TSM file container.
//!
//! A TSM file is immutable once written. Compaction reads its blocks through
//! a memory map and writes merged output with [`TsmWriter`].
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (40 bytes)                                      │
//! │  - Magic: "TSMB" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Level: u16 (2 bytes)                                      │
//! │  - Min Timestamp: i64 (8 bytes)                              │
//! │  - Max Timestamp: i64 (8 bytes)                              │
//! │  - Key Count: u32 (4 bytes)                                  │
//! │  - Sequence: u32 (4 bytes)                                   │
//! │  - Generation: u64 (8 bytes)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks (key ascending, then time ascending)            │
//! │  - Encoded blocks, each with its own CRC                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Key Index                                                   │
//! │  - Entry count, per-key block entries, Bloom filter          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (40 bytes)                                           │
//! │  - Index offset/size, counts, file CRC, reverse magic        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{IoContext, Result, TsmError};
use crate::tsm::block::{BlockDescriptor, EncodedBlock};
use crate::tsm::tombstone::{self, TombstoneFilter, TombstoneRange};
use crate::tsm::{FileId, Point, SeriesKey, TimeRange, Timestamp, ValueType};
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Magic bytes for the file header: "TSMB"
pub const TSM_MAGIC: [u8; 4] = *b"TSMB";

/// Reverse magic bytes for the file footer: "BMST"
pub const TSM_MAGIC_REVERSE: [u8; 4] = *b"BMST";

/// Current file format version.
pub const TSM_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 40;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 40;

/// Serialized size of one [`BlockEntry`].
const BLOCK_ENTRY_SIZE: usize = 28;

/// Bounds-checked little-endian reader over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// File header (40 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmHeader {
    /// File format version.
    pub version: u16,
    /// Compaction level (0 = freshly flushed).
    pub level: u16,
    /// Minimum timestamp in the file.
    pub min_timestamp: Timestamp,
    /// Maximum timestamp in the file.
    pub max_timestamp: Timestamp,
    /// Number of keys in the file.
    pub key_count: u32,
    /// Identity and recency of the file.
    pub id: FileId,
}

impl TsmHeader {
    fn new(id: FileId, level: u16) -> Self {
        Self {
            version: TSM_VERSION,
            level,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            key_count: 0,
            id,
        }
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&TSM_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.level.to_le_bytes());
        buf[8..16].copy_from_slice(&self.min_timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.max_timestamp.to_le_bytes());
        buf[24..28].copy_from_slice(&self.key_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.id.sequence.to_le_bytes());
        buf[32..40].copy_from_slice(&self.id.generation.to_le_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> std::result::Result<Self, String> {
        let mut r = ByteReader::new(buf);
        let magic: [u8; 4] = r.array().ok_or("short header")?;
        if magic != TSM_MAGIC {
            return Err(format!("invalid magic {:?}", magic));
        }
        let version = r.u16().ok_or("short header")?;
        if version == 0 || version > TSM_VERSION {
            return Err(format!("unsupported version {}", version));
        }
        let level = r.u16().ok_or("short header")?;
        let min_timestamp = r.i64().ok_or("short header")?;
        let max_timestamp = r.i64().ok_or("short header")?;
        let key_count = r.u32().ok_or("short header")?;
        let sequence = r.u32().ok_or("short header")?;
        let generation = r.u64().ok_or("short header")?;
        Ok(Self {
            version,
            level,
            min_timestamp,
            max_timestamp,
            key_count,
            id: FileId::new(generation, sequence),
        })
    }
}

/// File footer (40 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmFooter {
    /// Offset of the key index from file start.
    pub index_offset: u64,
    /// Size of the key index in bytes.
    pub index_size: u64,
    /// Total number of points in the file.
    pub point_count: u64,
    /// Total number of blocks in the file.
    pub block_count: u64,
    /// CRC32 of every byte before the footer.
    pub file_crc32: u32,
}

impl TsmFooter {
    fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.point_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.block_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.file_crc32.to_le_bytes());
        buf[36..40].copy_from_slice(&TSM_MAGIC_REVERSE);
        buf
    }

    fn parse(buf: &[u8]) -> std::result::Result<Self, String> {
        let mut r = ByteReader::new(buf);
        let index_offset = r.u64().ok_or("short footer")?;
        let index_size = r.u64().ok_or("short footer")?;
        let point_count = r.u64().ok_or("short footer")?;
        let block_count = r.u64().ok_or("short footer")?;
        let file_crc32 = r.u32().ok_or("short footer")?;
        let magic: [u8; 4] = r.array().ok_or("short footer")?;
        if magic != TSM_MAGIC_REVERSE {
            return Err(format!("invalid footer magic {:?}", magic));
        }
        Ok(Self {
            index_offset,
            index_size,
            point_count,
            block_count,
            file_crc32,
        })
    }
}

/// Location and summary of one stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Byte offset of the block inside the file.
    pub offset: u64,
    /// Encoded size in bytes.
    pub size: u32,
    /// First timestamp.
    pub min_time: Timestamp,
    /// Last timestamp.
    pub max_time: Timestamp,
    /// Number of points.
    pub point_count: u32,
}

impl BlockEntry {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
        buf.extend_from_slice(&self.point_count.to_le_bytes());
    }

    fn read_from(r: &mut ByteReader<'_>) -> Option<Self> {
        Some(Self {
            offset: r.u64()?,
            size: r.u32()?,
            min_time: r.i64()?,
            max_time: r.i64()?,
            point_count: r.u32()?,
        })
    }
}

/// Index entry: every block of one key, in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The series key.
    pub key: SeriesKey,
    /// Value type shared by every block of the key.
    pub value_type: ValueType,
    /// Blocks in ascending time order.
    pub blocks: Vec<BlockEntry>,
}

impl IndexEntry {
    /// Time range spanned by all blocks of the key.
    pub fn time_range(&self) -> TimeRange {
        let min = self.blocks.first().map_or(Timestamp::MAX, |b| b.min_time);
        let max = self.blocks.last().map_or(Timestamp::MIN, |b| b.max_time);
        TimeRange::new(min, max)
    }
}

/// Default number of hash functions for the Bloom filter.
const BLOOM_FILTER_DEFAULT_HASH_COUNT: u8 = 3;

/// Bloom filter for fast key existence checks.
///
/// `h_i(x) = xxhash64(x, seed=i) % size_bits`
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` at about 10 bits per item.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = expected_items.saturating_mul(10).max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            hash_count: BLOOM_FILTER_DEFAULT_HASH_COUNT,
        }
    }

    fn bit_positions<'k>(&self, key: &'k [u8]) -> impl Iterator<Item = (usize, u64)> + 'k {
        let num_bits = (self.bits.len() * 64) as u64;
        (0..self.hash_count).map(move |seed| {
            let bit_idx = xxhash_rust::xxh64::xxh64(key, u64::from(seed)) % num_bits;
            ((bit_idx / 64) as usize, bit_idx % 64)
        })
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<_> = self.bit_positions(key).collect();
        for (word, bit) in positions {
            self.bits[word] |= 1u64 << bit;
        }
    }

    /// Returns false only if the key is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        self.bit_positions(key)
            .all(|(word, bit)| self.bits[word] & (1u64 << bit) != 0)
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[self.hash_count, 0, 0, 0]);
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn read_from(r: &mut ByteReader<'_>) -> Option<Self> {
        let num_words = r.u32()? as usize;
        let hash_count = r.array::<4>()?[0];
        if num_words == 0 || hash_count == 0 || r.remaining() / 8 < num_words {
            return None;
        }
        let bits = (0..num_words).map(|_| r.u64()).collect::<Option<Vec<_>>>()?;
        Some(Self { bits, hash_count })
    }
}

/// Sequential writer for one TSM file.
///
/// Blocks must arrive in ascending key order and, within a key, in ascending
/// non-overlapping time order. Violations are caller bugs and panic.
pub struct TsmWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    header: TsmHeader,
    position: u64,
    entries: Vec<IndexEntry>,
    hasher: crc32fast::Hasher,
    point_count: u64,
    block_count: u64,
}

impl TsmWriter {
    /// Creates the file at `path`, truncating any previous content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path, id: FileId, level: u16) -> Result<Self> {
        let file = File::create(path).with_path(path)?;
        let mut writer = BufWriter::new(file);
        let header = TsmHeader::new(id, level);

        // Placeholder, rewritten by finish().
        writer.write_all(&header.to_bytes()).with_path(path)?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            header,
            position: HEADER_SIZE as u64,
            entries: Vec::new(),
            hasher: crc32fast::Hasher::new(),
            point_count: 0,
            block_count: 0,
        })
    }

    /// Returns the path being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, excluding the index and footer.
    pub fn size(&self) -> u64 {
        self.position
    }

    /// Number of keys written so far.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Appends one block for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` sorts before the previous key, if the block does not
    /// start after the previous block of the same key, or if the value type
    /// changes within a key.
    pub fn write_block(&mut self, key: &SeriesKey, block: &EncodedBlock<'_>) -> Result<()> {
        assert!(block.point_count > 0, "empty block for key {}", key);
        assert!(
            block.min_time <= block.max_time,
            "inverted block range for key {}",
            key
        );

        let new_key = match self.entries.last() {
            Some(last) if last.key == *key => {
                assert_eq!(
                    last.value_type, block.value_type,
                    "value type changed within key {}",
                    key
                );
                let prev_max = last.blocks.last().map_or(Timestamp::MIN, |b| b.max_time);
                assert!(
                    block.min_time > prev_max,
                    "block for key {} starts at {} but previous block ends at {}",
                    key,
                    block.min_time,
                    prev_max
                );
                false
            }
            Some(last) => {
                assert!(
                    *key > last.key,
                    "key {} written after {}",
                    key,
                    last.key
                );
                true
            }
            None => true,
        };
        if new_key {
            self.entries.push(IndexEntry {
                key: key.clone(),
                value_type: block.value_type,
                blocks: Vec::new(),
            });
        }

        self.writer.write_all(&block.data).with_path(&self.path)?;
        self.hasher.update(&block.data);

        let entry = BlockEntry {
            offset: self.position,
            size: block.data.len() as u32,
            min_time: block.min_time,
            max_time: block.max_time,
            point_count: block.point_count,
        };
        if let Some(last) = self.entries.last_mut() {
            last.blocks.push(entry);
        }

        self.position += block.data.len() as u64;
        self.point_count += u64::from(block.point_count);
        self.block_count += 1;
        self.header.min_timestamp = self.header.min_timestamp.min(block.min_time);
        self.header.max_timestamp = self.header.max_timestamp.max(block.max_time);
        Ok(())
    }

    /// Writes the index, header and footer, then syncs the file.
    ///
    /// Returns the final file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails.
    pub fn finish(mut self) -> Result<u64> {
        let index_offset = self.position;

        let mut index = Vec::new();
        index.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        let mut bloom = BloomFilter::new(self.entries.len());
        for entry in &self.entries {
            bloom.insert(entry.key.as_bytes());
            index.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
            index.extend_from_slice(entry.key.as_bytes());
            index.push(entry.value_type as u8);
            index.extend_from_slice(&(entry.blocks.len() as u32).to_le_bytes());
            for block in &entry.blocks {
                block.write_to(&mut index);
            }
        }
        bloom.write_to(&mut index);
        self.writer.write_all(&index).with_path(&self.path)?;
        self.hasher.update(&index);
        self.position += index.len() as u64;

        self.header.key_count = self.entries.len() as u32;
        let header_bytes = self.header.to_bytes();
        self.writer
            .seek(SeekFrom::Start(0))
            .with_path(&self.path)?;
        self.writer.write_all(&header_bytes).with_path(&self.path)?;
        self.writer.seek(SeekFrom::End(0)).with_path(&self.path)?;

        // CRC of header followed by everything after it.
        let mut file_hasher = crc32fast::Hasher::new();
        file_hasher.update(&header_bytes);
        file_hasher.combine(&self.hasher);

        let footer = TsmFooter {
            index_offset,
            index_size: index.len() as u64,
            point_count: self.point_count,
            block_count: self.block_count,
            file_crc32: file_hasher.finalize(),
        };
        self.writer
            .write_all(&footer.to_bytes())
            .with_path(&self.path)?;
        self.writer.flush().with_path(&self.path)?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| TsmError::Io {
                path: self.path.clone(),
                source: e.into_error(),
            })?;
        file.sync_all().with_path(&self.path)?;

        let size = self.position + FOOTER_SIZE as u64;
        debug!(
            "Finished TSM file {} ({} keys, {} blocks, {} bytes)",
            self.path.display(),
            self.entries.len(),
            self.block_count,
            size
        );
        Ok(size)
    }
}

/// Read-only, memory-mapped view of a TSM file.
#[derive(Debug)]
pub struct TsmReader {
    path: PathBuf,
    mmap: Mmap,
    header: TsmHeader,
    footer: TsmFooter,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
}

impl TsmReader {
    /// Opens and validates a TSM file.
    ///
    /// Checks the header, the footer, the whole-file CRC and that every index
    /// entry points inside the data section.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptFile` on any structural failure.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_path(path)?;
        // SAFETY: TSM files are never modified after they are renamed into
        // place, and every slice is bounds-checked against the index.
        let mmap = unsafe { Mmap::map(&file) }.with_path(path)?;
        let corrupt = |reason: String| TsmError::corrupt_file(path, reason);

        let len = mmap.len();
        if len < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(format!("file too small ({} bytes)", len)));
        }
        let header = TsmHeader::parse(&mmap[..HEADER_SIZE]).map_err(corrupt)?;
        let footer_start = len - FOOTER_SIZE;
        let footer = TsmFooter::parse(&mmap[footer_start..]).map_err(corrupt)?;

        let actual_crc = crc32fast::hash(&mmap[..footer_start]);
        if actual_crc != footer.file_crc32 {
            return Err(corrupt(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x}",
                footer.file_crc32, actual_crc
            )));
        }

        let index_start = footer.index_offset as usize;
        let index_end = index_start.checked_add(footer.index_size as usize);
        if index_start < HEADER_SIZE || index_end != Some(footer_start) {
            return Err(corrupt("index bounds out of range".to_string()));
        }
        let mut r = ByteReader::new(&mmap[index_start..footer_start]);
        let index = Self::parse_index(&mut r, index_start as u64).map_err(corrupt)?;
        let bloom = BloomFilter::read_from(&mut r)
            .ok_or_else(|| corrupt("malformed bloom filter".to_string()))?;
        if r.remaining() != 0 {
            return Err(corrupt("trailing bytes after index".to_string()));
        }
        if index.len() != header.key_count as usize {
            return Err(corrupt(format!(
                "header lists {} keys but index holds {}",
                header.key_count,
                index.len()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            footer,
            index,
            bloom,
        })
    }

    fn parse_index(
        r: &mut ByteReader<'_>,
        data_end: u64,
    ) -> std::result::Result<Vec<IndexEntry>, String> {
        let count = r.u32().ok_or("short index")? as usize;
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            let key_len = r.u32().ok_or("short index")? as usize;
            let key = SeriesKey::from(r.bytes(key_len).ok_or("short index")?);
            let tag = r.u8().ok_or("short index")?;
            let value_type =
                ValueType::from_u8(tag).ok_or_else(|| format!("unknown value type {}", tag))?;
            let block_count = r.u32().ok_or("short index")? as usize;
            if block_count == 0 || r.remaining() / BLOCK_ENTRY_SIZE < block_count {
                return Err(format!("bad block count {} for key {}", block_count, key));
            }

            let mut blocks = Vec::with_capacity(block_count);
            let mut prev_max: Option<Timestamp> = None;
            for _ in 0..block_count {
                let block = BlockEntry::read_from(r).ok_or("short index")?;
                let end = block.offset.checked_add(u64::from(block.size));
                if block.offset < HEADER_SIZE as u64 || end.map_or(true, |e| e > data_end) {
                    return Err(format!("block for key {} out of bounds", key));
                }
                if block.point_count == 0
                    || block.min_time > block.max_time
                    || prev_max.is_some_and(|p| block.min_time <= p)
                {
                    return Err(format!("unordered block entry for key {}", key));
                }
                prev_max = Some(block.max_time);
                blocks.push(block);
            }

            if entries.last().is_some_and(|last| last.key >= key) {
                return Err(format!("key {} out of order", key));
            }
            entries.push(IndexEntry {
                key,
                value_type,
                blocks,
            });
        }
        Ok(entries)
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header.
    pub fn header(&self) -> &TsmHeader {
        &self.header
    }

    /// Returns the file footer.
    pub fn footer(&self) -> &TsmFooter {
        &self.footer
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Returns the index entries in key order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Looks up the index entry for `key`.
    pub fn entry(&self, key: &SeriesKey) -> Option<&IndexEntry> {
        if !self.bloom.maybe_contains(key.as_bytes()) {
            return None;
        }
        self.index
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.index[i])
    }

    /// Returns the raw bytes of one block.
    pub fn block_bytes(&self, block: &BlockEntry) -> &[u8] {
        let start = block.offset as usize;
        &self.mmap[start..start + block.size as usize]
    }
}

/// An open TSM file shared between the file set and compaction passes.
///
/// Once marked obsolete, the file and its tombstone sidecar are removed when
/// the last reference is dropped.
#[derive(Debug)]
pub struct TsmFile {
    reader: TsmReader,
    tombstones: RwLock<Vec<TombstoneRange>>,
    obsolete: AtomicBool,
}

impl TsmFile {
    /// Opens a TSM file and loads its tombstone sidecar.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or sidecar is unreadable or corrupt.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = TsmReader::open(path)?;
        let tombstones = tombstone::read_sidecar(&tombstone::sidecar_path(path))?;
        Ok(Self {
            reader,
            tombstones: RwLock::new(tombstones),
            obsolete: AtomicBool::new(false),
        })
    }

    /// Returns the file id.
    pub fn id(&self) -> FileId {
        self.reader.header.id
    }

    /// Returns the compaction level.
    pub fn level(&self) -> u16 {
        self.reader.header.level
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Returns the number of keys.
    pub fn key_count(&self) -> usize {
        self.reader.index.len()
    }

    /// Returns the number of stored points, deleted ones included.
    pub fn point_count(&self) -> u64 {
        self.reader.footer.point_count
    }

    /// Time span of the stored data, or `None` for an empty file.
    pub fn time_range(&self) -> Option<TimeRange> {
        (self.key_count() > 0).then(|| {
            TimeRange::new(
                self.reader.header.min_timestamp,
                self.reader.header.max_timestamp,
            )
        })
    }

    /// Iterates keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> + '_ {
        self.reader.index.iter().map(|e| &e.key)
    }

    /// Returns the underlying reader.
    pub fn reader(&self) -> &TsmReader {
        &self.reader
    }

    /// Returns true if the file holds `key`.
    pub fn contains_key(&self, key: &SeriesKey) -> bool {
        self.reader.entry(key).is_some()
    }

    /// Returns the value type stored for `key`.
    pub fn value_type(&self, key: &SeriesKey) -> Option<ValueType> {
        self.reader.entry(key).map(|e| e.value_type)
    }

    /// Returns descriptors for every block of `key`, in time order.
    ///
    /// Each descriptor carries this file's deletion ranges for the key.
    pub fn blocks(&self, key: &SeriesKey) -> Vec<BlockDescriptor<'_>> {
        let Some(entry) = self.reader.entry(key) else {
            return Vec::new();
        };
        let filter = TombstoneFilter::new(key, self.tombstones.read().iter());
        let id = self.id();
        entry
            .blocks
            .iter()
            .map(|block| {
                BlockDescriptor::new(
                    &entry.key,
                    TimeRange::new(block.min_time, block.max_time),
                    entry.value_type,
                    block.point_count,
                    id,
                    block.offset,
                    self.reader.block_bytes(block),
                )
                .with_tombstones(filter.clone())
            })
            .collect()
    }

    /// Reads every live point of `key` in `range`, applying this file's
    /// tombstones.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::CorruptBlock` if a block fails to decode.
    pub fn read_points(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Point>> {
        let mut out = Vec::new();
        for desc in self.blocks(key) {
            if !desc.overlaps(range.min, range.max) {
                continue;
            }
            let points = desc.decode()?;
            out.extend(
                points
                    .iter()
                    .filter(|p| range.contains(p.timestamp) && !desc.is_deleted(p.timestamp))
                    .cloned(),
            );
        }
        Ok(out)
    }

    /// Returns a copy of the recorded tombstones.
    pub fn tombstones(&self) -> Vec<TombstoneRange> {
        self.tombstones.read().clone()
    }

    /// Returns the number of recorded tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.read().len()
    }

    /// Records deletions against this file, durably.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar cannot be written.
    pub fn add_tombstones(&self, ranges: &[TombstoneRange]) -> Result<()> {
        let mut tombstones = self.tombstones.write();
        tombstone::append_sidecar(&tombstone::sidecar_path(self.path()), ranges)?;
        tombstones.extend_from_slice(ranges);
        Ok(())
    }

    /// Schedules the file for removal once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Returns true once the file has been replaced by a compaction.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for TsmFile {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        let path = self.reader.path.clone();
        if let Err(e) = fs::remove_file(&path) {
            error!("Failed to remove obsolete TSM file {}: {:?}", path.display(), e);
            return;
        }
        let sidecar = tombstone::sidecar_path(&path);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(
                    "Failed to remove tombstone sidecar {}: {:?}",
                    sidecar.display(),
                    e
                );
            }
        }
        debug!("Removed obsolete TSM file {}", path.display());
    }
}
