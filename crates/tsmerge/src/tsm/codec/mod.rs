//! Block codecs: one timestamp column and one value column per block.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       value type tag (u8)
//! 0x01    4       point_count (u32 LE)
//! 0x05    4       ts_data_size (u32 LE)
//! 0x09    N       ts_data[ts_data_size]     (Gorilla delta-of-delta)
//! 0x09+N  M       val_data                  (per value type, see below)
//! end-4   4       block_crc32 (u32 LE), over every preceding byte
//! ```
//!
//! Value columns:
//! - Float: Gorilla XOR
//! - Integer / Unsigned: first value then wrapping deltas, signed LEB128
//! - Boolean: one bit per value
//! - Text: LEB128 length-prefixed UTF-8, LZ4 compressed
//!
//! Encoding is deterministic: equal inputs always produce equal bytes.

mod bits;
pub mod gorilla;

use crate::error::{Result, TsmError};
use crate::tsm::{Point, Value, ValueType};
use bitvec::prelude::*;
use std::io::Read;

/// Fixed bytes before the timestamp column.
pub const BLOCK_HEADER_SIZE: usize = 9;

/// Trailing checksum size.
pub const BLOCK_CRC_SIZE: usize = 4;

/// Header fields of an encoded block, readable without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Value type tag.
    pub value_type: ValueType,
    /// Number of points.
    pub point_count: u32,
    /// Size of the timestamp column in bytes.
    pub ts_len: u32,
}

/// Reads and validates the fixed header of an encoded block.
pub fn read_header(data: &[u8]) -> Result<BlockHeader> {
    if data.len() < BLOCK_HEADER_SIZE + BLOCK_CRC_SIZE {
        return Err(TsmError::corrupt(format!(
            "block too short: {} bytes",
            data.len()
        )));
    }
    let value_type = ValueType::from_u8(data[0])
        .ok_or_else(|| TsmError::corrupt(format!("unknown value type tag {}", data[0])))?;
    let point_count = u32::from_le_bytes(le4(&data[1..5]));
    let ts_len = u32::from_le_bytes(le4(&data[5..9]));
    if BLOCK_HEADER_SIZE + ts_len as usize > data.len() - BLOCK_CRC_SIZE {
        return Err(TsmError::corrupt(format!(
            "timestamp column length {} exceeds block size {}",
            ts_len,
            data.len()
        )));
    }
    Ok(BlockHeader {
        value_type,
        point_count,
        ts_len,
    })
}

/// Returns true if the trailing CRC32 matches the block contents.
pub fn verify_checksum(data: &[u8]) -> bool {
    if data.len() < BLOCK_CRC_SIZE {
        return false;
    }
    let (body, crc) = data.split_at(data.len() - BLOCK_CRC_SIZE);
    crc32fast::hash(body) == u32::from_le_bytes(le4(crc))
}

/// Encodes points of a single value type into a block.
///
/// # Panics
///
/// Panics if `points` is empty, if any value does not match `value_type`, or
/// if timestamps are not strictly increasing. Callers own these invariants.
pub fn encode_block(value_type: ValueType, points: &[Point]) -> Vec<u8> {
    assert!(!points.is_empty(), "cannot encode an empty block");
    assert!(
        points.windows(2).all(|w| w[0].timestamp < w[1].timestamp),
        "block timestamps must be strictly increasing"
    );

    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    let ts_data = gorilla::encode_timestamps(&timestamps);
    let val_data = encode_values(value_type, points);

    let mut out =
        Vec::with_capacity(BLOCK_HEADER_SIZE + ts_data.len() + val_data.len() + BLOCK_CRC_SIZE);
    out.push(value_type as u8);
    out.extend_from_slice(&(points.len() as u32).to_le_bytes());
    out.extend_from_slice(&(ts_data.len() as u32).to_le_bytes());
    out.extend_from_slice(&ts_data);
    out.extend_from_slice(&val_data);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decodes a block produced by [`encode_block`].
///
/// # Errors
///
/// Returns `TsmError::CorruptBlock` on any length, tag, checksum or payload
/// mismatch. Partial or reordered output is never returned.
pub fn decode_block(data: &[u8]) -> Result<(ValueType, Vec<Point>)> {
    let header = read_header(data)?;
    if !verify_checksum(data) {
        return Err(TsmError::corrupt("block checksum mismatch"));
    }
    let count = header.point_count as usize;
    if count == 0 {
        return Err(TsmError::corrupt("block has zero points"));
    }

    let ts_end = BLOCK_HEADER_SIZE + header.ts_len as usize;
    let ts_data = &data[BLOCK_HEADER_SIZE..ts_end];
    let val_data = &data[ts_end..data.len() - BLOCK_CRC_SIZE];

    let timestamps = gorilla::decode_timestamps(ts_data, count)
        .ok_or_else(|| TsmError::corrupt("malformed timestamp column"))?;
    if !timestamps.windows(2).all(|w| w[0] < w[1]) {
        return Err(TsmError::corrupt("timestamps not strictly increasing"));
    }

    let values = decode_values(header.value_type, val_data, count)?;
    let points = timestamps
        .into_iter()
        .zip(values)
        .map(|(timestamp, value)| Point { timestamp, value })
        .collect();
    Ok((header.value_type, points))
}

fn encode_values(value_type: ValueType, points: &[Point]) -> Vec<u8> {
    match value_type {
        ValueType::Float => {
            let values: Vec<f64> = points.iter().map(|p| expect_float(&p.value)).collect();
            gorilla::encode_floats(&values)
        }
        ValueType::Integer => {
            encode_deltas(points.iter().map(|p| match p.value {
                Value::Integer(v) => v,
                ref other => mismatch(ValueType::Integer, other),
            }))
        }
        ValueType::Unsigned => {
            encode_deltas(points.iter().map(|p| match p.value {
                Value::Unsigned(v) => v as i64,
                ref other => mismatch(ValueType::Unsigned, other),
            }))
        }
        ValueType::Boolean => {
            let mut out = BitVec::<u8, Msb0>::with_capacity(points.len());
            for p in points {
                match p.value {
                    Value::Boolean(v) => out.push(v),
                    ref other => mismatch(ValueType::Boolean, other),
                }
            }
            bits::into_bytes(out)
        }
        ValueType::Text => {
            let mut raw = Vec::new();
            for p in points {
                match &p.value {
                    Value::Text(s) => {
                        write_unsigned(&mut raw, s.len() as u64);
                        raw.extend_from_slice(s.as_bytes());
                    }
                    other => mismatch(ValueType::Text, other),
                }
            }
            lz4_flex::compress_prepend_size(&raw)
        }
    }
}

fn decode_values(value_type: ValueType, data: &[u8], count: usize) -> Result<Vec<Value>> {
    let values = match value_type {
        ValueType::Float => gorilla::decode_floats(data, count)
            .ok_or_else(|| TsmError::corrupt("malformed float column"))?
            .into_iter()
            .map(Value::Float)
            .collect(),
        ValueType::Integer => decode_deltas(data, count)?
            .into_iter()
            .map(Value::Integer)
            .collect(),
        ValueType::Unsigned => decode_deltas(data, count)?
            .into_iter()
            .map(|v| Value::Unsigned(v as u64))
            .collect(),
        ValueType::Boolean => {
            if data.len() != count.div_ceil(8) {
                return Err(TsmError::corrupt(format!(
                    "boolean column is {} bytes, expected {}",
                    data.len(),
                    count.div_ceil(8)
                )));
            }
            let bits = BitSlice::<u8, Msb0>::from_slice(data);
            if bits[count..].any() {
                return Err(TsmError::corrupt("boolean column padding is not zero"));
            }
            bits[..count].iter().map(|b| Value::Boolean(*b)).collect()
        }
        ValueType::Text => {
            let raw = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| TsmError::corrupt(format!("text column: {}", e)))?;
            let mut cursor: &[u8] = &raw;
            let mut values = Vec::with_capacity(count.min(raw.len() + 1));
            for _ in 0..count {
                let len = read_unsigned(&mut cursor)? as usize;
                if len > cursor.len() {
                    return Err(TsmError::corrupt("text value overruns column"));
                }
                let (bytes, rest) = cursor.split_at(len);
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| TsmError::corrupt(format!("invalid UTF-8 in text value: {}", e)))?;
                values.push(Value::Text(text.to_owned()));
                cursor = rest;
            }
            if !cursor.is_empty() {
                return Err(TsmError::corrupt("trailing bytes in text column"));
            }
            values
        }
    };
    Ok(values)
}

fn encode_deltas(values: impl Iterator<Item = i64>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for value in values {
        write_signed(&mut out, value.wrapping_sub(prev));
        prev = value;
    }
    out
}

fn decode_deltas(data: &[u8], count: usize) -> Result<Vec<i64>> {
    let mut cursor = data;
    let mut out = Vec::with_capacity(count.min(data.len()));
    let mut prev = 0i64;
    for _ in 0..count {
        let delta = leb128::read::signed(&mut cursor)
            .map_err(|e| TsmError::corrupt(format!("integer column: {}", e)))?;
        prev = prev.wrapping_add(delta);
        out.push(prev);
    }
    if !cursor.is_empty() {
        return Err(TsmError::corrupt("trailing bytes in integer column"));
    }
    Ok(out)
}

fn write_signed(out: &mut Vec<u8>, value: i64) {
    // Writing into a Vec cannot fail.
    let _ = leb128::write::signed(out, value);
}

fn write_unsigned(out: &mut Vec<u8>, value: u64) {
    let _ = leb128::write::unsigned(out, value);
}

fn read_unsigned<R: Read>(reader: &mut R) -> Result<u64> {
    leb128::read::unsigned(reader).map_err(|e| TsmError::corrupt(format!("length prefix: {}", e)))
}

fn expect_float(value: &Value) -> f64 {
    match value {
        Value::Float(v) => *v,
        other => mismatch(ValueType::Float, other),
    }
}

fn mismatch(expected: ValueType, found: &Value) -> ! {
    panic!(
        "value type mismatch: block is {} but point holds {}",
        expected,
        found.value_type()
    )
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    buf
}
