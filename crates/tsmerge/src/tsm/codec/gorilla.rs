//! Gorilla compression for timestamp and float columns.
//!
//! # Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! Deltas use wrapping arithmetic, so any `i64` sequence round-trips.
//!
//! # Value Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits

use super::bits::{into_bytes, push_bits, BitReader};
use bitvec::prelude::*;

/// Encodes timestamps into a delta-of-delta bit stream.
pub fn encode_timestamps(timestamps: &[i64]) -> Vec<u8> {
    let mut output = BitVec::<u8, Msb0>::new();
    let mut encoder = TimestampEncoder::new();
    for &ts in timestamps {
        encoder.encode(ts, &mut output);
    }
    into_bytes(output)
}

/// Decodes exactly `count` timestamps. Returns `None` on a malformed stream.
pub fn decode_timestamps(data: &[u8], count: usize) -> Option<Vec<i64>> {
    let mut decoder = TimestampDecoder::new(data);
    let mut out = Vec::with_capacity(count.min(data.len() * 8));
    for _ in 0..count {
        out.push(decoder.decode_next()?);
    }
    decoder.reader.is_exhausted().then_some(out)
}

/// Encodes floats into an XOR bit stream.
pub fn encode_floats(values: &[f64]) -> Vec<u8> {
    let mut output = BitVec::<u8, Msb0>::new();
    let mut encoder = ValueEncoder::new();
    for &val in values {
        encoder.encode(val, &mut output);
    }
    into_bytes(output)
}

/// Decodes exactly `count` floats. Returns `None` on a malformed stream.
pub fn decode_floats(data: &[u8], count: usize) -> Option<Vec<f64>> {
    let mut decoder = ValueDecoder::new(data);
    let mut out = Vec::with_capacity(count.min(data.len() * 8));
    for _ in 0..count {
        out.push(decoder.decode_next()?);
    }
    decoder.reader.is_exhausted().then_some(out)
}

/// Encoder for timestamps using delta-of-delta encoding.
pub struct TimestampEncoder {
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self {
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Encodes a timestamp into the output bit vector.
    pub fn encode(&mut self, timestamp: i64, output: &mut BitVec<u8, Msb0>) {
        if self.first {
            self.first = false;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            push_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let delta_of_delta = delta.wrapping_sub(self.prev_delta);

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else {
            push_bits(output, 0b1111, 4);
            push_bits(output, delta_of_delta as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

impl Default for TimestampEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for delta-of-delta encoded timestamps.
pub struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Decodes the next timestamp from the bit stream.
    pub fn decode_next(&mut self) -> Option<i64> {
        if self.first {
            let ts = self.reader.read_bits(64)? as i64;
            self.first = false;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        let r = &mut self.reader;
        let delta_of_delta = if !r.read_bit()? {
            0
        } else if !r.read_bit()? {
            r.read_bits(7)? as i64 - 63
        } else if !r.read_bit()? {
            r.read_bits(9)? as i64 - 255
        } else if !r.read_bit()? {
            r.read_bits(12)? as i64 - 2047
        } else {
            r.read_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(delta_of_delta);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
pub struct ValueEncoder {
    first: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self {
            first: true,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if self.first {
            self.first = false;
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;

        if xor == 0 {
            output.push(false);
        } else {
            // The leading-zero field is 5 bits wide.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                push_bits(output, 0b10, 2);
                let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful_bits);
            } else {
                push_bits(output, 0b11, 2);
                let meaningful_bits = 64 - leading - trailing;
                push_bits(output, u64::from(leading), 5);
                push_bits(output, u64::from(meaningful_bits - 1), 6);
                push_bits(output, xor >> trailing, meaningful_bits);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = bits;
    }
}

impl Default for ValueEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    first: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            first: true,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decodes the next float value from the bit stream.
    pub fn decode_next(&mut self) -> Option<f64> {
        if self.first {
            let bits = self.reader.read_bits(64)?;
            self.first = false;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let r = &mut self.reader;
        let xor = if !r.read_bit()? {
            0
        } else if !r.read_bit()? {
            let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
            r.read_bits(meaningful_bits)? << self.prev_trailing
        } else {
            let leading = r.read_bits(5)? as u32;
            let meaningful_bits = r.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            let xor = r.read_bits(meaningful_bits)? << trailing;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            xor
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;
        Some(f64::from_bits(bits))
    }
}
