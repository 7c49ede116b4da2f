//! Bounds-checked bit stream helpers shared by the bit-packed codecs.

use bitvec::prelude::*;

/// Appends the low `width` bits of `value`, most significant first.
pub(crate) fn push_bits(output: &mut BitVec<u8, Msb0>, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Converts a finished bit stream into bytes with zeroed padding.
pub(crate) fn into_bytes(mut bits: BitVec<u8, Msb0>) -> Vec<u8> {
    bits.set_uninitialized(false);
    bits.into_vec()
}

/// Sequential reader over an MSB-first bit slice.
///
/// Every read returns `None` instead of panicking when the stream runs out.
pub(crate) struct BitReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bits: BitSlice::from_slice(bytes),
            pos: 0,
        }
    }

    pub(crate) fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.bits.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    /// Reads `width` bits (at most 64) as an unsigned integer.
    pub(crate) fn read_bits(&mut self, width: u32) -> Option<u64> {
        debug_assert!(width <= 64);
        if self.pos + width as usize > self.bits.len() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.bits[self.pos]);
            self.pos += 1;
        }
        Some(value)
    }

    /// True when only zeroed padding (< 8 bits) remains.
    pub(crate) fn is_exhausted(&self) -> bool {
        let rest = &self.bits[self.pos.min(self.bits.len())..];
        rest.len() < 8 && rest.not_any()
    }
}
