//! Integration tests for block codecs.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tsmerge::tsm::{decode_block, encode_block, Point, Timestamp, ValueType};
use tsmerge::ErrorKind;

/// Strictly increasing timestamps spanning the full i64 range.
fn timestamps(max_len: usize) -> impl Strategy<Value = Vec<Timestamp>> {
    prop::collection::btree_set(any::<i64>(), 1..max_len).prop_map(|s| s.into_iter().collect())
}

fn paired<T: std::fmt::Debug>(
    values: impl Strategy<Value = T>,
) -> impl Strategy<Value = BTreeMap<Timestamp, T>> {
    prop::collection::btree_map(any::<i64>(), values, 1..200)
}

proptest! {
    #[test]
    fn float_blocks_are_lossless(points in paired(any::<f64>())) {
        let points: Vec<Point> = points.into_iter().map(|(t, v)| Point::float(t, v)).collect();
        let data = encode_block(ValueType::Float, &points);
        let (value_type, decoded) = decode_block(&data).unwrap();
        prop_assert_eq!(value_type, ValueType::Float);
        prop_assert_eq!(decoded, points);
    }

    #[test]
    fn integer_blocks_are_lossless(points in paired(any::<i64>())) {
        let points: Vec<Point> = points.into_iter().map(|(t, v)| Point::integer(t, v)).collect();
        let (_, decoded) = decode_block(&encode_block(ValueType::Integer, &points)).unwrap();
        prop_assert_eq!(decoded, points);
    }

    #[test]
    fn unsigned_and_boolean_blocks_are_lossless(
        unsigned in paired(any::<u64>()),
        booleans in paired(any::<bool>()),
    ) {
        let unsigned: Vec<Point> = unsigned.into_iter().map(|(t, v)| Point::unsigned(t, v)).collect();
        let (_, decoded) = decode_block(&encode_block(ValueType::Unsigned, &unsigned)).unwrap();
        prop_assert_eq!(decoded, unsigned);

        let booleans: Vec<Point> = booleans.into_iter().map(|(t, v)| Point::boolean(t, v)).collect();
        let (_, decoded) = decode_block(&encode_block(ValueType::Boolean, &booleans)).unwrap();
        prop_assert_eq!(decoded, booleans);
    }

    #[test]
    fn text_blocks_are_lossless(points in paired(".{0,24}")) {
        let points: Vec<Point> = points.into_iter().map(|(t, v)| Point::text(t, v)).collect();
        let (_, decoded) = decode_block(&encode_block(ValueType::Text, &points)).unwrap();
        prop_assert_eq!(decoded, points);
    }

    #[test]
    fn any_flipped_byte_is_detected(ts in timestamps(64), pick in any::<prop::sample::Index>(), mask in 1u8..=255) {
        let points: Vec<Point> = ts.iter().map(|&t| Point::integer(t, t.wrapping_mul(3))).collect();
        let mut data = encode_block(ValueType::Integer, &points);
        let at = pick.index(data.len());
        data[at] ^= mask;
        let err = decode_block(&data).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::CorruptBlock);
    }
}

#[test]
fn test_regular_float_series_compresses() {
    let points: Vec<Point> = (0..1000)
        .map(|i| Point::float(1_700_000_000_000_000_000 + i * 1_000_000_000, 20.0 + (i % 3) as f64))
        .collect();
    let data = encode_block(ValueType::Float, &points);
    // 16 bytes per raw point.
    assert!(data.len() < points.len() * 16 / 4, "block is {} bytes", data.len());
}
