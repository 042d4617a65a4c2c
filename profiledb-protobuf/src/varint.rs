// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unsigned LEB128 ("uvarint") and zig-zag helpers.
//!
//! These are the same encodings protobuf uses for varints, exposed as free
//! functions so that non-protobuf formats can share them.

use std::io::{self, Write};

/// The maximum number of bytes a `u64` occupies once encoded.
pub const MAX_LEN: usize = 10;

/// Returns the number of bytes `value` occupies once encoded.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    // https://github.com/google/protobuf/blob/3.3.x/src/google/protobuf/io/coded_stream.h#L1301-L1309
    ((((value | 1).leading_zeros() ^ 63) * 9 + 73) / 64) as usize
}

/// Encodes `value` into `buf`, returning the number of bytes written.
///
/// `buf` must be at least [`encoded_len`] bytes long; [`MAX_LEN`] is always
/// enough. Returns `None` if the buffer is too short.
#[inline]
pub fn put_uvarint(buf: &mut [u8], mut value: u64) -> Option<usize> {
    let mut i = 0;
    loop {
        let slot = buf.get_mut(i)?;
        i += 1;
        if value < 0x80 {
            *slot = value as u8;
            return Some(i);
        }
        *slot = ((value & 0x7F) | 0x80) as u8;
        value >>= 7;
    }
}

/// Encodes a [`varint`] according to protobuf semantics.
///
/// Serialization happens one byte at a time; use a buffered writer.
///
/// [`varint`]: https://protobuf.dev/programming-guides/encoding/#varints
#[inline]
pub fn encode_uvarint<W: Write>(writer: &mut W, value: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_LEN];
    // MAX_LEN always fits a u64.
    let n = put_uvarint(&mut buf, value).unwrap_or(MAX_LEN);
    writer.write_all(&buf[..n])?;
    Ok(n)
}

/// Decodes a uvarint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// buffer ends mid-varint or the value overflows 64 bits.
#[inline]
pub fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(MAX_LEN) {
        let bits = u64::from(byte & 0x7F);
        if i == MAX_LEN - 1 && byte > 1 {
            return None;
        }
        value |= bits << (7 * i);
        if byte < 0x80 {
            return Some((value, i + 1));
        }
    }
    None
}

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_varint_range() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(0x7F), 1);
        assert_eq!(encoded_len(0x80), 2);
        assert_eq!(encoded_len(u64::MAX), MAX_LEN);
    }

    #[test]
    fn test_known_encodings() {
        let mut out = Vec::new();
        encode_uvarint(&mut out, 300).unwrap();
        assert_eq!(out, [0xAC, 0x02]);
        assert_eq!(decode_uvarint(&out), Some((300, 2)));

        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(3), -2);
    }

    #[test]
    fn test_truncated_and_overflowing_input() {
        assert_eq!(decode_uvarint(&[]), None);
        assert_eq!(decode_uvarint(&[0x80, 0x80]), None);
        let overflow = [0xFF; MAX_LEN];
        assert_eq!(decode_uvarint(&overflow), None);
    }

    #[test]
    fn test_short_buffer() {
        let mut buf = [0u8; 1];
        assert_eq!(put_uvarint(&mut buf, 0x80), None);
        assert_eq!(put_uvarint(&mut buf, 0x7F), Some(1));
    }

    proptest! {
        #[test]
        fn uvarint_len_matches(value: u64) {
            let mut out = Vec::new();
            let n = encode_uvarint(&mut out, value).unwrap();
            prop_assert_eq!(n, encoded_len(value));
            prop_assert_eq!(decode_uvarint(&out), Some((value, n)));
        }

        #[test]
        fn zigzag_is_symmetric(value: i64) {
            prop_assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }
}
