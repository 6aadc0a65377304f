// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-width big-endian integer coding plus the varint/zig-zag variants
//! used for self-describing length fields.

use std::mem;

use static_assertions::const_assert;

use crate::prelude::*;
use crate::rpc::buffer::Buffer;

const_assert!(mem::size_of::<usize>() >= mem::size_of::<u64>());

pub fn zigzag_encode32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

pub fn zigzag_decode32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

pub fn zigzag_encode64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn encode_var_u64(buf: &mut Buffer, mut value: u64) {
    while value >= 0x80 {
        buf.append(&[(value as u8 & 0x7f) | 0x80]);
        value >>= 7;
    }
    buf.append(&[value as u8]);
}

pub fn decode_var_u64(buf: &mut Buffer) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = buf.read_array::<1>().location(loc!())?[0];
        ensure!(shift < 64, "varint longer than 64 bits");
        value |= u64::from(byte & 0x7f) << shift;
        if byte < 0x80 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn encode_var_u32(buf: &mut Buffer, value: u32) {
    encode_var_u64(buf, u64::from(value));
}

pub fn decode_var_u32(buf: &mut Buffer) -> Result<u32> {
    decode_var_u64(buf)
        .location(loc!())?
        .try_into()
        .context(loc!(), "varint does not fit in 32 bits")
}

pub fn encode_var_i32(buf: &mut Buffer, value: i32) {
    encode_var_u32(buf, zigzag_encode32(value));
}

pub fn decode_var_i32(buf: &mut Buffer) -> Result<i32> {
    Ok(zigzag_decode32(decode_var_u32(buf).location(loc!())?))
}

pub fn encode_var_i64(buf: &mut Buffer, value: i64) {
    encode_var_u64(buf, zigzag_encode64(value));
}

pub fn decode_var_i64(buf: &mut Buffer) -> Result<i64> {
    Ok(zigzag_decode64(decode_var_u64(buf).location(loc!())?))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_zigzag_known_values() {
        assert_eq!(zigzag_encode32(0), 0);
        assert_eq!(zigzag_encode32(-1), 1);
        assert_eq!(zigzag_encode32(1), 2);
        assert_eq!(zigzag_encode32(-2), 3);
        assert_eq!(zigzag_encode64(i64::MIN), u64::MAX);
        assert_eq!(zigzag_decode64(u64::MAX), i64::MIN);
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, encoded_len) in [
            (0u64, 1),
            (0x7f, 1),
            (0x80, 2),
            (0x3fff, 2),
            (0x4000, 3),
            (u64::MAX, 10),
        ] {
            let mut buf = Buffer::new();
            encode_var_u64(&mut buf, value);
            assert_eq!(buf.readable_bytes(), encoded_len, "value {value:#x}");
            assert_eq!(decode_var_u64(&mut buf).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_truncated_input() {
        let mut buf = Buffer::from_bytes(&[0x80, 0x80]);
        assert!(decode_var_u64(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn proptest_var_u64_roundtrip(value in any::<u64>()) {
            let mut buf = Buffer::new();
            encode_var_u64(&mut buf, value);
            prop_assert_eq!(decode_var_u64(&mut buf).unwrap(), value);
        }

        #[test]
        fn proptest_var_i64_roundtrip(value in any::<i64>()) {
            let mut buf = Buffer::new();
            encode_var_i64(&mut buf, value);
            prop_assert_eq!(decode_var_i64(&mut buf).unwrap(), value);
        }

        #[test]
        fn proptest_var_i32_roundtrip(value in any::<i32>()) {
            let mut buf = Buffer::new();
            encode_var_i32(&mut buf, value);
            prop_assert_eq!(decode_var_i32(&mut buf).unwrap(), value);
        }
    }
}
