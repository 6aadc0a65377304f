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

//! Streaming serialization of primitives and composite shapes over a
//! [`Buffer`]. Every supported shape round-trips byte-exactly:
//! `read(write(x)) == x`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;

use crate::prelude::*;
use crate::rpc::buffer::Buffer;

/// A value with a wire encoding. Fixed-width integers are written MSB-first;
/// composites are written as their parts, sequences and nested buffers with a
/// u64 length prefix.
pub trait Wire: Sized {
    fn wire_write(&self, buf: &mut Buffer);
    fn wire_read(buf: &mut Buffer) -> Result<Self>;
}

macro_rules! impl_wire_for_int {
    ($($ty:ty),*) => {
        $(
            impl Wire for $ty {
                fn wire_write(&self, buf: &mut Buffer) {
                    buf.append(&self.to_be_bytes());
                }

                fn wire_read(buf: &mut Buffer) -> Result<Self> {
                    Ok(Self::from_be_bytes(buf.read_array().location(loc!())?))
                }
            }
        )*
    };
}

impl_wire_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Wire for usize {
    fn wire_write(&self, buf: &mut Buffer) {
        (*self as u64).wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        u64::wire_read(buf)
            .location(loc!())?
            .try_into()
            .context(loc!(), "length does not fit in usize")
    }
}

impl Wire for bool {
    fn wire_write(&self, buf: &mut Buffer) {
        (*self as u8).wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok(u8::wire_read(buf).location(loc!())? != 0)
    }
}

impl Wire for f32 {
    fn wire_write(&self, buf: &mut Buffer) {
        self.to_bits().wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok(Self::from_bits(u32::wire_read(buf).location(loc!())?))
    }
}

impl Wire for f64 {
    fn wire_write(&self, buf: &mut Buffer) {
        self.to_bits().wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok(Self::from_bits(u64::wire_read(buf).location(loc!())?))
    }
}

impl Wire for String {
    fn wire_write(&self, buf: &mut Buffer) {
        self.len().wire_write(buf);
        buf.append(self.as_bytes());
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        let len = usize::wire_read(buf).location(loc!())?;
        let bytes = buf.retrieve(len).location(loc!())?;
        Self::from_utf8(bytes).location(loc!())
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn wire_write(&self, buf: &mut Buffer) {
        self.0.wire_write(buf);
        self.1.wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok((
            A::wire_read(buf).location(loc!())?,
            B::wire_read(buf).location(loc!())?,
        ))
    }
}

// Positional and untagged, like pairs but for the remaining arities the
// router supports.
impl Wire for () {
    fn wire_write(&self, _buf: &mut Buffer) {}

    fn wire_read(_buf: &mut Buffer) -> Result<Self> {
        Ok(())
    }
}

impl<A: Wire> Wire for (A,) {
    fn wire_write(&self, buf: &mut Buffer) {
        self.0.wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok((A::wire_read(buf).location(loc!())?,))
    }
}

impl<A: Wire, B: Wire, C: Wire> Wire for (A, B, C) {
    fn wire_write(&self, buf: &mut Buffer) {
        self.0.wire_write(buf);
        self.1.wire_write(buf);
        self.2.wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok((
            A::wire_read(buf).location(loc!())?,
            B::wire_read(buf).location(loc!())?,
            C::wire_read(buf).location(loc!())?,
        ))
    }
}

impl<A: Wire, B: Wire, C: Wire, D: Wire> Wire for (A, B, C, D) {
    fn wire_write(&self, buf: &mut Buffer) {
        self.0.wire_write(buf);
        self.1.wire_write(buf);
        self.2.wire_write(buf);
        self.3.wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok((
            A::wire_read(buf).location(loc!())?,
            B::wire_read(buf).location(loc!())?,
            C::wire_read(buf).location(loc!())?,
            D::wire_read(buf).location(loc!())?,
        ))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn wire_write(&self, buf: &mut Buffer) {
        self.len().wire_write(buf);
        for elem in self {
            elem.wire_write(buf);
        }
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        let len = usize::wire_read(buf).location(loc!())?;
        let mut vec = Self::new();
        for _ in 0..len {
            vec.push(T::wire_read(buf).location(loc!())?);
        }
        Ok(vec)
    }
}

impl<T: Wire> Wire for VecDeque<T> {
    fn wire_write(&self, buf: &mut Buffer) {
        self.len().wire_write(buf);
        for elem in self {
            elem.wire_write(buf);
        }
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok(Vec::<T>::wire_read(buf).location(loc!())?.into())
    }
}

impl<K: Wire + Eq + Hash, V: Wire> Wire for HashMap<K, V> {
    fn wire_write(&self, buf: &mut Buffer) {
        self.len().wire_write(buf);
        for (k, v) in self {
            k.wire_write(buf);
            v.wire_write(buf);
        }
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        let len = usize::wire_read(buf).location(loc!())?;
        let mut map = Self::new();
        for _ in 0..len {
            let (k, v) = <(K, V)>::wire_read(buf).location(loc!())?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    fn wire_write(&self, buf: &mut Buffer) {
        self.len().wire_write(buf);
        for (k, v) in self {
            k.wire_write(buf);
            v.wire_write(buf);
        }
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        let len = usize::wire_read(buf).location(loc!())?;
        let mut map = Self::new();
        for _ in 0..len {
            let (k, v) = <(K, V)>::wire_read(buf).location(loc!())?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl Wire for Buffer {
    fn wire_write(&self, buf: &mut Buffer) {
        self.readable_bytes().wire_write(buf);
        buf.append(self.readable());
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        let len = usize::wire_read(buf).location(loc!())?;
        Ok(Self::from_bytes(buf.read_bytes(len).location(loc!())?))
    }
}

/// Streaming reader/writer over a [`Buffer`].
#[derive(Debug, Default)]
pub struct Serializer {
    buf: Buffer,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buf: Buffer::new() }
    }

    pub fn write<T: Wire>(&mut self, value: &T) -> &mut Self {
        value.wire_write(&mut self.buf);
        self
    }

    pub fn read<T: Wire>(&mut self) -> Result<T> {
        T::wire_read(&mut self.buf)
    }

    pub fn readable_bytes(&self) -> usize {
        self.buf.readable_bytes()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn into_buffer(self) -> Buffer {
        self.buf
    }
}

impl From<Buffer> for Serializer {
    fn from(buf: Buffer) -> Self {
        Self { buf }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug + Clone>(value: T) {
        let mut ser = Serializer::new();
        ser.write(&value);
        assert_eq!(ser.read::<T>().unwrap(), value);
        assert_eq!(ser.readable_bytes(), 0);
    }

    #[test]
    fn test_integer_widths_on_the_wire() {
        let mut ser = Serializer::new();
        ser.write(&0x0102u16);
        assert_eq!(ser.buffer().readable(), &[0x01, 0x02]);

        let mut ser = Serializer::new();
        ser.write(&0x01020304u32);
        assert_eq!(ser.buffer().readable(), &[0x01, 0x02, 0x03, 0x04]);

        let mut ser = Serializer::new();
        ser.write(&true);
        assert_eq!(ser.buffer().readable(), &[0x01]);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut ser = Serializer::new();
        ser.write(&"ab".to_string());
        assert_eq!(
            ser.buffer().readable(),
            &[0, 0, 0, 0, 0, 0, 0, 2, b'a', b'b']
        );
    }

    #[test]
    fn test_composite_roundtrips() {
        roundtrip((1u8, -2i64));
        roundtrip((1u32, "x".to_string(), 3.5f64));
        roundtrip(("k".to_string(), vec![1u16, 2, 3], false, -7i32));
        roundtrip(vec!["a".to_string(), String::new()]);
        roundtrip(VecDeque::from([1u64, 2, 3]));
        roundtrip(BTreeMap::from([(1u8, "one".to_string()), (2, "two".to_string())]));
        roundtrip(HashMap::from([("k".to_string(), 9u64)]));
        roundtrip(Buffer::from_bytes(&[0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_nested_buffer_does_not_consume_source() {
        let inner = Buffer::from_bytes(b"payload");
        let mut ser = Serializer::new();
        ser.write(&inner);
        assert_eq!(inner.readable_bytes(), 7);
        let out: Buffer = ser.read().unwrap();
        assert_eq!(out.readable(), b"payload");
    }

    #[test]
    fn test_truncated_read_fails_cleanly() {
        let mut ser = Serializer::from(Buffer::from_bytes(&[0, 0]));
        assert!(ser.read::<u64>().is_err());
        assert!(ser.read::<String>().is_err());
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let mut ser = Serializer::new();
        ser.write(&2usize);
        // Directly splice invalid UTF-8 after a valid length prefix.
        let mut buf = ser.into_buffer();
        buf.append(&[0xff, 0xfe]);
        let mut ser = Serializer::from(buf);
        assert!(ser.read::<String>().is_err());
    }

    proptest! {
        #[test]
        fn proptest_bytes_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            roundtrip(bytes);
        }

        #[test]
        fn proptest_string_roundtrip(s in ".{0,256}") {
            roundtrip(s);
        }

        #[test]
        fn proptest_float_bitcopy(x in any::<f64>()) {
            let mut ser = Serializer::new();
            ser.write(&x);
            let back = ser.read::<f64>().unwrap();
            prop_assert_eq!(back.to_bits(), x.to_bits());
        }

        #[test]
        fn proptest_map_roundtrip(m in proptest::collection::btree_map(any::<u32>(), any::<i64>(), 0..64)) {
            roundtrip(m);
        }
    }
}
