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

//! The request/response protocol between the far-memory client and the
//! server. Every request starts with a one-byte opcode; all multi-byte
//! integers on the wire are big-endian.

use std::io::Read;
use std::io::Write;
use std::mem;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::prelude::*;

/// Request opcodes.
///
/// | Opcode | Request body | Reply body |
/// |--------|--------------|------------|
/// | Init | far_mem_size u64 | ack u8 |
/// | Shutdown | (empty) | ack u8 |
/// | ReadObject | ds_id u8, obj_id_len u8, obj_id | data_len u16, data |
/// | WriteObject | ds_id u8, obj_id_len u8, data_len u16, obj_id, data | ack u8 |
/// | RemoveObject | ds_id u8, obj_id_len u8, obj_id | exists u8 |
/// | Construct | ds_type u8, ds_id u8, param_len u8, params | ack u8 |
/// | Destruct | ds_id u8 | ack u8 |
/// | Compute | ds_id u8, opcode u8, input_len u16, input | output_len u16, output |
/// | Call | ds_id u8, body_len u16, body = method + args | ret_len u16, ret |
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Init = 1,
    Shutdown = 2,
    ReadObject = 3,
    WriteObject = 4,
    RemoveObject = 5,
    Construct = 6,
    Destruct = 7,
    Compute = 8,
    Call = 9,
}

/// Data-structure type tags understood by `Construct`.
pub const DS_TYPE_HEAP: u8 = 0;
pub const DS_TYPE_ARRAY: u8 = 1;

/// The manager constructs the vanilla blob heap under this ds_id at build
/// time; generic unique pointers live there by default.
pub const VANILLA_DS_ID: u8 = 0;

pub const MAX_OBJECT_ID_LEN: usize = u8::MAX as usize;
pub const MAX_OBJECT_DATA_LEN: usize = u16::MAX as usize;
pub const MAX_CALL_BODY_LEN: usize = u16::MAX as usize;

/// Header fields framed directly onto a stream, big-endian.
pub trait Framed: Sized {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()>;
    fn framed_read<R: Read>(stream: &mut R) -> Result<Self>;
}

macro_rules! impl_framed_for_int {
    ($($ty:ty),*) => {
        $(
            impl Framed for $ty {
                fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
                    stream.write_all(&self.to_be_bytes()).location(loc!())
                }

                fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
                    let mut buf = [0u8; mem::size_of::<Self>()];
                    stream.read_exact(&mut buf).location(loc!())?;
                    Ok(Self::from_be_bytes(buf))
                }
            }
        )*
    };
}

impl_framed_for_int!(u8, u16, u64);

impl Framed for OpCode {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        u8::from(*self).framed_write(stream)
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        Self::try_from(u8::framed_read(stream).location(loc!())?).location(loc!())
    }
}

pub fn read_bytes<R: Read>(stream: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).location(loc!())?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_byte_values() {
        assert_eq!(u8::from(OpCode::Init), 1);
        assert_eq!(u8::from(OpCode::Call), 9);
        assert_eq!(OpCode::try_from(3).unwrap(), OpCode::ReadObject);
        assert!(OpCode::try_from(0).is_err());
        assert!(OpCode::try_from(10).is_err());
    }

    #[test]
    fn test_framed_fields_are_big_endian() {
        let mut out = Vec::new();
        0x0102u16.framed_write(&mut out).unwrap();
        0x0304050607080910u64.framed_write(&mut out).unwrap();
        OpCode::Call.framed_write(&mut out).unwrap();
        assert_eq!(
            out,
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 9]
        );

        let mut cursor = std::io::Cursor::new(out);
        assert_eq!(u16::framed_read(&mut cursor).unwrap(), 0x0102);
        assert_eq!(u64::framed_read(&mut cursor).unwrap(), 0x0304050607080910);
        assert_eq!(OpCode::framed_read(&mut cursor).unwrap(), OpCode::Call);
    }
}
