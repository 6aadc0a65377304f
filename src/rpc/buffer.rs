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

use crate::prelude::*;

/// A contiguous byte region with independent read and write cursors.
///
/// Writes append at the write cursor, reads consume from the read cursor.
/// When the read cursor catches up with the write cursor both reset to zero
/// so the storage is reused instead of growing without bound.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

// Equality is over the readable region; spare storage and cursor positions
// are representation detail.
impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.readable() == other.readable()
    }
}

impl Eq for Buffer {}

impl Buffer {
    pub const INIT_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::INIT_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            read_pos: 0,
            write_pos: bytes.len(),
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.data.resize(self.write_pos + n, 0);
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Consumes `n` bytes. The returned slice stays valid for the lifetime of
    /// the borrow even when the cursors reset: resetting only rewinds the
    /// cursor indices, the storage is untouched.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        ensure!(
            n <= self.readable_bytes(),
            "buffer underflow: want {n} bytes, have {}",
            self.readable_bytes()
        );
        let start = self.read_pos;
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        Ok(&self.data[start..start + n])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N).location(loc!())?;
        // read_bytes returned exactly N bytes.
        Ok(bytes.try_into().unwrap())
    }

    pub fn retrieve(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.read_bytes(n).location(loc!())?.to_vec())
    }

    pub fn retrieve_all(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        // Cannot underflow: n is exactly what is readable.
        self.read_bytes(n).unwrap().to_vec()
    }

    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        let write_pos = data.len();
        Self {
            data,
            read_pos: 0,
            write_pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_read() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_bytes(5).unwrap(), b"hello");
        assert_eq!(buf.readable_bytes(), 6);
        assert_eq!(buf.retrieve_all(), b" world");
    }

    #[test]
    fn test_cursors_reset_when_drained() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(&[1, 2, 3, 4]);
        let _ = buf.read_bytes(4).unwrap();
        assert_eq!(buf.readable_bytes(), 0);
        // After the reset the same storage is reused from the front.
        buf.append(&[5, 6]);
        assert_eq!(buf.readable(), &[5, 6]);
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut buf = Buffer::from_bytes(&[1, 2]);
        assert!(buf.read_bytes(3).is_err());
        // A failed read consumes nothing.
        assert_eq!(buf.readable_bytes(), 2);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let mut buf = Buffer::with_capacity(2);
        let payload = vec![7u8; 1000];
        buf.append(&payload);
        assert_eq!(buf.retrieve(1000).unwrap(), payload);
    }
}
