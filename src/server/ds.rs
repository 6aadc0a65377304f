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

//! Server-side data-structure instances. Every instance answers the same
//! capability set (read/write/remove object, the reserved compute slot, and
//! router-dispatched calls) as a tagged variant rather than a class
//! hierarchy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use enum_as_inner::EnumAsInner;

use crate::prelude::*;
use crate::protocol::DS_TYPE_ARRAY;
use crate::protocol::DS_TYPE_HEAP;
use crate::rpc::Buffer;
use crate::rpc::RpcReply;
use crate::rpc::RpcRouter;
use crate::rpc::Serializer;

/// The vanilla blob store: object ids are opaque byte strings, payloads are
/// whatever the client evicted.
#[derive(Default)]
pub struct ServerHeap {
    objects: HashMap<Vec<u8>, Vec<u8>>,
    router: RpcRouter,
}

impl ServerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_object(&self, obj_id: &[u8]) -> Vec<u8> {
        // Missing means never flushed: the client materialises it zeroed.
        self.objects.get(obj_id).cloned().unwrap_or_default()
    }

    fn write_object(&mut self, obj_id: &[u8], data: &[u8]) {
        self.objects.insert(obj_id.to_vec(), data.to_vec());
    }

    fn remove_object(&mut self, obj_id: &[u8]) -> bool {
        self.objects.remove(obj_id).is_some()
    }
}

struct ArrayStorage {
    data: Vec<u8>,
    item_size: u32,
    num_items: u64,
}

/// Flat `num_items x item_size` storage addressed by a big-endian u64
/// element index. Registers the built-in `Add` and `Read` methods on its
/// router.
pub struct ServerArray {
    storage: Arc<Mutex<ArrayStorage>>,
    router: RpcRouter,
}

impl ServerArray {
    pub fn new(num_items: u64, item_size: u32) -> Result<Self> {
        let total = num_items
            .checked_mul(u64::from(item_size))
            .context(loc!(), "array storage size overflows")?;
        let total = usize::try_from(total).location(loc!())?;
        let storage = Arc::new(Mutex::new(ArrayStorage {
            data: vec![0; total],
            item_size,
            num_items,
        }));

        let mut router = RpcRouter::new();
        router.register("Add", |a: i32, b: i32| a + b);
        let read_storage = storage.clone();
        router.register("Read", move |index: u64| -> Vec<u8> {
            let storage = read_storage.lock().unwrap();
            if index >= storage.num_items {
                return Vec::new();
            }
            let item = storage.item_size as usize;
            let start = index as usize * item;
            storage.data[start..start + item].to_vec()
        });

        Ok(Self { storage, router })
    }

    pub fn from_params(params: &[u8]) -> Result<Self> {
        let mut params = Serializer::from(Buffer::from_bytes(params));
        let num_items: u64 = params.read().location(loc!())?;
        let item_size: u32 = params.read().location(loc!())?;
        Self::new(num_items, item_size)
    }

    fn index_of(&self, obj_id: &[u8]) -> Result<usize> {
        let index = u64::from_be_bytes(
            obj_id
                .try_into()
                .context(loc!(), "array object id is not a u64 index")?,
        );
        let num_items = self.storage.lock().unwrap().num_items;
        ensure!(index < num_items, "array index {index} out of {num_items}");
        Ok(index as usize)
    }

    fn read_object(&self, obj_id: &[u8]) -> Result<Vec<u8>> {
        let index = self.index_of(obj_id).location(loc!())?;
        let storage = self.storage.lock().unwrap();
        let item = storage.item_size as usize;
        Ok(storage.data[index * item..(index + 1) * item].to_vec())
    }

    fn write_object(&self, obj_id: &[u8], data: &[u8]) -> Result<()> {
        let index = self.index_of(obj_id).location(loc!())?;
        let mut storage = self.storage.lock().unwrap();
        let item = storage.item_size as usize;
        ensure!(
            data.len() == item,
            "array item write of {} bytes, item size {item}",
            data.len()
        );
        storage.data[index * item..(index + 1) * item].copy_from_slice(data);
        Ok(())
    }
}

#[derive(EnumAsInner)]
pub enum ServerDs {
    Heap(ServerHeap),
    Array(ServerArray),
}

impl ServerDs {
    pub fn build(ds_type: u8, params: &[u8]) -> Result<Self> {
        match ds_type {
            DS_TYPE_HEAP => Ok(Self::Heap(ServerHeap::new())),
            DS_TYPE_ARRAY => Ok(Self::Array(
                ServerArray::from_params(params).location(loc!())?,
            )),
            other => bail!("unknown data structure type {other}"),
        }
    }

    pub fn read_object(&self, obj_id: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Heap(heap) => Ok(heap.read_object(obj_id)),
            Self::Array(array) => array.read_object(obj_id),
        }
    }

    pub fn write_object(&mut self, obj_id: &[u8], data: &[u8]) -> Result<()> {
        match self {
            Self::Heap(heap) => {
                heap.write_object(obj_id, data);
                Ok(())
            },
            Self::Array(array) => array.write_object(obj_id, data),
        }
    }

    pub fn remove_object(&mut self, obj_id: &[u8]) -> Result<bool> {
        match self {
            Self::Heap(heap) => Ok(heap.remove_object(obj_id)),
            Self::Array(_) => {
                // Array elements are fixed for the instance's lifetime.
                warn!("remove_object on an array instance");
                Ok(false)
            },
        }
    }

    /// Reserved wire slot: no in-tree data structure implements compute.
    pub fn compute(&mut self, opcode: u8, _input: &[u8]) -> Result<Vec<u8>> {
        debug!("compute opcode {opcode} on a data structure without compute support");
        Ok(Vec::new())
    }

    pub fn call(&self, method: &str, args: Buffer) -> Result<RpcReply> {
        let router = match self {
            Self::Heap(heap) => &heap.router,
            Self::Array(array) => &array.router,
        };
        router.call(method, args)
    }

    pub fn methods(&self) -> Vec<String> {
        match self {
            Self::Heap(heap) => heap.router.methods(),
            Self::Array(array) => array.router.methods(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::router::args_to_buffer;
    use crate::rpc::router::return_value_from_buffer;

    fn array_params(num_items: u64, item_size: u32) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write(&num_items).write(&item_size);
        ser.into_buffer().retrieve_all()
    }

    #[test]
    fn test_heap_read_write_remove() {
        let mut ds = ServerDs::build(DS_TYPE_HEAP, &[]).unwrap();
        assert!(ds.read_object(b"missing").unwrap().is_empty());
        ds.write_object(b"k", &[1, 2, 3]).unwrap();
        assert_eq!(ds.read_object(b"k").unwrap(), vec![1, 2, 3]);
        assert!(ds.remove_object(b"k").unwrap());
        assert!(!ds.remove_object(b"k").unwrap());
    }

    #[test]
    fn test_array_flat_storage_by_index() {
        let mut ds = ServerDs::build(DS_TYPE_ARRAY, &array_params(4, 8)).unwrap();
        let obj_id = 2u64.to_be_bytes();
        assert_eq!(ds.read_object(&obj_id).unwrap(), vec![0; 8]);
        ds.write_object(&obj_id, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(
            ds.read_object(&obj_id).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        // Neighbours are untouched.
        assert_eq!(ds.read_object(&1u64.to_be_bytes()).unwrap(), vec![0; 8]);

        assert!(ds.read_object(&9u64.to_be_bytes()).is_err());
        assert!(ds.write_object(&obj_id, &[1]).is_err());
    }

    #[test]
    fn test_array_builtin_rpc_methods() {
        let ds = ServerDs::build(DS_TYPE_ARRAY, &array_params(8, 4)).unwrap();
        assert_eq!(ds.methods(), vec!["Add".to_string(), "Read".to_string()]);

        let reply = ds.call("Add", args_to_buffer(&(2i32, 3i32))).unwrap();
        assert!(reply.success());
        assert_eq!(return_value_from_buffer::<i32>(reply.ret).unwrap(), 5);

        let array = ds.as_array().unwrap();
        array.write_object(&4u64.to_be_bytes(), &4i32.to_le_bytes()).unwrap();
        let reply = ds.call("Read", args_to_buffer(&(4u64,))).unwrap();
        assert!(reply.success());
        let bytes = return_value_from_buffer::<Vec<u8>>(reply.ret).unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 4);
    }

    #[test]
    fn test_compute_is_reserved_and_empty() {
        let mut ds = ServerDs::build(DS_TYPE_ARRAY, &array_params(1, 1)).unwrap();
        assert!(ds.compute(0, &[1, 2]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_ds_type_fails() {
        assert!(ServerDs::build(200, &[]).is_err());
    }
}
