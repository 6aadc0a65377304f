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

//! The transport seam between the far-memory manager and the authoritative
//! store, plus the in-process device used by drivers and tests that do not
//! want a socket.

use std::sync::Arc;

use crate::prelude::*;
use crate::rpc::Buffer;
use crate::rpc::RpcReply;
use crate::server::ServerStore;

pub trait FarMemDevice: Send + Sync {
    fn read_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<Vec<u8>>;
    fn write_object(&self, ds_id: u8, obj_id: &[u8], data: &[u8]) -> Result<()>;
    fn remove_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<bool>;
    fn construct(&self, ds_type: u8, ds_id: u8, params: &[u8]) -> Result<()>;
    fn destruct(&self, ds_id: u8) -> Result<()>;
    fn compute(&self, ds_id: u8, opcode: u8, input: &[u8]) -> Result<Vec<u8>>;
    fn call(&self, ds_id: u8, method: &str, args: &Buffer) -> Result<RpcReply>;
    fn shutdown(&self) -> Result<()>;
}

/// A device backed by an in-process [`ServerStore`]: the same authoritative
/// code paths as the TCP daemon, minus the sockets.
pub struct FakeDevice {
    store: Arc<ServerStore>,
}

impl FakeDevice {
    pub fn new(far_mem_size: u64) -> Result<Self> {
        let store = Arc::new(ServerStore::new());
        store.init(far_mem_size).location(loc!())?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &Arc<ServerStore> {
        &self.store
    }
}

impl FarMemDevice for FakeDevice {
    fn read_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<Vec<u8>> {
        self.store.read_object(ds_id, obj_id)
    }

    fn write_object(&self, ds_id: u8, obj_id: &[u8], data: &[u8]) -> Result<()> {
        self.store.write_object(ds_id, obj_id, data)
    }

    fn remove_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<bool> {
        self.store.remove_object(ds_id, obj_id)
    }

    fn construct(&self, ds_type: u8, ds_id: u8, params: &[u8]) -> Result<()> {
        self.store.construct(ds_type, ds_id, params)
    }

    fn destruct(&self, ds_id: u8) -> Result<()> {
        self.store.destruct(ds_id)
    }

    fn compute(&self, ds_id: u8, opcode: u8, input: &[u8]) -> Result<Vec<u8>> {
        self.store.compute(ds_id, opcode, input)
    }

    fn call(&self, ds_id: u8, method: &str, args: &Buffer) -> Result<RpcReply> {
        self.store.call(ds_id, method, args.clone())
    }

    fn shutdown(&self) -> Result<()> {
        self.store.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DS_TYPE_HEAP;

    #[test]
    fn test_fake_device_object_lifecycle() {
        let device = FakeDevice::new(1 << 20).unwrap();
        device.construct(DS_TYPE_HEAP, 1, &[]).unwrap();

        assert!(device.read_object(1, b"x").unwrap().is_empty());
        device.write_object(1, b"x", &[7, 8]).unwrap();
        assert_eq!(device.read_object(1, b"x").unwrap(), vec![7, 8]);
        assert!(device.remove_object(1, b"x").unwrap());
        assert!(!device.remove_object(1, b"x").unwrap());

        device.destruct(1).unwrap();
        assert!(device.read_object(1, b"x").is_err());
        device.shutdown().unwrap();
    }
}
