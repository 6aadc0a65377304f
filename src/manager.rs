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

//! The process-wide far-memory manager: owns the cache and the device,
//! issues data-structure ids, builds containers, and runs the background
//! evictors. Lifecycle is build -> use -> drop; containers must be dropped
//! before the manager.

use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use bytemuck::Pod;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::array::Array;
use crate::cache;
use crate::cache::FarMemCache;
use crate::cost_estimator;
use crate::device::FarMemDevice;
use crate::pointer::GenericUniquePtr;
use crate::pointer::PtrHandle;
use crate::pointer::PtrTable;
use crate::prelude::*;
use crate::protocol::DS_TYPE_ARRAY;
use crate::protocol::DS_TYPE_HEAP;
use crate::protocol::VANILLA_DS_ID;
use crate::rpc::Buffer;
use crate::rpc::RpcReply;
use crate::tcp_device;

/// Everything an accessor needs to move an object: the local cache and the
/// transport. Shared by containers, prefetch workers, and evictors.
pub struct FarMemRuntime {
    pub cache: FarMemCache,
    pub device: Box<dyn FarMemDevice>,
}

impl FarMemRuntime {
    #[cfg(test)]
    pub fn for_tests(device: Box<dyn FarMemDevice>) -> Arc<Self> {
        Self::for_tests_with_capacity(device, 64 << 20)
    }

    #[cfg(test)]
    pub fn for_tests_with_capacity(device: Box<dyn FarMemDevice>, cap: usize) -> Arc<Self> {
        device.construct(DS_TYPE_HEAP, VANILLA_DS_ID, &[]).unwrap();
        Arc::new(Self {
            cache: FarMemCache::new(cap),
            device,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarMemConfig {
    pub cache_bytes: usize,
    pub gc_threads: usize,
    pub num_connections: usize,
    pub prefetch_workers: usize,
    pub prefetch_num: u32,
    pub trend_window: usize,
    pub pm_ratio: f64,
    pub pushdown_ratio: f64,
    pub default_wire_speed: u64,
}

impl Default for FarMemConfig {
    fn default() -> Self {
        Self {
            cache_bytes: 256 << 20,
            gc_threads: 2,
            num_connections: tcp_device::DEFAULT_NUM_CONNECTIONS,
            prefetch_workers: 4,
            prefetch_num: 1,
            trend_window: 4096,
            pm_ratio: cost_estimator::DEFAULT_PM_RATIO,
            pushdown_ratio: cost_estimator::DEFAULT_PUSHDOWN_RATIO,
            default_wire_speed: cost_estimator::DEFAULT_WIRE_SPEED,
        }
    }
}

static MANAGER_LIVE: AtomicBool = AtomicBool::new(false);

pub struct FarMemManager {
    rt: Arc<FarMemRuntime>,
    config: FarMemConfig,
    next_ds_id: Mutex<u8>,
    gc_exit: Arc<AtomicBool>,
    gc_workers: Vec<JoinHandle<()>>,
}

impl FarMemManager {
    /// Builds the singleton: cache of `config.cache_bytes`, the vanilla
    /// heap under ds_id 0, and `config.gc_threads` background evictors. A
    /// second live manager in the process is refused.
    pub fn build(config: FarMemConfig, device: Box<dyn FarMemDevice>) -> Result<Self> {
        ensure!(
            !MANAGER_LIVE.swap(true, Ordering::AcqRel),
            "a far-memory manager is already live in this process"
        );

        let build = || -> Result<Self> {
            let rt = Arc::new(FarMemRuntime {
                cache: FarMemCache::new(config.cache_bytes),
                device,
            });
            rt.device
                .construct(DS_TYPE_HEAP, VANILLA_DS_ID, &[])
                .location(loc!())?;

            let gc_exit = Arc::new(AtomicBool::new(false));
            let gc_workers = (0..config.gc_threads)
                .map(|_| {
                    let rt = rt.clone();
                    let exit = gc_exit.clone();
                    std::thread::spawn(move || cache::gc_loop(rt, exit))
                })
                .collect();

            info!(
                "far-memory manager up: {} byte cache, {} evictors",
                config.cache_bytes, config.gc_threads
            );
            Ok(Self {
                rt,
                config,
                next_ds_id: Mutex::new(VANILLA_DS_ID + 1),
                gc_exit,
                gc_workers,
            })
        };
        build().inspect_err(|_| MANAGER_LIVE.store(false, Ordering::Release))
    }

    /// Monotonically issues the next data-structure id. The 8-bit space
    /// running out is fatal to the caller.
    pub fn allocate_ds_id(&self) -> Result<u8> {
        let mut next = self.next_ds_id.lock().unwrap();
        ensure!(*next < u8::MAX, "data-structure id space exhausted");
        let id = *next;
        *next += 1;
        Ok(id)
    }

    pub fn construct(&self, ds_type: u8, ds_id: u8, params: &[u8]) -> Result<()> {
        self.rt.device.construct(ds_type, ds_id, params).location(loc!())
    }

    pub fn destruct(&self, ds_id: u8) -> Result<()> {
        self.rt.device.destruct(ds_id).location(loc!())
    }

    /// Allocates a typed array: a fresh ds_id, the server-side instance,
    /// and the client-side pointer table with per-element object ids.
    pub fn allocate_array<T: Pod + Send + Sync>(&self, len: u64) -> Result<Array<T>> {
        let ds_id = self.allocate_ds_id().location(loc!())?;
        let params = Array::<T>::construct_params(len, mem::size_of::<T>() as u32);
        self.construct(DS_TYPE_ARRAY, ds_id, &params).location(loc!())?;
        Array::new(self.rt.clone(), &self.config, ds_id, len)
    }

    /// A standalone pointer into `ds_id` (the vanilla heap unless told
    /// otherwise).
    pub fn allocate_generic_unique_ptr(
        &self,
        ds_id: u8,
        size: u16,
        obj_id: Vec<u8>,
    ) -> Result<PtrHandle> {
        let ptr = GenericUniquePtr::new(ds_id, obj_id, size).location(loc!())?;
        Ok(PtrHandle::new(Arc::new(PtrTable::new(vec![ptr])), 0))
    }

    /// Raw method call on a server-side instance, bypassing any container
    /// cost estimator.
    pub fn call(&self, ds_id: u8, method: &str, args: &Buffer) -> Result<RpcReply> {
        self.rt.device.call(ds_id, method, args).location(loc!())
    }

    pub fn get_device(&self) -> &dyn FarMemDevice {
        self.rt.device.as_ref()
    }

    pub fn runtime(&self) -> &Arc<FarMemRuntime> {
        &self.rt
    }

    pub fn config(&self) -> &FarMemConfig {
        &self.config
    }
}

impl Drop for FarMemManager {
    fn drop(&mut self) {
        // Workers first, then the transport, then the cache dies with the
        // runtime. Containers must already be gone.
        self.gc_exit.store(true, Ordering::Release);
        for _ in &self.gc_workers {
            self.rt.cache.wake_gc();
        }
        for worker in self.gc_workers.drain(..) {
            let _ = worker.join();
        }
        if let Err(e) = self.rt.device.shutdown() {
            warn!("device shutdown failed: {e:?}");
        }
        MANAGER_LIVE.store(false, Ordering::Release);
    }
}
