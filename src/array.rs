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

//! A typed far-memory array. Elements live on the server under their index;
//! the pointer table caches them locally, a stride prefetcher watches the
//! access stream, and `call` routes registered methods to the server or to
//! local execution per the cost estimator.

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytemuck::Pod;
use lagoon::ThreadPool;

use crate::cost_estimator::CostEstimator;
use crate::cost_estimator::CostEstimatorMap;
use crate::deref_scope::DerefScope;
use crate::manager::FarMemConfig;
use crate::manager::FarMemRuntime;
use crate::pointer::GenericUniquePtr;
use crate::pointer::PtrHandle;
use crate::pointer::PtrTable;
use crate::prefetcher::Prefetcher;
use crate::prelude::*;
use crate::rpc::Buffer;
use crate::rpc::RpcRouter;
use crate::rpc::Serializer;

pub struct Array<T> {
    table: Arc<PtrTable>,
    rt: Arc<FarMemRuntime>,
    prefetcher: Prefetcher<u64, i64>,
    dynamic_prefetch: AtomicBool,
    local_router: RpcRouter,
    estimators: CostEstimatorMap,
    ds_id: u8,
    len: u64,
    _elem: PhantomData<T>,
}

impl<T: Pod + Send + Sync> Array<T> {
    /// Built through `FarMemManager::allocate_array`, which has already
    /// constructed the server-side instance under `ds_id`.
    pub(crate) fn new(
        rt: Arc<FarMemRuntime>,
        config: &FarMemConfig,
        ds_id: u8,
        len: u64,
    ) -> Result<Self> {
        let item_size = mem::size_of::<T>();
        ensure!(item_size > 0, "zero-sized array elements");
        ensure!(
            item_size <= u16::MAX as usize,
            "array elements of {item_size} bytes exceed the object size limit"
        );
        ensure!(
            mem::align_of::<T>() <= 16,
            "array elements over-aligned for cache slots"
        );
        ensure!(
            len <= u32::MAX as u64,
            "array of {len} elements exceeds the pointer-table limit"
        );

        let ptrs = (0..len)
            .map(|i| {
                GenericUniquePtr::new(ds_id, i.to_be_bytes().to_vec(), item_size as u16)
            })
            .collect::<Result<Vec<_>>>()
            .location(loc!())?;
        let table = Arc::new(PtrTable::new(ptrs));

        let map_table = table.clone();
        let prefetcher = Prefetcher::new(
            rt.clone(),
            config.prefetch_workers,
            config.trend_window,
            config.prefetch_num,
            |prev: u64, cur: u64| cur as i64 - prev as i64,
            |idx: u64, pattern: i64| idx.wrapping_add_signed(pattern),
            move |idx: u64| {
                if idx < map_table.len() as u64 {
                    Some(PtrHandle::new(map_table.clone(), idx as u32))
                } else {
                    None
                }
            },
        );

        let mut local_router = RpcRouter::new();
        local_router.register("Add", |a: i32, b: i32| a + b);
        let read_table = table.clone();
        let read_rt = rt.clone();
        let read_size = item_size;
        local_router.register("Read", move |index: u64| -> Vec<u8> {
            if index >= read_table.len() as u64 {
                return Vec::new();
            }
            let scope = DerefScope::new();
            let handle = PtrHandle::new(read_table.clone(), index as u32);
            match handle.deref(&scope, &read_rt) {
                Ok(bytes) => bytes[..read_size].to_vec(),
                Err(e) => {
                    error!("local Read({index}) failed: {e:?}");
                    Vec::new()
                },
            }
        });

        Ok(Self {
            table,
            rt,
            prefetcher,
            dynamic_prefetch: AtomicBool::new(true),
            local_router,
            estimators: CostEstimatorMap::new(
                config.pm_ratio,
                config.pushdown_ratio,
                config.default_wire_speed,
            ),
            ds_id,
            len,
            _elem: PhantomData,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ds_id(&self) -> u8 {
        self.ds_id
    }

    fn item_size(&self) -> usize {
        mem::size_of::<T>()
    }

    fn handle(&self, index: u64) -> Result<PtrHandle> {
        ensure!(index < self.len, "array index {index} out of {}", self.len);
        Ok(PtrHandle::new(self.table.clone(), index as u32))
    }

    fn observe(&self, index: u64) {
        if self.dynamic_prefetch.load(Ordering::Relaxed) {
            self.prefetcher.add_trace(false, index);
        }
    }

    /// Copies the element out. A miss fetches synchronously; the internal
    /// scope is released once the copy is made.
    pub fn read(&self, index: u64) -> Result<T> {
        let scope = DerefScope::new();
        self.observe(index);
        let bytes = self.handle(index)?.deref(&scope, &self.rt).location(loc!())?;
        Ok(bytemuck::pod_read_unaligned(&bytes[..self.item_size()]))
    }

    /// Overwrites the element and marks it dirty locally; `flush` carries it
    /// to the server.
    pub fn write(&self, index: u64, value: T) -> Result<()> {
        let scope = DerefScope::new();
        self.observe(index);
        self.handle(index)?
            .write_from(&scope, &self.rt, bytemuck::bytes_of(&value))
            .location(loc!())
    }

    /// A borrowed view of the element, pinned for the scope's lifetime.
    pub fn at<'s>(&self, scope: &'s DerefScope, index: u64) -> Result<&'s T> {
        self.observe(index);
        let bytes = self.handle(index)?.deref(scope, &self.rt).location(loc!())?;
        Ok(bytemuck::from_bytes(&bytes[..self.item_size()]))
    }

    /// Syncs every dirty element to the server. The walk is split into
    /// equal contiguous partitions across the pool; idempotent when no
    /// write intervenes.
    #[instrument(skip(self), level = "debug", fields(ds_id = self.ds_id))]
    pub fn flush(&self) -> Result<()> {
        let ptrs = self.table.slice();
        if ptrs.is_empty() {
            return Ok(());
        }
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        let chunk_size = ptrs.len().div_ceil(workers);
        let errors: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
        let rt = &self.rt;
        ThreadPool::global().scoped(|s| {
            for chunk in ptrs.chunks(chunk_size) {
                let errors = &errors;
                s.run(move || {
                    for ptr in chunk {
                        if let Err(e) = ptr.flush(rt) {
                            errors.lock().unwrap().push(e);
                        }
                    }
                });
            }
        });
        match errors.into_inner().unwrap().pop() {
            None => Ok(()),
            Some(e) => Err(e).location(loc!()),
        }
    }

    pub fn enable_prefetch(&self) {
        self.dynamic_prefetch.store(true, Ordering::Relaxed);
    }

    pub fn disable_prefetch(&self) {
        self.dynamic_prefetch.store(false, Ordering::Relaxed);
    }

    /// Explicit `(start, step, count)` prefetch hint. Turns dynamic
    /// prefetch off: the hint knows better than the trend.
    pub fn static_prefetch(&self, start: u64, step: i64, count: u32) {
        self.disable_prefetch();
        self.prefetcher.static_prefetch(start, step, count);
    }

    /// Registers a method on the client-side router so the estimator may
    /// run it locally. The server-side instance must know it too.
    pub fn register_local<Args>(
        &mut self,
        name: impl Into<String>,
        func: impl crate::rpc::router::RpcHandler<Args>,
    ) {
        self.local_router.register(name, func);
    }

    fn dirty_bytes(&self) -> u64 {
        self.table.slice().iter().filter(|p| p.is_dirty()).count() as u64
            * self.item_size() as u64
    }

    fn absent_bytes(&self) -> u64 {
        self.table.slice().iter().filter(|p| !p.is_present()).count() as u64
            * self.item_size() as u64
    }

    /// Invokes a registered method over the array, choosing between server
    /// execution (flush dirty data, call remotely) and local execution
    /// (fault absent data in, run the local handler) by the method's cost
    /// record. Returns the success flag and the reply payload;
    /// `MethodNotFound` is the one benign failure.
    #[instrument(skip(self, args), level = "debug", fields(ds_id = self.ds_id))]
    pub fn call(&self, method: &str, args: &Buffer) -> Result<(bool, Buffer)> {
        let estimator = self.estimators.get(method);
        let flush_bytes = self.dirty_bytes();
        let load_bytes = self.absent_bytes();
        let pushdown = estimator
            .lock()
            .unwrap()
            .suggest_pushdown(flush_bytes, load_bytes);

        let reply = if pushdown {
            debug!("pushing {method} down to the server");
            estimator.lock().unwrap().start_bench();
            self.flush().location(loc!())?;
            estimator.lock().unwrap().flush_over(flush_bytes);

            estimator.lock().unwrap().start_bench();
            let reply = self.rt.device.call(self.ds_id, method, args).location(loc!())?;
            estimator
                .lock()
                .unwrap()
                .compute_in_memory_over(reply.ret.readable_bytes() as u64);
            reply
        } else {
            debug!("running {method} locally");
            estimator.lock().unwrap().start_bench();
            for index in 0..self.len {
                let handle = PtrHandle::new(self.table.clone(), index as u32);
                if !handle.ptr().is_present() {
                    handle.swap_in(&self.rt).location(loc!())?;
                }
            }
            let reply = self.local_router.call(method, args.clone()).location(loc!())?;
            estimator
                .lock()
                .unwrap()
                .compute_in_processor_over(load_bytes);
            reply
        };
        Ok((reply.success(), reply.ret))
    }

    /// Seeds the cost record for a method (tests and warm starts).
    pub fn set_estimator(&self, method: &str, estimator: CostEstimator) {
        self.estimators.set(method, estimator);
    }

    pub(crate) fn construct_params(len: u64, item_size: u32) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write(&len).write(&item_size);
        ser.into_buffer().retrieve_all()
    }
}

impl<T> Drop for Array<T> {
    fn drop(&mut self) {
        // Local copies only; the server keeps the authoritative bytes until
        // the manager destructs the instance.
        for ptr in self.table.slice() {
            ptr.discard(&self.rt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FakeDevice;
    use crate::protocol::DS_TYPE_ARRAY;
    use crate::rpc::router::args_to_buffer;
    use crate::rpc::router::return_value_from_buffer;

    fn test_array(len: u64) -> Array<i32> {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(64 << 20).unwrap()));
        let config = FarMemConfig::default();
        let ds_id = 1;
        rt.device
            .construct(
                DS_TYPE_ARRAY,
                ds_id,
                &Array::<i32>::construct_params(len, mem::size_of::<i32>() as u32),
            )
            .unwrap();
        Array::new(rt, &config, ds_id, len).unwrap()
    }

    #[test]
    fn test_write_flush_read_roundtrip() {
        let array = test_array(1000);
        for i in 0..1000u64 {
            array.write(i, i as i32).unwrap();
        }
        array.flush().unwrap();
        assert!(array.table.slice().iter().all(|p| !p.is_dirty()));

        for i in 0..1000u64 {
            assert_eq!(array.read(i).unwrap(), i as i32);
        }

        // The server holds the authoritative copy: reads survive a full
        // local discard.
        for ptr in array.table.slice() {
            ptr.discard(&array.rt);
        }
        for i in (0..1000u64).step_by(97) {
            assert_eq!(array.read(i).unwrap(), i as i32);
        }
    }

    #[test]
    fn test_flush_is_idempotent() {
        let array = test_array(32);
        array.write(3, 42).unwrap();
        array.flush().unwrap();
        array.flush().unwrap();
        assert_eq!(array.read(3).unwrap(), 42);
    }

    #[test]
    fn test_scoped_borrow() {
        let array = test_array(8);
        array.write(5, 99).unwrap();
        let scope = DerefScope::new();
        let elem = array.at(&scope, 5).unwrap();
        assert_eq!(*elem, 99);
    }

    #[test]
    fn test_call_add_pushes_down_cold() {
        let array = test_array(8);
        let (success, ret) = array.call("Add", &args_to_buffer(&(2i32, 3i32))).unwrap();
        assert!(success);
        assert_eq!(return_value_from_buffer::<i32>(ret).unwrap(), 5);
    }

    #[test]
    fn test_call_read_returns_element_bytes() {
        let array = test_array(1000);
        array.write(4, 4).unwrap();
        array.flush().unwrap();

        let (success, ret) = array.call("Read", &args_to_buffer(&(4u64,))).unwrap();
        assert!(success);
        let bytes = return_value_from_buffer::<Vec<u8>>(ret).unwrap();
        assert_eq!(bytes.len(), mem::size_of::<i32>());
        assert_eq!(i32::from_ne_bytes(bytes.try_into().unwrap()), 4);
    }

    #[test]
    fn test_call_missing_method() {
        let array = test_array(8);
        let (success, ret) = array
            .call("Multiply", &args_to_buffer(&(2i32, 3i32)))
            .unwrap();
        assert!(!success);
        assert!(ret.is_empty());
    }

    #[test]
    fn test_call_runs_locally_when_estimator_says_so() {
        let array = test_array(8);
        array.write(0, 7).unwrap();
        // Huge flush cost, nothing to load: local execution wins.
        array.set_estimator("Add", CostEstimator::seeded(1_000_000, 1000, 100, 0.9, 0.95));
        let (success, ret) = array.call("Add", &args_to_buffer(&(20i32, 30i32))).unwrap();
        assert!(success);
        assert_eq!(return_value_from_buffer::<i32>(ret).unwrap(), 50);
        // The local path faulted the whole table in.
        assert!(array.table.slice().iter().all(|p| p.is_present()));
    }

    #[test]
    fn test_out_of_range_access_fails() {
        let array = test_array(4);
        assert!(array.read(4).is_err());
        assert!(array.write(4, 0).is_err());
    }
}
