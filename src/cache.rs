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

//! Byte-capacity accounting for locally cached objects, the victim queue,
//! and the background evictor loop the manager runs on its GC threads.

use std::alloc;
use std::alloc::Layout;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::manager::FarMemRuntime;
use crate::pointer::EvictOutcome;
use crate::pointer::PtrHandle;
use crate::prelude::*;

/// Cache slots satisfy any primitive alignment so typed views over the
/// bytes stay valid.
const SLOT_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub registered_victims: usize,
}

pub struct FarMemCache {
    cap_bytes: usize,
    used: AtomicUsize,
    victims: Mutex<VecDeque<PtrHandle>>,
    gc_wake_tx: Sender<()>,
    gc_wake_rx: Receiver<()>,
}

impl FarMemCache {
    pub fn new(cap_bytes: usize) -> Self {
        let (gc_wake_tx, gc_wake_rx) = crossbeam_channel::bounded(1);
        Self {
            cap_bytes,
            used: AtomicUsize::new(0),
            victims: Mutex::new(VecDeque::new()),
            gc_wake_tx,
            gc_wake_rx,
        }
    }

    /// Hands out a zeroed slot and charges it against the capacity. Going
    /// over capacity wakes the evictors rather than failing the allocation;
    /// a fetch in progress must land.
    pub fn allocate(&self, size: usize) -> Result<*mut u8> {
        let layout = Layout::from_size_align(size.max(1), SLOT_ALIGN).location(loc!())?;
        // SAFETY: layout has non-zero size.
        let mem = unsafe { alloc::alloc_zeroed(layout) };
        ensure!(!mem.is_null(), "cache slot allocation of {size} bytes failed");
        let used = self.used.fetch_add(size, Ordering::AcqRel) + size;
        if used > self.cap_bytes {
            self.wake_gc();
        }
        Ok(mem)
    }

    /// # Safety
    /// `mem` must come from `allocate(size)` on this cache and be freed
    /// exactly once, with no live references into it.
    pub unsafe fn deallocate(&self, mem: *mut u8, size: usize) {
        let layout = Layout::from_size_align(size.max(1), SLOT_ALIGN).unwrap();
        // SAFETY: per this function's contract.
        unsafe { alloc::dealloc(mem, layout) };
        self.used.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn note_present(&self, handle: PtrHandle) {
        self.victims.lock().unwrap().push_back(handle);
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap_bytes
    }

    pub fn over_capacity(&self) -> bool {
        self.used_bytes() > self.cap_bytes
    }

    pub fn wake_gc(&self) {
        let _ = self.gc_wake_tx.try_send(());
    }

    fn pop_victim(&self) -> Option<PtrHandle> {
        self.victims.lock().unwrap().pop_front()
    }

    fn requeue(&self, handle: PtrHandle) {
        self.victims.lock().unwrap().push_back(handle);
    }

    fn victim_count(&self) -> usize {
        self.victims.lock().unwrap().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity_bytes: self.cap_bytes,
            used_bytes: self.used_bytes(),
            registered_victims: self.victim_count(),
        }
    }
}

/// One background evictor. Sleeps until an allocation pushes the cache over
/// capacity (or a periodic tick), then walks the victim queue in arrival
/// order, skipping records that are pinned, mid-fetch, or racing another
/// evictor.
pub fn gc_loop(rt: Arc<FarMemRuntime>, exit: Arc<AtomicBool>) {
    let wake = rt.cache.gc_wake_rx.clone();
    while !exit.load(Ordering::Acquire) {
        let _ = wake.recv_timeout(Duration::from_millis(50));
        if exit.load(Ordering::Acquire) {
            break;
        }
        // Bound each round by the queue length so a fully pinned cache spins
        // the queue once instead of forever.
        let mut rounds = rt.cache.victim_count();
        while rt.cache.over_capacity() && rounds > 0 && !exit.load(Ordering::Acquire) {
            rounds -= 1;
            let Some(handle) = rt.cache.pop_victim() else {
                break;
            };
            match handle.ptr().evict(&rt) {
                Ok(EvictOutcome::Evicted) => {},
                Ok(EvictOutcome::Skipped) => {
                    if handle.ptr().is_present() {
                        rt.cache.requeue(handle);
                    }
                },
                Err(e) => {
                    error!("evicting {:?} failed: {e:?}", handle.ptr().obj_id());
                    rt.cache.requeue(handle);
                },
            }
        }
    }
    debug!("evictor exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::device::FakeDevice;
    use crate::pointer::GenericUniquePtr;
    use crate::pointer::PtrTable;
    use crate::protocol::VANILLA_DS_ID;

    #[test]
    fn test_allocation_accounting() {
        let cache = FarMemCache::new(1024);
        let a = cache.allocate(100).unwrap();
        let b = cache.allocate(924).unwrap();
        assert_eq!(cache.used_bytes(), 1024);
        assert!(!cache.over_capacity());
        let c = cache.allocate(1).unwrap();
        assert!(cache.over_capacity());
        unsafe {
            cache.deallocate(a, 100);
            cache.deallocate(b, 924);
            cache.deallocate(c, 1);
        }
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_allocations_are_zeroed_and_aligned() {
        let cache = FarMemCache::new(1024);
        let mem = cache.allocate(64).unwrap();
        assert_eq!(mem as usize % SLOT_ALIGN, 0);
        // SAFETY: fresh 64-byte allocation.
        let bytes = unsafe { std::slice::from_raw_parts(mem, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { cache.deallocate(mem, 64) };
    }

    #[test]
    fn test_gc_brings_cache_back_under_capacity() {
        // Room for two 64-byte objects; populating eight must evict.
        let rt = FarMemRuntime::for_tests_with_capacity(
            Box::new(FakeDevice::new(16 << 20).unwrap()),
            128,
        );
        let exit = Arc::new(AtomicBool::new(false));
        let gc = {
            let rt = rt.clone();
            let exit = exit.clone();
            thread::spawn(move || gc_loop(rt, exit))
        };

        let ptrs: Vec<GenericUniquePtr> = (0..8u8)
            .map(|i| GenericUniquePtr::new(VANILLA_DS_ID, vec![i], 64).unwrap())
            .collect();
        let table = Arc::new(PtrTable::new(ptrs));
        for i in 0..8 {
            PtrHandle::new(table.clone(), i).swap_in(&rt).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while rt.cache.over_capacity() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(
            !rt.cache.over_capacity(),
            "evictors left {} bytes cached with capacity {}",
            rt.cache.used_bytes(),
            rt.cache.capacity_bytes()
        );

        exit.store(true, Ordering::Release);
        rt.cache.wake_gc();
        gc.join().unwrap();
    }
}
