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

//! The per-object client record and its fetch state machine:
//! `ABSENT -> FETCHING -> PRESENT -> EVICTING -> ABSENT`. Accessors and the
//! evictors share each record through atomic flags; the record is never
//! locked.

use std::hint;
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use crate::deref_scope::DerefScope;
use crate::deref_scope::scope_barrier;
use crate::manager::FarMemRuntime;
use crate::prelude::*;
use crate::protocol::MAX_OBJECT_ID_LEN;

const FLAG_PRESENT: u8 = 1 << 0;
const FLAG_DIRTY: u8 = 1 << 1;
const FLAG_INFLIGHT: u8 = 1 << 2;
const FLAG_EVICTING: u8 = 1 << 3;

#[derive(Debug, Eq, PartialEq)]
pub enum EvictOutcome {
    Evicted,
    Skipped,
}

/// Client-side metadata for one remote object. The local buffer address is
/// published with release ordering once a fetch lands; the generation
/// counter increments on every eviction so a stale speculative fetch can
/// recognise the object it targeted is gone.
#[derive(Debug)]
pub struct GenericUniquePtr {
    flags: AtomicU8,
    generation: AtomicU64,
    data: AtomicPtr<u8>,
    size: u16,
    ds_id: u8,
    obj_id: Box<[u8]>,
}

impl GenericUniquePtr {
    pub fn new(ds_id: u8, obj_id: Vec<u8>, size: u16) -> Result<Self> {
        ensure!(
            obj_id.len() <= MAX_OBJECT_ID_LEN,
            "object id of {} bytes exceeds the wire limit",
            obj_id.len()
        );
        Ok(Self {
            flags: AtomicU8::new(0),
            generation: AtomicU64::new(0),
            data: AtomicPtr::new(ptr::null_mut()),
            size,
            ds_id,
            obj_id: obj_id.into_boxed_slice(),
        })
    }

    pub fn ds_id(&self) -> u8 {
        self.ds_id
    }

    pub fn obj_id(&self) -> &[u8] {
        &self.obj_id
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_present(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_PRESENT != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_DIRTY != 0
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn fetch(&self, rt: &FarMemRuntime) -> Result<()> {
        let data = rt
            .device
            .read_object(self.ds_id, &self.obj_id)
            .location(loc!())?;
        // A fresh object the server has never seen comes back empty; it
        // materialises zeroed locally and reaches the server on first flush.
        ensure!(
            data.is_empty() || data.len() == self.size as usize,
            "object size mismatch: server sent {} bytes, pointer holds {}",
            data.len(),
            self.size
        );
        let mem = rt.cache.allocate(self.size as usize).location(loc!())?;
        if !data.is_empty() {
            // SAFETY: mem is a fresh allocation of exactly `size` bytes.
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), mem, data.len()) };
        }
        self.data.store(mem, Ordering::Release);
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                Some((f | FLAG_PRESENT) & !FLAG_INFLIGHT)
            })
            .unwrap();
        Ok(())
    }

    /// Synchronously pulls the object into the cache. Threads that lose the
    /// in-flight race spin until the winner publishes.
    pub(crate) fn swap_in_raw(&self, rt: &FarMemRuntime) -> Result<()> {
        loop {
            let flags = self.flags.load(Ordering::Acquire);
            if flags & FLAG_PRESENT != 0 {
                return Ok(());
            }
            if flags & (FLAG_INFLIGHT | FLAG_EVICTING) != 0 {
                hint::spin_loop();
                thread::yield_now();
                continue;
            }
            if self
                .flags
                .compare_exchange(
                    flags,
                    flags | FLAG_INFLIGHT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            return self.fetch(rt).inspect_err(|_| {
                self.flags.fetch_and(!FLAG_INFLIGHT, Ordering::Release);
            });
        }
    }

    /// Syncs the object to the server iff it is locally dirty. Idempotent
    /// when no write intervenes.
    pub fn flush(&self, rt: &FarMemRuntime) -> Result<()> {
        let _scope = DerefScope::new();
        let flags = self.flags.load(Ordering::Acquire);
        if flags & FLAG_PRESENT == 0 || flags & FLAG_DIRTY == 0 {
            return Ok(());
        }
        self.flags.fetch_and(!FLAG_DIRTY, Ordering::AcqRel);
        let data = self.data.load(Ordering::Acquire);
        // SAFETY: the scope entered above pins the allocation: PRESENT was
        // observed after scope entry and frees only happen behind a drained
        // barrier.
        let bytes = unsafe { slice::from_raw_parts(data, self.size as usize) };
        rt.device
            .write_object(self.ds_id, &self.obj_id, bytes)
            .location(loc!())
    }

    /// Attempted `PRESENT -> EVICTING -> ABSENT` transition. Skips records
    /// that are absent, mid-fetch, already being evicted, or re-dirtied
    /// after writeback.
    pub(crate) fn evict(&self, rt: &FarMemRuntime) -> Result<EvictOutcome> {
        let claimed = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                if f & FLAG_PRESENT == 0 || f & (FLAG_INFLIGHT | FLAG_EVICTING) != 0 {
                    None
                } else {
                    Some(f | FLAG_EVICTING)
                }
            });
        if claimed.is_err() {
            return Ok(EvictOutcome::Skipped);
        }

        if self.flags.load(Ordering::Acquire) & FLAG_DIRTY != 0 {
            self.flags.fetch_and(!FLAG_DIRTY, Ordering::AcqRel);
            let data = self.data.load(Ordering::Acquire);
            // SAFETY: holding the EVICTING claim, no other thread frees the
            // allocation.
            let bytes = unsafe { slice::from_raw_parts(data, self.size as usize) };
            if let Err(e) = rt.device.write_object(self.ds_id, &self.obj_id, bytes) {
                self.flags
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                        Some((f | FLAG_DIRTY) & !FLAG_EVICTING)
                    })
                    .unwrap();
                return Err(e).location(loc!());
            }
        }

        let freed = scope_barrier().with_drained(|| {
            if self.flags.load(Ordering::Acquire) & FLAG_DIRTY != 0 {
                // A writer slipped in between writeback and the barrier;
                // this round loses.
                self.flags.fetch_and(!FLAG_EVICTING, Ordering::Release);
                None
            } else {
                let mem = self.data.swap(ptr::null_mut(), Ordering::AcqRel);
                self.flags
                    .fetch_and(!(FLAG_PRESENT | FLAG_EVICTING), Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                Some(mem)
            }
        });
        match freed {
            Some(mem) => {
                // SAFETY: mem came from the cache allocator and was detached
                // from the record behind the drained barrier.
                unsafe { rt.cache.deallocate(mem, self.size as usize) };
                Ok(EvictOutcome::Evicted)
            },
            None => Ok(EvictOutcome::Skipped),
        }
    }

    /// Drops the local copy without writeback. Used when the owning
    /// container goes away; the generation still bumps so stale prefetch
    /// tasks stay no-ops.
    pub(crate) fn discard(&self, rt: &FarMemRuntime) {
        loop {
            let flags = self.flags.load(Ordering::Acquire);
            if flags & FLAG_PRESENT == 0 && flags & FLAG_INFLIGHT == 0 {
                return;
            }
            if flags & (FLAG_INFLIGHT | FLAG_EVICTING) != 0 {
                thread::yield_now();
                continue;
            }
            if self
                .flags
                .compare_exchange(
                    flags,
                    flags | FLAG_EVICTING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            let mem = scope_barrier().with_drained(|| {
                let mem = self.data.swap(ptr::null_mut(), Ordering::AcqRel);
                self.flags.store(0, Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                mem
            });
            // SAFETY: detached behind the drained barrier, freed once.
            unsafe { rt.cache.deallocate(mem, self.size as usize) };
            return;
        }
    }
}

/// The container-owned pointer table. Containers share it with the
/// prefetcher and the evictors through an `Arc`.
#[derive(Debug)]
pub struct PtrTable {
    ptrs: Box<[GenericUniquePtr]>,
}

impl PtrTable {
    pub fn new(ptrs: Vec<GenericUniquePtr>) -> Self {
        Self {
            ptrs: ptrs.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&GenericUniquePtr> {
        self.ptrs
            .get(index)
            .with_context(loc!(), || format!("pointer index {index} out of range"))
    }

    pub fn slice(&self) -> &[GenericUniquePtr] {
        &self.ptrs
    }
}

/// A shared reference to one slot of a pointer table. Cheap to clone; this
/// is what the prefetcher queues and the cache remembers as eviction
/// victims.
#[derive(Debug, Clone)]
pub struct PtrHandle {
    table: Arc<PtrTable>,
    index: u32,
}

impl PtrHandle {
    pub fn new(table: Arc<PtrTable>, index: u32) -> Self {
        debug_assert!((index as usize) < table.len());
        Self { table, index }
    }

    pub fn ptr(&self) -> &GenericUniquePtr {
        &self.table.ptrs[self.index as usize]
    }

    pub fn swap_in(&self, rt: &FarMemRuntime) -> Result<()> {
        let was_present = self.ptr().is_present();
        self.ptr().swap_in_raw(rt).location(loc!())?;
        if !was_present {
            rt.cache.note_present(self.clone());
        }
        Ok(())
    }

    /// Speculative swap-in: a no-op when the record has been evicted since
    /// the task was induced (the generation moved on).
    pub fn swap_in_if_generation(&self, rt: &FarMemRuntime, generation: u64) -> Result<()> {
        if self.ptr().generation() != generation {
            trace!("dropping stale prefetch task for {:?}", self.ptr().obj_id());
            return Ok(());
        }
        self.swap_in(rt)
    }

    /// The fast path: while inside a dereference scope, a present object is
    /// one atomic load away. The returned bytes live as long as the scope:
    /// the eviction barrier refuses to free them earlier.
    pub fn deref<'s>(&self, _scope: &'s DerefScope, rt: &FarMemRuntime) -> Result<&'s [u8]> {
        let ptr = self.ptr();
        if !ptr.is_present() {
            self.swap_in(rt).location(loc!())?;
        }
        let data = ptr.data.load(Ordering::Acquire);
        debug_assert!(!data.is_null());
        // SAFETY: `_scope` was live before the presence check, so the
        // barrier pins this allocation for at least the scope's lifetime.
        Ok(unsafe { slice::from_raw_parts(data, ptr.size as usize) })
    }

    /// Overwrites the object's cached bytes and marks it dirty. Callers
    /// serialise writes to one object per the container ordering contract.
    pub fn write_from(&self, scope: &DerefScope, rt: &FarMemRuntime, src: &[u8]) -> Result<()> {
        let ptr = self.ptr();
        ensure!(
            src.len() == ptr.size as usize,
            "write of {} bytes into an object of {}",
            src.len(),
            ptr.size
        );
        let dst = self.deref(scope, rt).location(loc!())?.as_ptr() as *mut u8;
        // SAFETY: dst is the pinned cache slot of exactly src.len() bytes;
        // concurrent readers of a half-written object are excluded by the
        // per-container ordering contract.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        ptr.flags.fetch_or(FLAG_DIRTY, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FakeDevice;
    use crate::manager::FarMemRuntime;
    use crate::protocol::VANILLA_DS_ID;

    fn test_rt() -> Arc<FarMemRuntime> {
        FarMemRuntime::for_tests(Box::new(FakeDevice::new(64 << 20).unwrap()))
    }

    fn handle(rt: &FarMemRuntime, id: u8, size: u16) -> PtrHandle {
        let _ = rt;
        let ptr = GenericUniquePtr::new(VANILLA_DS_ID, vec![id], size).unwrap();
        PtrHandle::new(Arc::new(PtrTable::new(vec![ptr])), 0)
    }

    #[test]
    fn test_fresh_object_materialises_zeroed() {
        let rt = test_rt();
        let h = handle(&rt, 1, 16);
        assert!(!h.ptr().is_present());
        let scope = DerefScope::new();
        let bytes = h.deref(&scope, &rt).unwrap();
        assert_eq!(bytes, &[0u8; 16]);
        assert!(h.ptr().is_present());
    }

    #[test]
    fn test_write_flush_evict_read_roundtrip() {
        let rt = test_rt();
        let h = handle(&rt, 2, 4);
        {
            let scope = DerefScope::new();
            h.write_from(&scope, &rt, &[1, 2, 3, 4]).unwrap();
        }
        assert!(h.ptr().is_dirty());
        h.ptr().flush(&rt).unwrap();
        assert!(!h.ptr().is_dirty());

        let generation = h.ptr().generation();
        assert_eq!(h.ptr().evict(&rt).unwrap(), EvictOutcome::Evicted);
        assert!(!h.ptr().is_present());
        assert_eq!(h.ptr().generation(), generation + 1);

        let scope = DerefScope::new();
        assert_eq!(h.deref(&scope, &rt).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_eviction_writes_back_dirty_data() {
        let rt = test_rt();
        let h = handle(&rt, 3, 4);
        {
            let scope = DerefScope::new();
            h.write_from(&scope, &rt, &[9, 9, 9, 9]).unwrap();
        }
        // No flush: the evictor must sync the dirty bytes itself.
        assert_eq!(h.ptr().evict(&rt).unwrap(), EvictOutcome::Evicted);
        let scope = DerefScope::new();
        assert_eq!(h.deref(&scope, &rt).unwrap(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_evicting_an_absent_object_is_skipped() {
        let rt = test_rt();
        let h = handle(&rt, 4, 4);
        assert_eq!(h.ptr().evict(&rt).unwrap(), EvictOutcome::Skipped);
    }

    #[test]
    fn test_stale_generation_prefetch_is_a_noop() {
        let rt = test_rt();
        let h = handle(&rt, 5, 4);
        let stale = h.ptr().generation();
        h.swap_in(&rt).unwrap();
        assert_eq!(h.ptr().evict(&rt).unwrap(), EvictOutcome::Evicted);
        h.swap_in_if_generation(&rt, stale).unwrap();
        assert!(!h.ptr().is_present());
        h.swap_in_if_generation(&rt, h.ptr().generation()).unwrap();
        assert!(h.ptr().is_present());
    }

    #[test]
    fn test_flush_is_idempotent() {
        let rt = test_rt();
        let h = handle(&rt, 6, 4);
        {
            let scope = DerefScope::new();
            h.write_from(&scope, &rt, &[5, 6, 7, 8]).unwrap();
        }
        h.ptr().flush(&rt).unwrap();
        h.ptr().flush(&rt).unwrap();
        let scope = DerefScope::new();
        assert_eq!(h.deref(&scope, &rt).unwrap(), &[5, 6, 7, 8]);
    }
}
