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

//! Trend-driven speculative fetch. Observed accesses are distilled into
//! patterns by an `induce` function, classified by the trend predictor, and
//! turned back into future indices by `infer`; a `map` function resolves an
//! index to the pointer to pre-fault. Fetch tasks go to a small pool of
//! workers: publish into a free slot is a single release store, a parked
//! worker additionally gets its condvar signalled, and when every worker is
//! busy the fetch runs inline on the caller.

use std::hint;
use std::ptr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crate::manager::FarMemRuntime;
use crate::pointer::PtrHandle;
use crate::prelude::*;
use crate::trend::TrendPredictor;

pub const MAX_PREFETCH_WORKERS: usize = 16;
const HIT_TIMES_THRESH: u64 = 2;
const MAX_SLAVE_WAIT: Duration = Duration::from_micros(5);
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// One speculative swap-in, pinned to the generation the target had when
/// the task was induced.
struct PrefetchTask {
    handle: PtrHandle,
    generation: u64,
}

impl PrefetchTask {
    fn run(self, rt: &FarMemRuntime) {
        if let Err(e) = self.handle.swap_in_if_generation(rt, self.generation) {
            // Speculation only; the demand path will retry and report.
            debug!("speculative fetch failed: {e:?}");
        }
    }
}

struct SlaveStatus {
    task: AtomicPtr<PrefetchTask>,
    parked: AtomicBool,
    exited: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl SlaveStatus {
    fn new() -> Self {
        Self {
            task: AtomicPtr::new(ptr::null_mut()),
            parked: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn publish(&self, task: *mut PrefetchTask) -> bool {
        self.task
            .compare_exchange(ptr::null_mut(), task, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct PrefetchState<Idx, Pat> {
    predictor: TrendPredictor<Pat>,
    last_idx: Option<Idx>,
    hit_times: u64,
}

pub struct Prefetcher<Idx, Pat> {
    state: Mutex<PrefetchState<Idx, Pat>>,
    induce: Box<dyn Fn(Idx, Idx) -> Pat + Send + Sync>,
    infer: Box<dyn Fn(Idx, Pat) -> Idx + Send + Sync>,
    map: Box<dyn Fn(Idx) -> Option<PtrHandle> + Send + Sync>,
    slaves: Arc<Vec<SlaveStatus>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exit: Arc<AtomicBool>,
    rt: Arc<FarMemRuntime>,
    prefetch_num: u32,
}

fn slave_loop(rt: &FarMemRuntime, slaves: &[SlaveStatus], tid: usize, exit: &AtomicBool) {
    let slave = &slaves[tid];
    while !exit.load(Ordering::Acquire) {
        let task = slave.task.swap(ptr::null_mut(), Ordering::AcqRel);
        if !task.is_null() {
            // SAFETY: the slot holds a Box leaked by dispatch; taking it out
            // of the slot transfers ownership here.
            unsafe { Box::from_raw(task) }.run(rt);
            continue;
        }

        // Short accesses come in bursts; spin briefly before paying for the
        // condvar.
        let spin_start = Instant::now();
        let mut woke = false;
        while spin_start.elapsed() < MAX_SLAVE_WAIT {
            if !slave.task.load(Ordering::Acquire).is_null() || exit.load(Ordering::Acquire) {
                woke = true;
                break;
            }
            hint::spin_loop();
        }
        if woke {
            continue;
        }

        let guard = slave.lock.lock().unwrap();
        slave.parked.store(true, Ordering::Release);
        // A dispatcher may have published between the spin and the park;
        // only wait on a really-empty slot. The timeout bounds the window
        // where a publisher saw us unparked and skipped the signal.
        if slave.task.load(Ordering::Acquire).is_null() && !exit.load(Ordering::Acquire) {
            let _guard = slave.cv.wait_timeout(guard, PARK_TIMEOUT).unwrap();
        }
        slave.parked.store(false, Ordering::Release);
    }
    slave.exited.store(true, Ordering::Release);
}

impl<Idx, Pat> Prefetcher<Idx, Pat>
where
    Idx: Copy + Send + Sync + 'static,
    Pat: Copy + Eq + Send + Sync + 'static,
{
    pub fn new(
        rt: Arc<FarMemRuntime>,
        num_workers: usize,
        trend_window: usize,
        prefetch_num: u32,
        induce: impl Fn(Idx, Idx) -> Pat + Send + Sync + 'static,
        infer: impl Fn(Idx, Pat) -> Idx + Send + Sync + 'static,
        map: impl Fn(Idx) -> Option<PtrHandle> + Send + Sync + 'static,
    ) -> Self {
        let num_workers = num_workers.min(MAX_PREFETCH_WORKERS);
        let slaves = Arc::new((0..num_workers).map(|_| SlaveStatus::new()).collect::<Vec<_>>());
        let exit = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        for tid in 0..num_workers {
            let rt = rt.clone();
            let slaves = slaves.clone();
            let exit = exit.clone();
            workers.push(thread::spawn(move || {
                slave_loop(&rt, &slaves, tid, &exit);
            }));
        }

        Self {
            state: Mutex::new(PrefetchState {
                predictor: TrendPredictor::new(trend_window),
                last_idx: None,
                hit_times: 0,
            }),
            induce: Box::new(induce),
            infer: Box::new(infer),
            map: Box::new(map),
            slaves,
            workers: Mutex::new(workers),
            exit,
            rt,
            prefetch_num,
        }
    }

    fn dispatch(&self, task: PrefetchTask) {
        let boxed = Box::into_raw(Box::new(task));

        // First pass: a worker with an empty slot that has not parked; the
        // release store alone is enough to hand over.
        for slave in self.slaves.iter() {
            if slave.parked.load(Ordering::Acquire) {
                continue;
            }
            if slave.publish(boxed) {
                return;
            }
        }

        // Second pass: wake the first parked worker.
        for slave in self.slaves.iter() {
            if !slave.parked.load(Ordering::Acquire) {
                continue;
            }
            if slave.publish(boxed) {
                let _guard = slave.lock.lock().unwrap();
                slave.cv.notify_one();
                return;
            }
        }

        // Every slot is occupied: run the fetch on the caller.
        // SAFETY: nothing published the pointer, ownership never left us.
        unsafe { Box::from_raw(boxed) }.run(&self.rt);
    }

    fn task_for(&self, idx: Idx) -> Option<PrefetchTask> {
        let handle = (self.map)(idx)?;
        if handle.ptr().is_present() {
            return None;
        }
        let generation = handle.ptr().generation();
        Some(PrefetchTask { handle, generation })
    }

    /// Observes an access. Once the induced patterns have followed the
    /// trend twice in a row, fetch tasks for the inferred future indices
    /// are dispatched. `non_temporal` accesses still train the predictor
    /// but do not trigger speculation.
    pub fn add_trace(&self, non_temporal: bool, idx: Idx) {
        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(last) = state.last_idx.replace(idx) else {
                return;
            };
            let pattern = (self.induce)(last, idx);
            state.predictor.add_history(pattern);
            if !state.predictor.matches_trend() {
                state.hit_times = 0;
                return;
            }
            state.hit_times += 1;
            if non_temporal || state.hit_times < HIT_TIMES_THRESH {
                return;
            }

            let mut next = idx;
            for k in 0..self.prefetch_num {
                let pattern = state.predictor.get_trend(k as usize);
                next = (self.infer)(next, pattern);
                if let Some(task) = self.task_for(next) {
                    tasks.push(task);
                }
            }
        }
        // Dispatch outside the state lock: the inline fallback does IO.
        for task in tasks {
            self.dispatch(task);
        }
    }

    /// Explicit-hint prefetch: `count` steps of `pattern` from `start`.
    pub fn static_prefetch(&self, start: Idx, pattern: Pat, count: u32) {
        let mut idx = start;
        for _ in 0..count {
            if let Some(task) = self.task_for(idx) {
                self.dispatch(task);
            }
            idx = (self.infer)(idx, pattern);
        }
    }
}

impl<Idx, Pat> Drop for Prefetcher<Idx, Pat> {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        for slave in self.slaves.iter() {
            while !slave.exited.load(Ordering::Acquire) {
                let _guard = slave.lock.lock().unwrap();
                slave.cv.notify_one();
                drop(_guard);
                thread::yield_now();
            }
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
        // Free tasks that were published but never taken.
        for slave in self.slaves.iter() {
            let task = slave.task.swap(ptr::null_mut(), Ordering::AcqRel);
            if !task.is_null() {
                // SAFETY: workers have exited; the slot's Box is orphaned.
                drop(unsafe { Box::from_raw(task) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::FakeDevice;
    use crate::pointer::GenericUniquePtr;
    use crate::pointer::PtrTable;
    use crate::protocol::VANILLA_DS_ID;

    fn table_of(n: u64, item_size: u16) -> Arc<PtrTable> {
        let ptrs = (0..n)
            .map(|i| {
                GenericUniquePtr::new(VANILLA_DS_ID, i.to_be_bytes().to_vec(), item_size).unwrap()
            })
            .collect();
        Arc::new(PtrTable::new(ptrs))
    }

    fn linear_prefetcher(
        rt: Arc<FarMemRuntime>,
        table: Arc<PtrTable>,
        workers: usize,
    ) -> Prefetcher<u64, i64> {
        let map_table = table.clone();
        Prefetcher::new(
            rt,
            workers,
            4096,
            1,
            |prev: u64, cur: u64| cur as i64 - prev as i64,
            |idx: u64, pattern: i64| idx.wrapping_add_signed(pattern),
            move |idx: u64| {
                if (idx as usize) < map_table.len() {
                    Some(PtrHandle::new(map_table.clone(), idx as u32))
                } else {
                    None
                }
            },
        )
    }

    fn wait_present(table: &PtrTable, idx: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if table.get(idx).unwrap().is_present() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_linear_scan_prefetches_ahead() {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(16 << 20).unwrap()));
        let table = table_of(32, 8);
        let prefetcher = linear_prefetcher(rt.clone(), table.clone(), 2);

        // Accesses 0, 2, 4, 6, 8 with stride induction: the stride trend is
        // matched from the second pattern on, and by the access of 8 a
        // speculative fetch for 10 must be in flight before anyone reads 10.
        for idx in [0u64, 2, 4, 6, 8] {
            prefetcher.add_trace(false, idx);
        }
        assert!(wait_present(&table, 10), "index 10 was never prefetched");
        assert!(!table.get(11).unwrap().is_present());
    }

    #[test]
    fn test_inline_dispatch_without_workers() {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(16 << 20).unwrap()));
        let table = table_of(16, 8);
        let prefetcher = linear_prefetcher(rt.clone(), table.clone(), 0);

        for idx in [0u64, 1, 2, 3] {
            prefetcher.add_trace(false, idx);
        }
        // No pool: the fetch ran synchronously on the caller.
        assert!(table.get(4).unwrap().is_present());
    }

    #[test]
    fn test_static_prefetch_walks_the_hint() {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(16 << 20).unwrap()));
        let table = table_of(64, 8);
        let prefetcher = linear_prefetcher(rt.clone(), table.clone(), 4);

        prefetcher.static_prefetch(3, 4, 5);
        for idx in [3usize, 7, 11, 15, 19] {
            assert!(wait_present(&table, idx), "index {idx} missing");
        }
        assert!(!table.get(4).unwrap().is_present());
    }

    #[test]
    fn test_non_temporal_accesses_do_not_speculate() {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(16 << 20).unwrap()));
        let table = table_of(16, 8);
        let prefetcher = linear_prefetcher(rt.clone(), table.clone(), 0);

        for idx in [0u64, 1, 2, 3] {
            prefetcher.add_trace(true, idx);
        }
        assert!(!table.get(4).unwrap().is_present());
    }

    #[test]
    fn test_mispredicted_stream_stays_quiet() {
        let rt = FarMemRuntime::for_tests(Box::new(FakeDevice::new(16 << 20).unwrap()));
        let table = table_of(64, 8);
        let prefetcher = linear_prefetcher(rt.clone(), table.clone(), 0);

        for idx in [0u64, 7, 1, 13, 2, 40] {
            prefetcher.add_trace(false, idx);
        }
        assert!(table.slice().iter().all(|p| !p.is_present()));
    }
}
