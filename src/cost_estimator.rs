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

//! Online estimates of wire speed and compute time, and the per-call
//! pushdown decision they feed. Estimates are noisy; every new sample is
//! folded in by arithmetic mean with the stored value, and the first sample
//! is adopted verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use crate::prelude::*;

pub const DEFAULT_PM_RATIO: f64 = 0.9;
pub const DEFAULT_PUSHDOWN_RATIO: f64 = 0.98;
pub const DEFAULT_WIRE_SPEED: u64 = 950_000_000;

const S_TO_US: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct CostEstimator {
    wire_speed: u64,
    t_mem: u64,
    t_proc: u64,
    t_ret: u64,
    pm_ratio: f64,
    pushdown_ratio: f64,
    default_wire_speed: u64,
    start: Option<Instant>,
}

impl CostEstimator {
    pub fn new(pm_ratio: f64, pushdown_ratio: f64, default_wire_speed: u64) -> Self {
        Self {
            wire_speed: 0,
            t_mem: 0,
            t_proc: 0,
            t_ret: 0,
            pm_ratio,
            pushdown_ratio,
            default_wire_speed,
            start: None,
        }
    }

    /// Pre-populated estimator state. Used to warm-start a method whose
    /// costs are known, and by tests that need a deterministic decision.
    pub fn seeded(
        wire_speed: u64,
        t_mem: u64,
        t_ret: u64,
        pm_ratio: f64,
        pushdown_ratio: f64,
    ) -> Self {
        Self {
            wire_speed,
            t_mem,
            t_proc: (t_mem as f64 * pm_ratio) as u64,
            t_ret,
            pm_ratio,
            pushdown_ratio,
            default_wire_speed: wire_speed,
            start: None,
        }
    }

    pub fn start_bench(&mut self) {
        self.start = Some(Instant::now());
    }

    fn end_bench(&mut self) -> u64 {
        let start = self.start.take();
        debug_assert!(start.is_some(), "end of an unstarted benchmark interval");
        let us = start.map_or(0, |s| s.elapsed().as_micros() as u64);
        us.max(1)
    }

    fn fold(old: u64, new: u64) -> u64 {
        if old == 0 { new } else { (old + new) / 2 }
    }

    /// A flush of `flush_bytes` just finished; folds the observed wire
    /// speed. A zero-byte flush observed nothing, so the configured default
    /// speed is folded instead.
    pub fn flush_over(&mut self, flush_bytes: u64) {
        let us = self.end_bench();
        let speed = if flush_bytes == 0 {
            self.default_wire_speed
        } else {
            flush_bytes * S_TO_US / us
        };
        self.wire_speed = Self::fold(self.wire_speed, speed);
        trace!(
            "flushed {flush_bytes} bytes in {us} us, wire_speed now {}",
            self.wire_speed
        );
    }

    /// A remote (in-memory) execution returning `ret_bytes` just finished;
    /// splits the elapsed time into result transport and server compute, and
    /// projects the local compute time through pm_ratio.
    pub fn compute_in_memory_over(&mut self, ret_bytes: u64) {
        let us = self.end_bench();
        let t_ret = ret_bytes * S_TO_US / self.wire_speed.max(1);
        let t_mem = us.saturating_sub(t_ret);
        let t_proc = (t_mem as f64 * self.pm_ratio) as u64;
        if self.t_mem == 0 {
            self.t_ret = t_ret;
            self.t_mem = t_mem;
            self.t_proc = t_proc;
        } else {
            self.t_ret = Self::fold(self.t_ret, t_ret);
            self.t_mem = Self::fold(self.t_mem, t_mem);
            self.t_proc = Self::fold(self.t_proc, t_proc);
        }
        trace!(
            "remote compute returned {ret_bytes} bytes in {us} us: t_ret {}, t_mem {}, t_proc {}",
            self.t_ret, self.t_mem, self.t_proc
        );
    }

    /// A local execution that first loaded `load_bytes` just finished; folds
    /// the local compute time and refreshes pm_ratio from the measured pair.
    pub fn compute_in_processor_over(&mut self, load_bytes: u64) {
        let us = self.end_bench();
        let t_proc = us.saturating_sub(load_bytes * S_TO_US / self.wire_speed.max(1));
        self.t_proc = Self::fold(self.t_proc, t_proc);
        if self.t_mem != 0 {
            self.pm_ratio = self.t_proc as f64 / self.t_mem as f64;
        }
        trace!(
            "local compute loaded {load_bytes} bytes in {us} us: t_proc {}, pm_ratio {}",
            self.t_proc, self.pm_ratio
        );
    }

    /// Whether the next call should run on the server. `flush_bytes` is what
    /// the pushdown path must sync first; `load_bytes` is what the local
    /// path must fetch first. Cold start always pushes down.
    pub fn suggest_pushdown(&self, flush_bytes: u64, load_bytes: u64) -> bool {
        if self.t_mem == 0 {
            return true;
        }
        let wire = self.wire_speed.max(1);
        let t_pushdown = flush_bytes * S_TO_US / wire + self.t_mem + self.t_ret;
        let t_local = load_bytes * S_TO_US / wire + self.t_proc;
        let threshold = (t_pushdown as f64 * self.pushdown_ratio) as u64;
        let suggestion = t_local >= threshold;
        debug!(
            "suggest_pushdown(flush {flush_bytes}, load {load_bytes}): \
             t_pushdown {t_pushdown}, t_local {t_local}, threshold {threshold} -> {suggestion}"
        );
        suggestion
    }

    pub fn wire_speed(&self) -> u64 {
        self.wire_speed
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (self.wire_speed, self.t_mem, self.t_proc, self.t_ret)
    }
}

/// Per-method estimators, created on first use with the configured defaults.
#[derive(Debug, Clone)]
pub struct CostEstimatorMap {
    pm_ratio: f64,
    pushdown_ratio: f64,
    default_wire_speed: u64,
    estimators: Arc<Mutex<HashMap<String, Arc<Mutex<CostEstimator>>>>>,
}

impl CostEstimatorMap {
    pub fn new(pm_ratio: f64, pushdown_ratio: f64, default_wire_speed: u64) -> Self {
        Self {
            pm_ratio,
            pushdown_ratio,
            default_wire_speed,
            estimators: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set(&self, method: &str, estimator: CostEstimator) {
        self.estimators
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(Mutex::new(estimator)));
    }

    pub fn get(&self, method: &str) -> Arc<Mutex<CostEstimator>> {
        self.estimators
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CostEstimator::new(
                    self.pm_ratio,
                    self.pushdown_ratio,
                    self.default_wire_speed,
                )))
            })
            .clone()
    }
}
