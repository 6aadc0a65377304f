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

//! Per-stream pattern memory. The predictor keeps a ring of recent patterns
//! and a cursor naming the repeating subsequence the stream is currently
//! following; each new observation either follows the trend, widens it
//! backwards, narrows it, or resets it.

/// Ring capacity is `max_win_size + 1`: the window plus the observation being
/// classified.
#[derive(Debug)]
pub struct TrendPredictor<T> {
    ring: Vec<T>,
    capacity: usize,
    trend_begin: usize,
    trend_len: usize,
    pos_in_trend: usize,
    next: usize,
    filled: usize,
    success: bool,
}

impl<T: Copy + Eq> TrendPredictor<T> {
    pub fn new(max_win_size: usize) -> Self {
        assert!(max_win_size > 0);
        Self {
            ring: Vec::new(),
            capacity: max_win_size + 1,
            trend_begin: 0,
            trend_len: 0,
            pos_in_trend: 0,
            next: 0,
            filled: 0,
            success: false,
        }
    }

    fn add_index(&self, index: usize, diff: usize) -> usize {
        (index + diff) % self.capacity
    }

    fn del_index(&self, index: usize, diff: usize) -> usize {
        (index + self.capacity - diff % self.capacity) % self.capacity
    }

    fn store(&mut self, pattern: T) {
        if self.next == self.ring.len() {
            self.ring.push(pattern);
        } else {
            self.ring[self.next] = pattern;
        }
    }

    /// The ring fills front to back, so until it wraps the cells past
    /// `ring.len()` hold nothing.
    fn stored(&self, index: usize) -> Option<T> {
        self.ring.get(index).copied()
    }

    fn advance_pos(&mut self) {
        self.pos_in_trend += 1;
        if self.pos_in_trend == self.trend_len {
            self.trend_begin = self.add_index(self.trend_begin, self.trend_len);
            self.pos_in_trend = 0;
        }
    }

    /// Scans `count` ring slots starting at `start`, returning the first one
    /// holding `pattern`.
    fn scan(&self, start: usize, count: usize, pattern: T) -> Option<usize> {
        let mut index = start;
        for _ in 0..count {
            if self.stored(index) == Some(pattern) {
                return Some(index);
            }
            index = self.add_index(index, 1);
        }
        None
    }

    fn adopt_trend_at(&mut self, begin: usize) {
        self.trend_begin = begin;
        self.trend_len = (self.next + self.capacity - begin) % self.capacity;
        self.pos_in_trend = 1 % self.trend_len;
        self.success = true;
    }

    pub fn add_history(&mut self, pattern: T) {
        if self.filled < self.capacity {
            self.filled += 1;
        }
        self.store(pattern);

        if self.trend_len == 0 {
            // Cold: predict that the stream keeps repeating this pattern.
            self.trend_begin = self.next;
            self.trend_len = 1;
            self.pos_in_trend = 0;
            self.success = true;
        } else {
            let expected = self.add_index(self.trend_begin, self.pos_in_trend);
            if self.stored(expected) == Some(pattern) {
                self.advance_pos();
                self.success = true;
            } else {
                // Try to extend the trend backwards over the history entries
                // that sit before it, widest window first.
                let extend_num = (self.filled - self.trend_len).saturating_sub(1);
                let search_start = self.del_index(self.trend_begin, extend_num);
                if let Some(begin) = self.scan(search_start, extend_num, pattern) {
                    self.adopt_trend_at(begin);
                } else {
                    // Try to narrow to a later start within the current
                    // trend, skipping the old start.
                    let narrow_num = self.trend_len - 1;
                    let search_start = self.add_index(self.trend_begin, 1);
                    if let Some(begin) = self.scan(search_start, narrow_num, pattern) {
                        self.adopt_trend_at(begin);
                    } else {
                        self.trend_begin = self.next;
                        self.trend_len = 1;
                        self.pos_in_trend = 0;
                        self.success = false;
                    }
                }
            }
        }

        self.next = self.add_index(self.next, 1);
    }

    pub fn matches_trend(&self) -> bool {
        self.success
    }

    /// The pattern expected `distance` steps ahead. Defined only while
    /// `matches_trend()`.
    pub fn get_trend(&self, distance: usize) -> T {
        assert!(self.success && self.trend_len > 0);
        let offset = (self.pos_in_trend + distance) % self.trend_len;
        self.ring[self.add_index(self.trend_begin, offset)]
    }

    pub fn predict(&mut self, pattern: T) -> Option<T> {
        self.add_history(pattern);
        if self.matches_trend() {
            Some(self.get_trend(0))
        } else {
            None
        }
    }

    pub fn trend_len(&self) -> usize {
        self.trend_len
    }
}

/// Streaming majority vote (Boyer–Moore): `is_mode` reports whether the
/// element is the current candidate majority of the stream so far.
#[derive(Debug, Default)]
pub struct BoyerMooreVote<T> {
    mode: Option<T>,
    count: u64,
}

impl<T: Copy + Eq> BoyerMooreVote<T> {
    pub fn new() -> Self {
        Self {
            mode: None,
            count: 0,
        }
    }

    pub fn is_mode(&mut self, elem: T) -> bool {
        if self.count == 0 {
            self.mode = Some(elem);
            self.count = 1;
            true
        } else if self.mode == Some(elem) {
            self.count += 1;
            true
        } else {
            self.count -= 1;
            false
        }
    }
}
