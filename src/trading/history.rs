//! Bounded window of recently closed bars.

use std::collections::VecDeque;

use crate::models::Bar;

/// Most recent closed bars, newest last.
#[derive(Debug, Clone)]
pub struct BarHistory {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bar: Bar) {
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Last closed bar.
    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Bar before the last closed one.
    pub fn previous(&self) -> Option<&Bar> {
        self.bars.len().checked_sub(2).and_then(|i| self.bars.get(i))
    }

    fn last_n(&self, n: usize) -> impl Iterator<Item = &Bar> {
        self.bars.iter().rev().take(n)
    }

    /// Highest high over the last `n` bars (including the latest).
    pub fn highest_high(&self, n: usize) -> Option<f64> {
        self.last_n(n).map(|b| b.high).reduce(f64::max)
    }

    /// Lowest low over the last `n` bars (including the latest).
    pub fn lowest_low(&self, n: usize) -> Option<f64> {
        self.last_n(n).map(|b| b.low).reduce(f64::min)
    }
}
