//! Per-destination send queue.
//!
//! A plain FIFO of pending `(metric, datapoint)` entries. The queue itself
//! never drops: the overflow policy (drop the newest datapoint at the hard
//! cap) belongs to the session, which checks the length before pushing.

use crate::metric::{Datapoint, MetricName};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SendQueue {
    entries: VecDeque<(MetricName, Datapoint)>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one entry. O(1) amortized.
    pub fn push(&mut self, metric: MetricName, datapoint: Datapoint) {
        self.entries.push_back((metric, datapoint));
    }

    /// Detach up to `n` entries from the head, in FIFO order.
    pub fn take_batch(&mut self, n: usize) -> Vec<(MetricName, Datapoint)> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }
}
