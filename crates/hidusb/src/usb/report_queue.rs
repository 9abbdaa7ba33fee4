//! Bounded FIFO of unread input reports
//!
//! Reports arrive from the input pipeline faster than a slow (or absent)
//! reader consumes them. The queue keeps at most `capacity` entries and drops
//! the oldest report on overflow, so a reader that comes back always sees the
//! most recent device state.

use std::collections::VecDeque;
use tracing::{trace, warn};

/// Capped input report queue with drop-oldest overflow
#[derive(Debug)]
pub struct ReportQueue {
    /// Queued reports, head is the oldest
    reports: VecDeque<Vec<u8>>,
    /// Maximum number of queued reports
    capacity: usize,
    /// Total reports received (for stats)
    total_received: u64,
    /// Total reports dropped due to overflow
    total_dropped: u64,
}

impl ReportQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reports: VecDeque::with_capacity(capacity + 1),
            capacity,
            total_received: 0,
            total_dropped: 0,
        }
    }

    /// Append a report at the tail
    ///
    /// Returns `true` if the queue was empty before, i.e. a waiting reader
    /// needs to be woken.
    pub fn push(&mut self, report: Vec<u8>) -> bool {
        let was_empty = self.reports.is_empty();
        let len = report.len();

        self.reports.push_back(report);
        self.total_received += 1;

        if self.reports.len() > self.capacity {
            self.reports.pop_front();
            self.total_dropped += 1;
            warn!(
                "Input report queue overflow, dropped oldest report (total dropped: {})",
                self.total_dropped
            );
        }

        trace!("Queued input report: len={}, queued={}", len, self.reports.len());
        was_empty
    }

    /// Remove the oldest report
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.reports.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (received, dropped)
    pub fn stats(&self) -> (u64, u64) {
        (self.total_received, self.total_dropped)
    }
}
