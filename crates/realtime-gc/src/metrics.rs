//! Collection metrics: a plain counters struct updated by the collector
//! loop and read by embedders for monitoring. No visualization layer —
//! just the numbers.

use std::time::Duration;

/// Which phase a completed collection cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// A full flip → root-scan → gray-drain → write-vector-drain → sweep →
    /// coalesce cycle.
    Full,
    /// A sweep-and-coalesce pass with no flip (e.g. triggered by
    /// fragmentation alone, with no new garbage expected).
    SweepOnly,
}

/// Running counters for one [`crate::RealtimeHeap`] instance.
#[derive(Debug, Default)]
pub struct GcMetrics {
    pub cycles_completed: u64,
    pub total_allocation_this_cycle: u64,
    pub objects_recycled_last_cycle: u64,
    pub pages_coalesced_last_cycle: u64,
    pub last_cycle_duration: Duration,
    pub last_gc_duration: Duration,
    pub last_write_barrier_duration: Duration,
    pub total_gc_duration: Duration,
}

impl GcMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&mut self, bytes: usize) {
        self.total_allocation_this_cycle += bytes as u64;
    }

    pub fn record_cycle(&mut self, kind: CollectionType, recycled: usize, coalesced: usize, duration: Duration) {
        self.cycles_completed += 1;
        self.objects_recycled_last_cycle = recycled as u64;
        self.pages_coalesced_last_cycle = coalesced as u64;
        self.last_cycle_duration = duration;
        if kind == CollectionType::Full {
            self.last_gc_duration = duration;
            self.total_gc_duration += duration;
        }
        self.total_allocation_this_cycle = 0;
    }

    pub fn record_write_barrier(&mut self, duration: Duration) {
        self.last_write_barrier_duration = duration;
    }
}
