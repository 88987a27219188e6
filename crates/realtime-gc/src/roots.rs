//! Global roots: embedder-registered memory ranges outside the managed
//! partition (globals, static tables) that must be scanned conservatively on
//! every cycle, exactly like a mutator's stack.
//!
//! "Static space" is the budget these ranges are accounted against
//! (`HeapConfig::static_size`) rather than a literal separate mapping — the
//! ranges themselves live wherever the embedder's own globals live; the
//! collector only remembers their bounds.

use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};

#[derive(Clone, Copy)]
struct RootRange {
    ptr: usize,
    len: usize,
}

/// The registry of global roots.
pub struct GlobalRoots {
    static_budget: usize,
    ranges: Mutex<Vec<RootRange>>,
}

impl GlobalRoots {
    #[must_use]
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            static_budget: config.static_size,
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Register `[ptr, ptr + len)` as a range to scan conservatively on every
    /// cycle. Fails if the cumulative registered bytes would exceed the
    /// configured static-space budget.
    pub fn register(&self, ptr: usize, len: usize) -> GcResult<()> {
        let mut ranges = self.ranges.lock();
        let total: usize = ranges.iter().map(|r| r.len).sum::<usize>() + len;
        if total > self.static_budget {
            return Err(GcError::OutOfMemory {
                requested: len,
                group: None,
            });
        }
        ranges.push(RootRange { ptr, len });
        Ok(())
    }

    pub fn unregister(&self, ptr: usize) {
        self.ranges.lock().retain(|r| r.ptr != ptr);
    }

    /// Invoke `f` with each registered range's `(ptr, len)`.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize)) {
        for range in self.ranges.lock().iter() {
            f(range.ptr, range.len);
        }
    }

    #[must_use]
    pub fn registered_bytes(&self) -> usize {
        self.ranges.lock().iter().map(|r| r.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let config = HeapConfig::default();
        let roots = GlobalRoots::new(&config);
        let storage = [0usize; 4];
        let ptr = storage.as_ptr() as usize;
        roots.register(ptr, std::mem::size_of_val(&storage)).unwrap();
        assert_eq!(roots.registered_bytes(), std::mem::size_of_val(&storage));
        roots.unregister(ptr);
        assert_eq!(roots.registered_bytes(), 0);
    }

    #[test]
    fn exceeding_static_budget_is_out_of_memory() {
        let config = HeapConfig {
            static_size: 16,
            ..HeapConfig::default()
        };
        let roots = GlobalRoots::new(&config);
        let err = roots.register(0x1000, 32).unwrap_err();
        assert!(matches!(err, GcError::OutOfMemory { .. }));
    }
}
