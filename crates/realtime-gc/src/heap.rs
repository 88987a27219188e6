//! The embedding API: [`RealtimeHeap`] bundles every subsystem (partition,
//! size groups, big-object table, write-vector, roots, mutator table) behind
//! a single constructible value — a process can stand up more than one
//! instance, which the test suite does routinely.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::big::BigObjectTable;
use crate::collector::{run_cycle, CollectorContext, CycleStats};
use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::group::GroupTable;
use crate::header::{Color, ColorEpoch, StorageClass};
use crate::metrics::{CollectionType, GcMetrics};
use crate::mutator::MutatorThreads;
use crate::partition::Partition;
use crate::roots::GlobalRoots;
use crate::write_vector::{self, BarrierContext, WriteVector};

/// How a spawned background collector schedules cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorMode {
    /// Run a cycle, sleep briefly, repeat, forever (until the heap shuts
    /// down). This is the default mode: cycles run continuously.
    Continuous,
    /// Block until [`RealtimeHeap::request_cycle`] is called, run exactly
    /// one cycle, then block again. An "atomic GC" mode: one cycle on
    /// demand, under the embedder's control.
    OnDemand,
}

/// Gate a background [`CollectorMode::OnDemand`] thread waits on.
struct CycleGate {
    requested: Mutex<bool>,
    condvar: Condvar,
}

impl CycleGate {
    fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn request(&self) {
        *self.requested.lock() = true;
        self.condvar.notify_one();
    }

    /// Block until requested, or until `shutdown` is observed true. Returns
    /// `false` if woken by shutdown rather than a request.
    fn wait(&self, shutdown: &AtomicBool) -> bool {
        let mut guard = self.requested.lock();
        while !*guard && !shutdown.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
        let got_request = *guard;
        *guard = false;
        got_request
    }
}

/// A complete, independently instantiable managed heap: segregated
/// size-group allocator, big-object registry, write barrier, global roots,
/// mutator thread table, and the collector loop that ties them together.
pub struct RealtimeHeap {
    config: HeapConfig,
    partition: Partition,
    groups: GroupTable,
    big: BigObjectTable,
    epoch: ColorEpoch,
    write_vector: WriteVector,
    roots: GlobalRoots,
    mutators: MutatorThreads,
    gc_count: AtomicU64,
    metrics: Mutex<GcMetrics>,
    cycle_gate: CycleGate,
    shutdown: AtomicBool,
}

impl RealtimeHeap {
    /// Reserve a fresh partition and stand up every subsystem over it. The
    /// one-line happy path is `RealtimeHeap::new(HeapConfig::default())`.
    pub fn new(config: HeapConfig) -> GcResult<Arc<Self>> {
        let partition = Partition::new(&config)?;
        let groups = GroupTable::new(config.min_group_index, config.max_group_index);
        let big = BigObjectTable::new();
        let epoch = ColorEpoch::new();
        let write_vector = WriteVector::new(&partition);
        let roots = GlobalRoots::new(&config);
        let mutators = MutatorThreads::new();
        Ok(Arc::new(Self {
            config,
            partition,
            groups,
            big,
            epoch,
            write_vector,
            roots,
            mutators,
            gc_count: AtomicU64::new(0),
            metrics: Mutex::new(GcMetrics::new()),
            cycle_gate: CycleGate::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    fn collector_context(&self) -> CollectorContext<'_> {
        CollectorContext {
            partition: &self.partition,
            groups: &self.groups,
            big: &self.big,
            config: &self.config,
            epoch: &self.epoch,
            write_vector: &self.write_vector,
            roots: &self.roots,
            mutators: &self.mutators,
        }
    }

    fn barrier_context(&self) -> BarrierContext<'_> {
        BarrierContext {
            partition: &self.partition,
            groups: &self.groups,
            big: &self.big,
            config: &self.config,
            epoch: &self.epoch,
            write_vector: &self.write_vector,
        }
    }

    /// Register the calling thread as a mutator. Must be called once per
    /// thread before it allocates, writes through the barrier, or calls
    /// [`Self::safepoint`].
    pub fn register_mutator_thread(&self) {
        self.mutators.register();
    }

    /// Remove the calling thread from the mutator table. Must be called
    /// before the thread exits.
    pub fn unregister_mutator_thread(&self) {
        self.mutators.unregister();
    }

    /// Register `[ptr, ptr + len)` as a global root, scanned conservatively
    /// on every cycle.
    pub fn register_global_root(&self, ptr: usize, len: usize) -> GcResult<()> {
        self.roots.register(ptr, len)
    }

    pub fn unregister_global_root(&self, ptr: usize) {
        self.roots.unregister(ptr);
    }

    /// Cooperative safepoint: call reasonably often (the allocator calls it
    /// on every slow-path allocation). Blocks briefly if the collector has
    /// requested a flip.
    pub fn safepoint(&self) {
        self.mutators.safepoint();
    }

    /// Allocate `size` bytes (payload, header excluded) of `class`-tagged
    /// storage. Requests exceeding the largest size group are routed to
    /// [`Self::big_allocate`] automatically.
    pub fn allocate(&self, size: usize, class: StorageClass) -> GcResult<NonNull<u8>> {
        self.safepoint();
        let total = size + crate::header::HEADER_SIZE;
        if total > self.config.max_group_size() {
            return self.big_allocate(size, class);
        }
        let group = self.groups.group_for_size(total).ok_or(GcError::OutOfMemory {
            requested: size,
            group: None,
        })?;
        let mut metrics = self.metrics.lock();
        metrics.record_allocation(group.object_size);
        drop(metrics);
        group.allocate(&self.partition, &self.epoch, class)
    }

    /// Allocate a big object (bigger than the largest size group) directly.
    pub fn big_allocate(&self, size: usize, class: StorageClass) -> GcResult<NonNull<u8>> {
        self.safepoint();
        let ptr = self.big.allocate(&self.partition, &self.epoch, class, size)?;
        self.metrics.lock().record_allocation(size);
        Ok(ptr)
    }

    /// Store a pointer write into the heap, retaining the overwritten value
    /// per the snapshot-at-the-beginning write barrier.
    ///
    /// # Safety
    ///
    /// `slot` must be a valid, writable, properly aligned `usize`-sized
    /// location inside a managed object's payload.
    pub unsafe fn write_barrier(&self, slot: NonNull<usize>, new_value: usize) {
        let start = std::time::Instant::now();
        let ctx = self.barrier_context();
        // SAFETY: caller's contract.
        unsafe { write_vector::write_barrier(&ctx, slot, new_value) };
        self.metrics.lock().record_write_barrier(start.elapsed());
    }

    /// Checked variant: under `strict-white-escape`, reports a white pointer
    /// escaping the barrier instead of silently retaining it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::write_barrier`].
    pub unsafe fn write_barrier_checked(&self, slot: NonNull<usize>, new_value: usize) -> GcResult<()> {
        let ctx = self.barrier_context();
        // SAFETY: caller's contract.
        unsafe { write_vector::write_barrier_checked(&ctx, slot, new_value) }
    }

    /// Initialize a freshly allocated, not-yet-escaped object's field: no
    /// prior value exists to retain, so this skips the barrier.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::write_barrier`].
    pub unsafe fn write_barrier_uninit(&self, slot: NonNull<usize>, new_value: usize) {
        // SAFETY: caller's contract.
        unsafe { write_vector::write_barrier_uninit(slot, new_value) };
    }

    /// Bulk pointer-range copy with barrier protection.
    ///
    /// # Safety
    ///
    /// `dest` and `src` must each be valid for `len` readable/writable bytes.
    pub unsafe fn bulk_copy(&self, dest: *mut u8, src: *const u8, len: usize) {
        let ctx = self.barrier_context();
        // SAFETY: caller's contract.
        unsafe { write_vector::bulk_copy(&ctx, dest, src, len) };
    }

    /// Bulk pointer-range fill with barrier protection.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for `len` readable/writable bytes.
    pub unsafe fn bulk_set(&self, dest: *mut u8, len: usize, value: usize) {
        let ctx = self.barrier_context();
        // SAFETY: caller's contract.
        unsafe { write_vector::bulk_set(&ctx, dest, len, value) };
    }

    /// Run one full collection cycle synchronously: stop the world, flip,
    /// scan roots, resume, drain to fixpoint, sweep, coalesce. Building
    /// block for both [`Self::spawn_collector`] and direct use in tests and
    /// benches.
    ///
    /// A returned [`GcError::InvariantViolation`] means the collector's own
    /// bookkeeping disagreed with itself (a dangling link, a miscounted
    /// list) and per the propagation policy is fatal: this method logs it
    /// with `tracing::error!` (when the `tracing` feature is enabled) and
    /// aborts the process via `panic!` rather than returning, since
    /// continuing to mutate the heap past a broken invariant is unsound.
    pub fn collect_cycle(&self) -> GcResult<CycleStats> {
        let ctx = self.collector_context();
        match run_cycle(&ctx) {
            Ok(stats) => {
                self.gc_count.fetch_add(1, Ordering::AcqRel);
                self.metrics.lock().record_cycle(
                    CollectionType::Full,
                    stats.objects_recycled,
                    stats.pages_coalesced,
                    stats.duration,
                );
                Ok(stats)
            }
            Err(GcError::InvariantViolation(what)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(what, "gc_invariant_violation");
                panic!("gc invariant violated: {what}");
            }
            Err(other) => Err(other),
        }
    }

    /// Spawn a background thread driving the collector loop per `mode`.
    /// The returned handle can be joined after [`Self::shutdown`] to wait
    /// for the thread to exit cleanly.
    #[must_use]
    pub fn spawn_collector(self: &Arc<Self>, mode: CollectorMode) -> JoinHandle<()> {
        let heap = Arc::clone(self);
        std::thread::spawn(move || loop {
            if heap.shutdown.load(Ordering::Acquire) {
                return;
            }
            match mode {
                CollectorMode::Continuous => {
                    if heap.collect_cycle().is_err() {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                CollectorMode::OnDemand => {
                    if !heap.cycle_gate.wait(&heap.shutdown) {
                        continue;
                    }
                    if heap.collect_cycle().is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Wake a [`CollectorMode::OnDemand`] background collector to run
    /// exactly one cycle. No-op if no such collector is running.
    pub fn request_cycle(&self) {
        self.cycle_gate.request();
    }

    /// Signal a spawned background collector to stop after its current
    /// cycle (or immediately, if it is blocked waiting for a request).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cycle_gate.condvar.notify_all();
    }

    #[must_use]
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Total pages currently on the empty-pages list: whole pages available
    /// to any size group. Grows as `collect_cycle`'s coalesce phase returns
    /// fully-emptied pages.
    #[must_use]
    pub fn empty_page_count(&self) -> usize {
        self.partition.empty_page_count()
    }

    /// A snapshot of the running counters. See [`GcMetrics`].
    #[must_use]
    pub fn metrics(&self) -> GcMetrics {
        let m = self.metrics.lock();
        GcMetrics {
            cycles_completed: m.cycles_completed,
            total_allocation_this_cycle: m.total_allocation_this_cycle,
            objects_recycled_last_cycle: m.objects_recycled_last_cycle,
            pages_coalesced_last_cycle: m.pages_coalesced_last_cycle,
            last_cycle_duration: m.last_cycle_duration,
            last_gc_duration: m.last_gc_duration,
            last_write_barrier_duration: m.last_write_barrier_duration,
            total_gc_duration: m.total_gc_duration,
        }
    }

    /// Cross-check every size group's and the big-object table's counters
    /// against a list walk, and every white object's header color against
    /// its list membership. Intended for tests and `debug_assertions`
    /// builds, not the allocation hot path: it walks every white object.
    pub fn verify_invariants(&self) -> GcResult<()> {
        for group in self.groups.iter() {
            let accounted = group.green_count() + group.white_count() + group.black_count();
            if accounted != group.total_object_count() {
                return Err(GcError::InvariantViolation(
                    "size group's green+white+black counts disagree with total_object_count",
                ));
            }
            let mut walked = 0usize;
            group.for_each_white(|node| {
                walked += 1;
                // SAFETY: `node` is a live white-list entry, walked under
                // the group's own mark lock.
                let color = unsafe { node.as_ref() }.color(&self.epoch);
                debug_assert_eq!(color, Color::White);
            });
            if walked != group.white_count() {
                return Err(GcError::InvariantViolation(
                    "size group's white list walk length disagrees with white_count",
                ));
            }
        }
        let big_accounted = self.big.white_count() + self.big.black_count();
        if big_accounted != self.big.total_object_count() {
            return Err(GcError::InvariantViolation(
                "big-object table's white+black counts disagree with total_object_count",
            ));
        }
        let mut big_walked = 0usize;
        self.big.for_each_white(|node| {
            big_walked += 1;
            // SAFETY: `node` is a live white-list entry.
            let color = unsafe { node.as_ref() }.color(&self.epoch);
            debug_assert_eq!(color, Color::White);
        });
        if big_walked != self.big.white_count() {
            return Err(GcError::InvariantViolation(
                "big-object table's white list walk length disagrees with white_count",
            ));
        }
        let mut empty_owned = 0usize;
        for index in 0..self.partition.page_count() {
            let info = self.partition.page_info(index);
            if info.owner() == crate::partition::PageOwner::Empty {
                empty_owned += 1;
                if info.bytes_used() != 0 {
                    return Err(GcError::InvariantViolation(
                        "a page on the empty-pages list has a nonzero live-byte count",
                    ));
                }
            }
        }
        if empty_owned != self.partition.empty_page_count() {
            return Err(GcError::InvariantViolation(
                "empty-pages list length disagrees with the page table's Empty-owned page count",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }
}
