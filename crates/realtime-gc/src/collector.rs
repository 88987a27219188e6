//! The collector loop: flip -> root scan -> gray drain / write-vector drain
//! (to fixpoint) -> sweep -> coalesce, bundled into a single `run_cycle`
//! entry point that `crate::heap::RealtimeHeap` drives either once (a
//! synchronous on-demand collection) or repeatedly from a background
//! thread.
//!
//! Suspension happens only around flip and root scanning: `flip()` and
//! `scan_roots()` both run while every mutator is parked in
//! [`crate::mutator::MutatorThreads::stop_the_world`]; everything else
//! (`drain_to_fixpoint`, `sweep_all`, `coalesce_all`) runs fully concurrently
//! with resumed mutators, bounding the pause to the cost of one register
//! spill and a snapshot per thread.
//!
//! This implementation's write barrier (`crate::write_vector::write_barrier`)
//! grays the overwritten referent immediately rather than deferring it to a
//! later write-vector replay pass; the write-vector bit per slot exists only
//! to avoid re-reading and re-graying the same slot twice in one cycle. That
//! means `drain_to_fixpoint`'s loop-until-no-gray-objects-remain is already
//! draining everything a separate write-vector-replay phase would have
//! found: once a pass finds nothing gray anywhere, every object
//! reachable from a root is black, and the only way a mutator could make a
//! white object reachable again is by writing a pointer to it into an
//! already-visible slot, which the still-enabled barrier would catch and
//! gray on the spot. So disabling the barrier right after the fixpoint and
//! proceeding to sweep is sound without a second catch-up pass.

use std::time::{Duration, Instant};

use crate::big::BigObjectTable;
use crate::config::HeapConfig;
use crate::error::GcResult;
use crate::group::GroupTable;
use crate::header::ColorEpoch;
use crate::marker::drain_gray_worklist;
use crate::mutator::{MutatorThreads, ThreadSnapshot};
use crate::partition::{PageOwner, Partition};
use crate::roots::GlobalRoots;
use crate::write_vector::WriteVector;

#[cfg(feature = "tracing")]
use crate::tracing_support::internal::{log_phase_end, log_phase_start, trace_phase, CollectorPhase};

/// Every reference the collector loop needs for one cycle. Bundled so
/// `run_cycle(&ctx)` reads as one call instead of nine positional arguments.
pub struct CollectorContext<'a> {
    pub partition: &'a Partition,
    pub groups: &'a GroupTable,
    pub big: &'a BigObjectTable,
    pub config: &'a HeapConfig,
    pub epoch: &'a ColorEpoch,
    pub write_vector: &'a WriteVector,
    pub roots: &'a GlobalRoots,
    pub mutators: &'a MutatorThreads,
}

/// What one completed cycle accomplished, for [`crate::metrics::GcMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub objects_recycled: usize,
    pub pages_coalesced: usize,
    pub duration: Duration,
}

/// Flip every size group and the big-object table: this cycle's black
/// becomes next cycle's white, then the color epoch itself swaps so the
/// reinterpretation is instantaneous across every live object. Must run
/// while every mutator is parked (no allocation can race the list-pointer
/// swap) and with every group's gray worklist already empty (the previous
/// cycle's drain reached a fixpoint, or this is the first cycle).
fn flip(ctx: &CollectorContext<'_>) -> GcResult<()> {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(CollectorPhase::Flip);
    #[cfg(feature = "tracing")]
    log_phase_start(CollectorPhase::Flip);

    for group in ctx.groups.iter() {
        group.flip()?;
    }
    ctx.big.flip()?;
    ctx.epoch.flip();
    ctx.write_vector.reset();

    #[cfg(feature = "tracing")]
    log_phase_end(CollectorPhase::Flip, 0);
    Ok(())
}

/// Scan every root: each parked mutator's saved stack range and spilled
/// registers, plus every range registered via [`GlobalRoots`]. Must run
/// while mutators are still parked — the snapshots are only valid stack
/// contents for the instant they were taken at the safepoint.
fn scan_roots(ctx: &CollectorContext<'_>, snapshots: &[ThreadSnapshot]) -> GcResult<usize> {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(CollectorPhase::RootScan);
    #[cfg(feature = "tracing")]
    log_phase_start(CollectorPhase::RootScan);

    let mut grayed = 0usize;
    for snapshot in snapshots {
        let len = snapshot.stack_high.saturating_sub(snapshot.stack_pointer);
        // SAFETY: `snapshot` was captured moments ago at a safepoint, while
        // the owning thread is parked; its stack between `stack_pointer` and
        // `stack_high` is stable for the duration of this call.
        unsafe {
            crate::marker::scan_memory_segment(
                ctx.partition,
                ctx.groups,
                ctx.big,
                ctx.config,
                ctx.epoch,
                snapshot.stack_pointer as *const u8,
                len,
                |_| grayed += 1,
            );
        }
        // SAFETY: `registers` is a plain array owned by `snapshot`, valid
        // for the duration of this call.
        unsafe {
            crate::marker::scan_memory_segment(
                ctx.partition,
                ctx.groups,
                ctx.big,
                ctx.config,
                ctx.epoch,
                snapshot.registers.as_ptr().cast::<u8>(),
                std::mem::size_of_val(&snapshot.registers),
                |_| grayed += 1,
            );
        }
    }

    ctx.roots.for_each(|ptr, len| {
        // A registered global is a conservative memory range (globals,
        // static tables), scanned exactly like a mutator's stack.
        // SAFETY: embedder's contract on `GlobalRoots::register` is that
        // `[ptr, ptr + len)` stays live and readable for as long as it is
        // registered.
        unsafe {
            crate::marker::scan_memory_segment(
                ctx.partition,
                ctx.groups,
                ctx.big,
                ctx.config,
                ctx.epoch,
                ptr as *const u8,
                len,
                |_| grayed += 1,
            );
        }
    });

    #[cfg(feature = "tracing")]
    log_phase_end(CollectorPhase::RootScan, grayed);
    Ok(grayed)
}

/// Drain the gray worklist to a fixpoint. Safe to call with mutators
/// resumed: the write barrier keeps graying newly-overwritten white
/// referents, and this loop keeps re-draining until a complete pass finds
/// nothing left gray anywhere, absorbing whatever the barrier added along
/// the way. See the module doc comment for why no further pass is needed
/// once this returns.
fn drain_to_fixpoint(ctx: &CollectorContext<'_>) {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(CollectorPhase::GrayDrain);
    #[cfg(feature = "tracing")]
    log_phase_start(CollectorPhase::GrayDrain);

    drain_gray_worklist(ctx.partition, ctx.groups, ctx.big, ctx.config, ctx.epoch);

    #[cfg(feature = "tracing")]
    log_phase_end(CollectorPhase::GrayDrain, 0);
}

/// Sweep every size group and the big-object table, returning every
/// remaining white object's memory to the free list (groups) or straight
/// back to the partition (big objects). Returns the total object count
/// recycled.
fn sweep_all(ctx: &CollectorContext<'_>) -> usize {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(CollectorPhase::Sweep);
    #[cfg(feature = "tracing")]
    log_phase_start(CollectorPhase::Sweep);

    let mut recycled = 0;
    for group in ctx.groups.iter() {
        recycled += group.sweep(ctx.partition, ctx.epoch);
    }
    recycled += ctx.big.sweep(ctx.partition);

    #[cfg(feature = "tracing")]
    log_phase_end(CollectorPhase::Sweep, recycled);
    recycled
}

/// Return every size-group page whose `bytes_used` has dropped to zero (every
/// object that ever lived there is green) back to the Page/Segment Layer,
/// then merge the result with whatever was already on the empty-pages list.
///
/// Multi-page objects release their pages directly from `SizeGroup::sweep`
/// (see its doc comment) and never reach this path; this only reclaims
/// single-page group runs, each of which is its own `base_page`. A page is
/// skipped unless `base_page() == page_index`, so an interior page of some
/// other still-live run is never mistaken for a reclaimable one.
fn reclaim_empty_group_pages(ctx: &CollectorContext<'_>) -> usize {
    let page_size = ctx.partition.page_size();
    let mut reclaimed = 0usize;
    for page_index in 0..ctx.partition.page_count() {
        let info = ctx.partition.page_info(page_index);
        let PageOwner::Group(group_index) = info.owner() else {
            continue;
        };
        if info.base_page() != page_index || info.bytes_used() != 0 {
            continue;
        }
        if let Some(group) = ctx.groups.group_at(group_index) {
            let page_base = ctx.partition.page_ptr(page_index) as usize;
            group.evict_page(page_base, page_size);
            ctx.partition.release_pages(page_index, 1);
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Coalesce freed pages: return every fully-emptied size-group page to the
/// Page/Segment Layer, then rebuild the empty-pages hole list, merging any
/// physically adjacent empty pages into a single hole. Returns the number
/// of empty pages on the list afterward.
fn coalesce_all(ctx: &CollectorContext<'_>) -> usize {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(CollectorPhase::Coalesce);
    #[cfg(feature = "tracing")]
    log_phase_start(CollectorPhase::Coalesce);

    reclaim_empty_group_pages(ctx);
    ctx.partition.merge_adjacent_holes();
    let total_empty = ctx.partition.empty_page_count();

    #[cfg(feature = "tracing")]
    log_phase_end(CollectorPhase::Coalesce, total_empty);
    total_empty
}

/// Run one full collection cycle: stop the world, flip, scan roots (still
/// stopped), resume, drain to fixpoint concurrently, sweep, coalesce.
///
/// The write barrier itself is not toggled here: it is expected to be
/// permanently enabled by the embedder's write sites calling
/// `write_vector::write_barrier` unconditionally. An always-on barrier
/// graying objects between cycles as well as during one is harmless, since
/// `try_make_gray` is a no-op on anything that is not currently white —
/// simpler and strictly safe compared to toggling the barrier per cycle.
pub fn run_cycle(ctx: &CollectorContext<'_>) -> GcResult<CycleStats> {
    let start = Instant::now();

    let snapshots = ctx.mutators.stop_the_world()?;

    let flip_result = flip(ctx).and_then(|()| scan_roots(ctx, &snapshots).map(|_| ()));
    ctx.mutators.resume_all();
    flip_result?;

    drain_to_fixpoint(ctx);
    let objects_recycled = sweep_all(ctx);
    let pages_coalesced = coalesce_all(ctx);

    Ok(CycleStats {
        objects_recycled,
        pages_coalesced,
        duration: start.elapsed(),
    })
}

/// Sweep-and-coalesce only, with no flip: useful when fragmentation alone
/// (not expected new garbage) motivates a pass, matching
/// [`crate::metrics::CollectionType::SweepOnly`].
pub fn run_sweep_only(ctx: &CollectorContext<'_>) -> CycleStats {
    let start = Instant::now();
    let objects_recycled = sweep_all(ctx);
    let pages_coalesced = coalesce_all(ctx);
    CycleStats {
        objects_recycled,
        pages_coalesced,
        duration: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Color, ObjectHeader, StorageClass};

    fn setup() -> (Partition, GroupTable, BigObjectTable, HeapConfig, ColorEpoch, WriteVector, GlobalRoots, MutatorThreads) {
        let config = HeapConfig {
            default_heap_bytes: 256 * 4096,
            ..HeapConfig::default()
        };
        let partition = Partition::new(&config).unwrap();
        let groups = GroupTable::new(config.min_group_index, config.max_group_index);
        let big = BigObjectTable::new();
        let epoch = ColorEpoch::new();
        let write_vector = WriteVector::new(&partition);
        let roots = GlobalRoots::new(&config);
        let mutators = MutatorThreads::new();
        (partition, groups, big, config, epoch, write_vector, roots, mutators)
    }

    #[test]
    fn unreferenced_object_is_recycled_after_one_cycle() {
        let (partition, groups, big, config, epoch, write_vector, roots, mutators) = setup();
        let group = groups.group_at(4).unwrap();
        let _ptr = group.allocate(&partition, &epoch, StorageClass::NoPointers).unwrap();
        let ctx = CollectorContext {
            partition: &partition,
            groups: &groups,
            big: &big,
            config: &config,
            epoch: &epoch,
            write_vector: &write_vector,
            roots: &roots,
            mutators: &mutators,
        };
        let stats = run_cycle(&ctx).unwrap();
        assert_eq!(stats.objects_recycled, 1);
        assert_eq!(group.total_object_count(), group.green_count());
    }

    #[test]
    fn object_referenced_only_from_a_registered_global_survives() {
        let (partition, groups, big, config, epoch, write_vector, roots, mutators) = setup();
        let group = groups.group_at(4).unwrap();
        let ptr = group.allocate(&partition, &epoch, StorageClass::NoPointers).unwrap();

        let mut storage: usize = ptr.as_ptr() as usize;
        let slot_addr = std::ptr::addr_of_mut!(storage) as usize;
        roots.register(slot_addr, std::mem::size_of::<usize>()).unwrap();

        let ctx = CollectorContext {
            partition: &partition,
            groups: &groups,
            big: &big,
            config: &config,
            epoch: &epoch,
            write_vector: &write_vector,
            roots: &roots,
            mutators: &mutators,
        };
        let stats = run_cycle(&ctx).unwrap();
        assert_eq!(stats.objects_recycled, 0);
        let header = ObjectHeader::from_payload(ptr);
        assert_eq!(unsafe { header.as_ref() }.color(&epoch), Color::Black);
        roots.unregister(slot_addr);
    }

    #[test]
    fn two_consecutive_cycles_are_stable_with_no_allocation() {
        let (partition, groups, big, config, epoch, write_vector, roots, mutators) = setup();
        let ctx = CollectorContext {
            partition: &partition,
            groups: &groups,
            big: &big,
            config: &config,
            epoch: &epoch,
            write_vector: &write_vector,
            roots: &roots,
            mutators: &mutators,
        };
        let first = run_cycle(&ctx).unwrap();
        let second = run_cycle(&ctx).unwrap();
        assert_eq!(first.objects_recycled, 0);
        assert_eq!(second.objects_recycled, 0);
    }
}
