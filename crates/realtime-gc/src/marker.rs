//! The marker: conservative root scanning, interior-pointer resolution, and
//! the gray-worklist drain loop.
//!
//! Scanning is conservative — a "pointer" is any machine word that happens to
//! fall inside the managed partition and resolve to a live object's header.
//! There is no type information to say whether a given stack slot or
//! register actually holds a pointer, so false positives (an integer that
//! happens to look like an address) are possible and harmless: they retain
//! an object one cycle too many, never the reverse.

use std::ptr::NonNull;

use crate::big::BigObjectTable;
use crate::config::HeapConfig;
use crate::group::GroupTable;
use crate::header::{ColorEpoch, ObjectHeader, HEADER_SIZE};
use crate::partition::{PageOwner, Partition};

/// Resolve a conservative candidate pointer to the object header it falls
/// inside, if any.
///
/// Applies the interior-pointer retention limit: a pointer into the middle
/// of an object larger than `config.interior_ptr_retention_limit` is only
/// honored if it is the exact header address. Without this guard, a single
/// stray word anywhere inside a multi-megabyte object would retain it, and
/// large objects are exactly the ones most likely to have some word of
/// their own payload misread as pointing at themselves. Big objects (see
/// `crate::big`) are always above this limit by construction — they are by
/// definition bigger than the largest size group — so they are retained
/// only by their exact header address.
#[must_use]
pub fn interior_to_gcptr(
    partition: &Partition,
    groups: &GroupTable,
    config: &HeapConfig,
    addr: usize,
) -> Option<NonNull<ObjectHeader>> {
    if !partition.contains(addr) {
        return None;
    }
    let page_index = partition.page_index(addr);
    let page = partition.page_info(page_index);
    let base_page = page.base_page();
    let base_addr = partition.page_ptr(base_page) as usize;
    if addr < base_addr {
        return None;
    }
    match page.owner() {
        PageOwner::Group(group_index) => {
            let group = groups.group_at(group_index)?;
            let offset = addr - base_addr;
            let header_addr = if group.object_size > config.interior_ptr_retention_limit {
                if offset != 0 {
                    return None;
                }
                base_addr
            } else {
                let slot = offset / group.object_size;
                base_addr + slot * group.object_size
            };
            NonNull::new(header_addr as *mut ObjectHeader)
        }
        PageOwner::Big => {
            if addr != base_addr {
                return None;
            }
            NonNull::new(base_addr as *mut ObjectHeader)
        }
        _ => None,
    }
}

/// Try to retain the object `addr` conservatively points into: if it
/// resolves to a currently-white object, gray it and return the header so
/// the caller can push it onto whatever worklist drains gray objects.
pub fn make_object_gray(
    partition: &Partition,
    groups: &GroupTable,
    big: &BigObjectTable,
    config: &HeapConfig,
    epoch: &ColorEpoch,
    addr: usize,
) -> Option<NonNull<ObjectHeader>> {
    let node = interior_to_gcptr(partition, groups, config, addr)?;
    let page_index = partition.page_index(addr);
    match partition.page_info(page_index).owner() {
        PageOwner::Group(group_index) => {
            let group = groups.group_at(group_index)?;
            group.try_make_gray(node, epoch).then_some(node)
        }
        PageOwner::Big => big.try_make_gray(node, epoch).then_some(node),
        _ => None,
    }
}

/// Conservatively scan `[start, start + len)` (a stack range, register file,
/// or object payload) for candidate pointers, graying whatever they resolve
/// to. Every newly grayed object's address is handed to `on_gray` so the
/// caller can push it onto the gray worklist that drains to a fixpoint.
///
/// # Safety
///
/// `[start, start + len)` must be readable for the duration of the call.
#[allow(clippy::too_many_arguments)]
pub unsafe fn scan_memory_segment(
    partition: &Partition,
    groups: &GroupTable,
    big: &BigObjectTable,
    config: &HeapConfig,
    epoch: &ColorEpoch,
    start: *const u8,
    len: usize,
    mut on_gray: impl FnMut(NonNull<ObjectHeader>),
) {
    let word_size = std::mem::size_of::<usize>();
    let words = len / word_size;
    // SAFETY: caller guarantees the range is readable; we only ever read,
    // never assume alignment beyond `usize`'s natural alignment, and
    // `read_unaligned` tolerates conservative scanning over arbitrary stack
    // offsets.
    unsafe {
        let base = start.cast::<u8>();
        for i in 0..words {
            let candidate = base.add(i * word_size).cast::<usize>().read_unaligned();
            if let Some(node) = make_object_gray(partition, groups, big, config, epoch, candidate) {
                on_gray(node);
            }
        }
    }
}

/// Scan one object's payload for pointers, per its [`crate::header::StorageClass`].
/// `NoPointers` objects are skipped entirely. `Pointers`, `Metadata`, and
/// `Instance` are all scanned conservatively today; precise metadata-guided
/// scanning is a possible later, non-breaking refinement.
///
/// # Safety
///
/// `node`'s payload must be `payload_len` live, readable bytes.
#[allow(clippy::too_many_arguments)]
pub unsafe fn scan_object(
    partition: &Partition,
    groups: &GroupTable,
    big: &BigObjectTable,
    config: &HeapConfig,
    epoch: &ColorEpoch,
    node: NonNull<ObjectHeader>,
    payload_len: usize,
    on_gray: impl FnMut(NonNull<ObjectHeader>),
) {
    // SAFETY: `node` is a live header.
    let class = unsafe { node.as_ref() }.storage_class();
    if class == crate::header::StorageClass::NoPointers {
        return;
    }
    let payload = ObjectHeader::payload(node);
    // SAFETY: caller guarantees `payload_len` bytes of payload are readable.
    unsafe {
        scan_memory_segment(partition, groups, big, config, epoch, payload.as_ptr(), payload_len, on_gray);
    }
}

/// Drain the gray worklist across every size group and the big-object table
/// to a fixpoint: pop a gray object, scan its payload (which may gray more
/// objects, in any group or in the big table), color it black, repeat until
/// a complete pass finds nothing left gray anywhere.
///
/// Safe to call while mutators run concurrently: the write barrier
/// (`crate::write_vector::write_barrier`) grays a white referent the instant
/// it is overwritten rather than recording it for a separate later drain, so
/// this loop re-draining until dry is also what absorbs those barrier-driven
/// grays — see `crate::collector`'s module docs for why this is safe to
/// disable the write barrier after, rather than needing one more pass.
pub fn drain_gray_worklist(
    partition: &Partition,
    groups: &GroupTable,
    big: &BigObjectTable,
    config: &HeapConfig,
    epoch: &ColorEpoch,
) {
    loop {
        let mut made_progress = false;
        for group in groups.iter() {
            while let Some(node) = group.pop_gray() {
                made_progress = true;
                let payload_len = group.object_size - HEADER_SIZE;
                // SAFETY: `node` belongs to `group`, so its payload is
                // exactly `payload_len` bytes, live for the duration of a
                // stop-the-world-adjacent marking phase.
                unsafe {
                    scan_object(partition, groups, big, config, epoch, node, payload_len, |_| {});
                }
                group.blacken(node, epoch);
            }
        }
        while let Some(node) = big.pop_gray() {
            made_progress = true;
            // SAFETY: `node` was just popped from the big-object gray list.
            let payload_len = unsafe { BigObjectTable::payload_len(node) };
            // SAFETY: `node` belongs to `big`, payload is `payload_len` bytes.
            unsafe {
                scan_object(partition, groups, big, config, epoch, node, payload_len, |_| {});
            }
            big.blacken(node, epoch);
        }
        if !made_progress {
            break;
        }
    }
}
