//! Big objects: allocations whose requested size exceeds the largest size
//! group's fixed object size (`max_group_size`, 4 MiB by default).
//!
//! A size group's lists assume every object linked onto them is the group's
//! fixed `2^index` size (`SizeGroup::object_size`), so a bigger request
//! cannot simply join `max_group_index`'s lists even though it still comes
//! from the same `Partition::take_pages` path a multi-page group object
//! does. Instead it gets its own black/gray/white lists here, one entry per
//! allocation, each covering a different number of pages — the Page/Segment
//! Layer's `take_pages`/`release_pages` contract is identical either way.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::GcResult;
use crate::header::{Color, ColorEpoch, Link, ObjectHeader, StorageClass};
use crate::partition::{PageOwner, Partition};

type Node = Option<NonNull<ObjectHeader>>;

/// A big object's header: the ordinary tagged link pair, plus an explicit
/// payload-size word. Size-group objects never need this — their size is
/// implied by which group's lists they are on — but a big object has no
/// such group to imply it from, so the payload-size field is carried
/// explicitly only for this case.
#[repr(C)]
struct BigHeader {
    header: ObjectHeader,
    payload_bytes: AtomicUsize,
}

/// Header overhead for a big object: the ordinary header plus its size word.
pub const BIG_HEADER_SIZE: usize = std::mem::size_of::<BigHeader>();

struct MarkState {
    gray: Node,
    black: Node,
    white: Node,
    white_count: usize,
    black_count: usize,
}

fn unlink(head: &mut Node, node: NonNull<ObjectHeader>) {
    // SAFETY: `node` is currently linked into the list `head` points into.
    let (prev, next) = unsafe { (node.as_ref().link(Link::Prev), node.as_ref().link(Link::Next)) };
    match prev {
        Some(p) => unsafe { p.as_ref().set_link(Link::Next, next) },
        None => *head = next,
    }
    if let Some(n) = next {
        unsafe { n.as_ref().set_link(Link::Prev, prev) };
    }
}

fn push_front(head: &mut Node, node: NonNull<ObjectHeader>) {
    // SAFETY: `node` is not currently linked into any list.
    unsafe {
        node.as_ref().set_link(Link::Prev, None);
        node.as_ref().set_link(Link::Next, *head);
    }
    if let Some(h) = *head {
        unsafe { h.as_ref().set_link(Link::Prev, Some(node)) };
    }
    *head = Some(node);
}

/// The big-object registry: one instance per heap, parallel to `GroupTable`
/// but holding objects whose size exceeds `max_group_size`. There is no free
/// list — a swept big object's pages go straight back to the Page/Segment
/// Layer via `Partition::release_pages` rather than re-entering any reuse
/// pool, since a future request is unlikely to want exactly this many pages.
pub struct BigObjectTable {
    mark: Mutex<MarkState>,
    total_object_count: AtomicUsize,
}

impl BigObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mark: Mutex::new(MarkState {
                gray: None,
                black: None,
                white: None,
                white_count: 0,
                black_count: 0,
            }),
            total_object_count: AtomicUsize::new(0),
        }
    }

    /// Payload length in bytes of the big object at `header`.
    ///
    /// # Safety
    ///
    /// `header` must be a live big-object header (i.e. resolved via a page
    /// tagged `PageOwner::Big`).
    #[must_use]
    pub unsafe fn payload_len(header: NonNull<ObjectHeader>) -> usize {
        let big = header.cast::<BigHeader>();
        // SAFETY: caller's contract.
        unsafe { big.as_ref().payload_bytes.load(Ordering::Relaxed) }
    }

    /// The payload pointer (the address handed to mutators) for a big object.
    #[must_use]
    pub fn payload(header: NonNull<ObjectHeader>) -> NonNull<u8> {
        // SAFETY: header + BIG_HEADER_SIZE is always within the same allocation.
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(BIG_HEADER_SIZE)) }
    }

    /// Recover a big object's header from its payload pointer.
    #[must_use]
    pub fn from_payload(payload: NonNull<u8>) -> NonNull<ObjectHeader> {
        // SAFETY: payload is always BIG_HEADER_SIZE bytes past the object base.
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(BIG_HEADER_SIZE).cast()) }
    }

    /// Allocate a big object of `requested_bytes` payload, carving
    /// `ceil((BIG_HEADER_SIZE + requested_bytes) / page_size)` fresh pages
    /// straight from the partition. Allocate-black, exactly like a size
    /// group: the object is linked onto `black` before this call returns, so
    /// it is never mistaken for this cycle's garbage.
    pub fn allocate(
        &self,
        partition: &Partition,
        epoch: &ColorEpoch,
        class: StorageClass,
        requested_bytes: usize,
    ) -> GcResult<NonNull<u8>> {
        let page_size = partition.page_size();
        let total = BIG_HEADER_SIZE + requested_bytes;
        let pages_needed = total.div_ceil(page_size);
        let first = partition.take_pages(pages_needed)?;
        partition.assign_pages(first, pages_needed, PageOwner::Big);
        let base = partition.page_ptr(first);
        let payload_bytes = pages_needed * page_size - BIG_HEADER_SIZE;
        // SAFETY: `base` is freshly reserved, unshared memory spanning at
        // least `pages_needed` whole pages, more than enough for a `BigHeader`.
        let header = unsafe {
            let ptr = NonNull::new(base.cast::<ObjectHeader>()).expect("mmap never returns null");
            let header = ObjectHeader::init(ptr, class, Color::Black, epoch);
            header
                .cast::<BigHeader>()
                .as_ref()
                .payload_bytes
                .store(payload_bytes, Ordering::Relaxed);
            header
        };
        let mut mark = self.mark.lock();
        push_front(&mut mark.black, header);
        mark.black_count += 1;
        self.total_object_count.fetch_add(1, Ordering::Relaxed);
        Ok(Self::payload(header))
    }

    /// If `node` is currently white, gray it. Mirrors `SizeGroup::try_make_gray`.
    pub fn try_make_gray(&self, node: NonNull<ObjectHeader>, epoch: &ColorEpoch) -> bool {
        // SAFETY: `node` is a resolved, live big-object header.
        let header = unsafe { node.as_ref() };
        if header.color(epoch) != Color::White {
            return false;
        }
        let mut mark = self.mark.lock();
        if header.color(epoch) != Color::White {
            return false;
        }
        unlink(&mut mark.white, node);
        mark.white_count -= 1;
        header.set_color(Color::Gray, epoch);
        push_front(&mut mark.gray, node);
        true
    }

    /// Pop one object off the gray worklist, if any.
    pub fn pop_gray(&self) -> Node {
        let mut mark = self.mark.lock();
        let node = mark.gray?;
        // SAFETY: `node` is the current gray-list head.
        let next = unsafe { node.as_ref().link(Link::Next) };
        mark.gray = next;
        if let Some(n) = next {
            unsafe { n.as_ref().set_link(Link::Prev, None) };
        }
        Some(node)
    }

    /// Color a scanned gray object black.
    pub fn blacken(&self, node: NonNull<ObjectHeader>, epoch: &ColorEpoch) {
        // SAFETY: `node` was just popped from the gray list by this thread.
        unsafe { node.as_ref().set_color(Color::Black, epoch) };
        let mut mark = self.mark.lock();
        push_front(&mut mark.black, node);
        mark.black_count += 1;
    }

    /// Flip: this cycle's black becomes next cycle's white. Errors if the
    /// gray worklist is non-empty (the same invariant `SizeGroup::flip` checks).
    pub fn flip(&self) -> GcResult<()> {
        let mut mark = self.mark.lock();
        if mark.gray.is_some() {
            return Err(crate::error::GcError::InvariantViolation(
                "big-object flip called with a non-empty gray worklist",
            ));
        }
        mark.white = mark.black.take();
        mark.white_count = mark.black_count;
        mark.black_count = 0;
        Ok(())
    }

    /// Sweep: release every remaining white big object's pages straight back
    /// to the partition. Returns the number of objects recycled.
    pub fn sweep(&self, partition: &Partition) -> usize {
        let mut recycled = 0;
        loop {
            let node = {
                let mut mark = self.mark.lock();
                let node = match mark.white {
                    Some(n) => n,
                    None => break,
                };
                // SAFETY: `node` is the current white-list head.
                let next = unsafe { node.as_ref().link(Link::Next) };
                mark.white = next;
                if let Some(n) = next {
                    unsafe { n.as_ref().set_link(Link::Prev, None) };
                }
                mark.white_count -= 1;
                node
            };
            let addr = node.as_ptr() as usize;
            let page_size = partition.page_size();
            let first = partition.page_index(addr);
            // SAFETY: `node` was just unlinked; no one else can reach it, so
            // reading its size word is exclusive to this thread.
            let payload_bytes = unsafe { Self::payload_len(node) };
            let npages = (BIG_HEADER_SIZE + payload_bytes).div_ceil(page_size);
            partition.release_pages(first, npages);
            self.total_object_count.fetch_sub(1, Ordering::Relaxed);
            recycled += 1;
        }
        recycled
    }

    #[must_use]
    pub fn white_count(&self) -> usize {
        self.mark.lock().white_count
    }

    #[must_use]
    pub fn black_count(&self) -> usize {
        self.mark.lock().black_count
    }

    #[must_use]
    pub fn total_object_count(&self) -> usize {
        self.total_object_count.load(Ordering::Relaxed)
    }

    /// Walk the white list once and invoke `f` for each header; used by
    /// `RealtimeHeap::verify_invariants`.
    pub fn for_each_white(&self, mut f: impl FnMut(NonNull<ObjectHeader>)) {
        let mark = self.mark.lock();
        let mut cur = mark.white;
        while let Some(node) = cur {
            f(node);
            // SAFETY: `node` is a live white-list entry, list held locked.
            cur = unsafe { node.as_ref().link(Link::Next) };
        }
    }
}

impl Default for BigObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all interior mutability is behind `parking_lot::Mutex` / atomics.
unsafe impl Send for BigObjectTable {}
unsafe impl Sync for BigObjectTable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn small_partition() -> Partition {
        Partition::new(&HeapConfig {
            default_heap_bytes: 256 * 4096,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn allocate_spans_requested_pages() {
        let partition = small_partition();
        let epoch = ColorEpoch::new();
        let big = BigObjectTable::new();
        let ptr = big
            .allocate(&partition, &epoch, StorageClass::Pointers, 5 * 4096)
            .unwrap();
        let header = BigObjectTable::from_payload(ptr);
        assert_eq!(unsafe { header.as_ref() }.color(&epoch), Color::Black);
        assert_eq!(big.black_count(), 1);
        let base_addr = header.as_ptr() as usize;
        assert_eq!(partition.page_index(base_addr), partition.base_page_index(base_addr));
    }

    #[test]
    fn flip_then_sweep_returns_pages() {
        let partition = small_partition();
        let epoch = ColorEpoch::new();
        let big = BigObjectTable::new();
        let before_empty = partition.empty_page_count();
        let requested = 3 * 4096;
        let expected_pages = (BIG_HEADER_SIZE + requested).div_ceil(4096);
        let _ptr = big
            .allocate(&partition, &epoch, StorageClass::NoPointers, requested)
            .unwrap();
        assert_eq!(partition.empty_page_count(), before_empty - expected_pages);
        big.flip().unwrap();
        epoch.flip();
        assert_eq!(big.white_count(), 1);
        let recycled = big.sweep(&partition);
        assert_eq!(recycled, 1);
        assert_eq!(partition.empty_page_count(), before_empty);
    }
}
