//! The size-group allocator: one [`SizeGroup`] per power-of-two size class
//! from `min_group_index` to `max_group_index`, each threading its own
//! free/black/gray/white intrusive lists through [`ObjectHeader`]s.
//!
//! Objects whose size exceeds one page are still owned by a group (up to
//! `max_group_index`, 4 MiB) — the group simply carves a multi-page run and
//! populates it with exactly one object instead of many. Objects larger than
//! `max_group_index` bytes are not handled here; see `heap::RealtimeHeap::big_allocate`.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::{GcError, GcResult};
use crate::header::{Color, ColorEpoch, Link, ObjectHeader, StorageClass};
use crate::partition::{PageOwner, Partition};

type Node = Option<NonNull<ObjectHeader>>;

struct FreeState {
    head: Node,
    green_count: usize,
    total_object_count: usize,
}

struct MarkState {
    gray: Node,
    black: Node,
    white: Node,
    white_count: usize,
    black_count: usize,
}

/// One size class of the segregated heap.
pub struct SizeGroup {
    /// Index into the group table (`min_group_index..=max_group_index`).
    pub index: usize,
    /// `2^index` bytes: the full object size, header included.
    pub object_size: usize,
    free: Mutex<FreeState>,
    free_last: Mutex<Node>,
    mark: Mutex<MarkState>,
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

impl SizeGroup {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            object_size: 1usize << index,
            free: Mutex::new(FreeState {
                head: None,
                green_count: 0,
                total_object_count: 0,
            }),
            free_last: Mutex::new(None),
            mark: Mutex::new(MarkState {
                gray: None,
                black: None,
                white: None,
                white_count: 0,
                black_count: 0,
            }),
        }
    }

    fn free_push_back(&self, node: NonNull<ObjectHeader>) {
        let mut free = self.free.lock();
        let mut tail = self.free_last.lock();
        // SAFETY: `node` is freshly carved, not linked into any list.
        unsafe {
            node.as_ref().set_link(Link::Prev, *tail);
            node.as_ref().set_link(Link::Next, None);
        }
        match *tail {
            Some(t) => unsafe { t.as_ref().set_link(Link::Next, Some(node)) },
            None => free.head = Some(node),
        }
        *tail = Some(node);
        free.green_count += 1;
    }

    fn free_pop_front(&self) -> Node {
        let mut free = self.free.lock();
        let mut tail = self.free_last.lock();
        let node = free.head?;
        // SAFETY: `node` is the current free-list head.
        let next = unsafe { node.as_ref().link(Link::Next) };
        free.head = next;
        match next {
            Some(n) => unsafe { n.as_ref().set_link(Link::Prev, None) },
            None => *tail = None,
        }
        free.green_count -= 1;
        Some(node)
    }

    /// How many pages (and objects per page, for small groups) a fresh run
    /// for this group should carve.
    fn run_shape(&self, page_size: usize) -> (usize, usize) {
        if self.object_size <= page_size {
            (1, page_size / self.object_size)
        } else {
            (self.object_size.div_ceil(page_size), 1)
        }
    }

    /// Carve a fresh run of pages for this group from the partition and
    /// populate the free list with the green objects it yields.
    fn init_pages_for_group(&self, partition: &Partition, epoch: &ColorEpoch) -> GcResult<()> {
        let (pages_needed, objects_per_run) = self.run_shape(partition.page_size());
        let first = partition.take_pages(pages_needed)?;
        partition.assign_pages(first, pages_needed, PageOwner::Group(self.index));
        let base = partition.page_ptr(first);
        for k in 0..objects_per_run {
            // SAFETY: `base + k * object_size` is freshly reserved, unshared
            // memory, at least HEADER_SIZE bytes, 16-byte aligned.
            let header = unsafe {
                let addr = base.add(k * self.object_size);
                let ptr = NonNull::new(addr.cast()).expect("mmap never returns null");
                ObjectHeader::init(ptr, StorageClass::NoPointers, Color::Green, epoch)
            };
            self.free_push_back(header);
        }
        self.free.lock().total_object_count += objects_per_run;
        Ok(())
    }

    /// Pop a green object, color it black for `class`, and return its
    /// payload pointer. Replenishes the free list via `init_pages_for_group`
    /// when empty (the "allocate black" rule: every freshly allocated
    /// object starts reachable-and-scanned, never white, so a concurrent
    /// collector cycle never mistakes it for garbage).
    pub fn allocate(
        &self,
        partition: &Partition,
        epoch: &ColorEpoch,
        class: StorageClass,
    ) -> GcResult<NonNull<u8>> {
        loop {
            if let Some(node) = self.free_pop_front() {
                // SAFETY: `node` was just unlinked from the free list; this
                // thread has exclusive access until it is linked onto black.
                let header = unsafe { node.as_ref() };
                header.set_storage_class(class);
                header.set_color(Color::Black, epoch);
                let page_index = partition.page_index(node.as_ptr() as usize);
                partition.page_info(page_index).add_bytes_used(self.object_size);
                let mut mark = self.mark.lock();
                push_front(&mut mark.black, node);
                mark.black_count += 1;
                return Ok(ObjectHeader::payload(node));
            }
            self.init_pages_for_group(partition, epoch)?;
        }
    }

    /// If `node` is currently white, unlink it from the white list, color it
    /// gray, and link it onto the gray worklist. Returns `true` if this call
    /// performed the white-to-gray transition (the caller should then treat
    /// `node` as newly discovered and eventually scan it).
    pub fn try_make_gray(&self, node: NonNull<ObjectHeader>, epoch: &ColorEpoch) -> bool {
        // SAFETY: `node` is a resolved, live object header in this group.
        let header = unsafe { node.as_ref() };
        if header.color(epoch) != Color::White {
            return false;
        }
        let mut mark = self.mark.lock();
        // Re-check under the lock: another thread's write barrier or root
        // scan may have grayed it first.
        if header.color(epoch) != Color::White {
            return false;
        }
        unlink(&mut mark.white, node);
        mark.white_count -= 1;
        header.set_color(Color::Gray, epoch);
        push_front(&mut mark.gray, node);
        true
    }

    /// Pop one object off the gray worklist, if any, leaving it gray (the
    /// caller scans its payload and then calls [`Self::blacken`]).
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

    /// Color a scanned gray object black and link it onto the black list.
    pub fn blacken(&self, node: NonNull<ObjectHeader>, epoch: &ColorEpoch) {
        // SAFETY: `node` was just popped from the gray list by this thread.
        unsafe { node.as_ref().set_color(Color::Black, epoch) };
        let mut mark = self.mark.lock();
        push_front(&mut mark.black, node);
        mark.black_count += 1;
    }

    /// Flip: the group's current black list becomes the new white list
    /// (via the color-epoch swap elsewhere; here we just move the list
    /// pointer), and black starts the new cycle empty. Caller must hold
    /// whatever serializes this against concurrent allocation (the
    /// free lock, held while the world is stopped).
    pub fn flip(&self) -> GcResult<()> {
        let mut mark = self.mark.lock();
        if mark.gray.is_some() {
            return Err(GcError::InvariantViolation(
                "flip called with a non-empty gray worklist",
            ));
        }
        mark.white = mark.black.take();
        mark.white_count = mark.black_count;
        mark.black_count = 0;
        Ok(())
    }

    /// Sweep: return every remaining white object's memory, leaving white
    /// empty. Returns the number of objects recycled.
    ///
    /// Sub-page objects rejoin this group's free list as green, the usual
    /// case (`Partition::release_pages` only reclaims a page once its
    /// `bytes_used` drops to zero and the coalesce phase notices, per
    /// `collector::coalesce_all`). A multi-page object is the only occupant
    /// of the pages it spans, so there is nothing to wait for: its pages go
    /// straight back to the Page/Segment Layer here, the same way
    /// `BigObjectTable::sweep` returns a big object's pages, and it is
    /// dropped from `total_object_count` rather than re-entering the free
    /// list (a future request for this group's size is no more likely to
    /// want exactly this many pages than any other request is).
    pub fn sweep(&self, partition: &Partition, epoch: &ColorEpoch) -> usize {
        let page_size = partition.page_size();
        let multi_page = self.object_size > page_size;
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
            let page_index = partition.page_index(addr);
            partition.page_info(page_index).sub_bytes_used(self.object_size);
            if multi_page {
                // SAFETY: `node` was just unlinked; no one else can reach it.
                unsafe { node.as_ref().set_color(Color::Green, epoch) };
                let pages_needed = self.object_size.div_ceil(page_size);
                partition.release_pages(page_index, pages_needed);
                self.free.lock().total_object_count -= 1;
            } else {
                // SAFETY: `node` was just unlinked; no one else can reach it.
                unsafe { node.as_ref().set_color(Color::Green, epoch) };
                self.free_push_back(node);
            }
            recycled += 1;
        }
        recycled
    }

    /// Remove every free (green) object whose header falls within
    /// `[page_base, page_base + page_size)` from this group's free list.
    /// Called by the coalesce phase immediately before a fully-emptied
    /// page is handed back to the Page/Segment Layer: a green object
    /// living on that page must not still be linked into this group's free
    /// list once the page becomes a hole. Returns the number removed.
    pub fn evict_page(&self, page_base: usize, page_size: usize) -> usize {
        let mut free = self.free.lock();
        let mut tail = self.free_last.lock();
        let page_end = page_base + page_size;
        let mut removed = 0usize;
        let mut cur = free.head;
        while let Some(node) = cur {
            // SAFETY: `node` is a currently linked free-list entry, walked
            // under `free_lock`/`free_last_lock`.
            let next = unsafe { node.as_ref().link(Link::Next) };
            let addr = node.as_ptr() as usize;
            if addr >= page_base && addr < page_end {
                let prev = unsafe { node.as_ref().link(Link::Prev) };
                match prev {
                    Some(p) => unsafe { p.as_ref().set_link(Link::Next, next) },
                    None => free.head = next,
                }
                match next {
                    Some(n) => unsafe { n.as_ref().set_link(Link::Prev, prev) },
                    None => *tail = prev,
                }
                removed += 1;
            }
            cur = next;
        }
        free.green_count -= removed;
        free.total_object_count -= removed;
        removed
    }

    #[must_use]
    pub fn green_count(&self) -> usize {
        self.free.lock().green_count
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
        self.free.lock().total_object_count
    }

    /// Walk the white list once and invoke `f` for each header; used by
    /// `RealtimeHeap::verify_invariants` to cross-check `white_count`.
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

// SAFETY: all interior mutability is behind `parking_lot::Mutex`.
unsafe impl Send for SizeGroup {}
unsafe impl Sync for SizeGroup {}

/// The full table of size groups, indexed `min_group_index..=max_group_index`.
pub struct GroupTable {
    min_index: u32,
    groups: Vec<SizeGroup>,
}

impl GroupTable {
    #[must_use]
    pub fn new(min_index: u32, max_index: u32) -> Self {
        let groups = (min_index..=max_index).map(|i| SizeGroup::new(i as usize)).collect();
        Self { min_index, groups }
    }

    /// The group that should serve a request of `size` bytes (header
    /// included), rounding up to the next power of two. `None` if `size`
    /// exceeds the largest managed group.
    #[must_use]
    pub fn group_for_size(&self, size: usize) -> Option<&SizeGroup> {
        let index = size.next_power_of_two().trailing_zeros().max(self.min_index);
        self.group_at(index as usize)
    }

    #[must_use]
    pub fn group_at(&self, index: usize) -> Option<&SizeGroup> {
        if (index as u32) < self.min_index {
            return None;
        }
        self.groups.get(index - self.min_index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SizeGroup> {
        self.groups.iter()
    }
}
