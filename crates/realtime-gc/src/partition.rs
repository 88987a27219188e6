//! The page/segment layer: a single contiguous `[base, base + page_count *
//! page_size)` region reserved up front from the OS, a parallel `page_info`
//! array describing who owns each page, and a singly-linked list of "holes"
//! (contiguous runs of empty pages) used to satisfy new page requests.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};

/// Sentinel `next`/`base_page` value meaning "none".
const NONE_PAGE: usize = usize::MAX;

/// Who owns a page.
///
/// Ordered so that sentinel kinds compare less than any real group: `Empty <
/// System < Static < External < Big < Group(_)`, expressed here as an enum
/// rather than raw pointer magnitude comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageOwner {
    /// On the empty-pages hole list.
    Empty,
    /// Reserved for collector bookkeeping (page_info array itself, etc).
    System,
    /// Part of the static space (globals, thread table).
    Static,
    /// Handed to an embedder outside the managed heap (unused by the
    /// in-process collector today; kept as an extension point).
    External,
    /// First page of a multi-page "big object" allocation, tracked outside
    /// any size group.
    Big,
    /// Owned by size group `index` (an index into `Groups`, not a raw
    /// `2^n` byte size).
    Group(usize),
}

impl PageOwner {
    const fn tag(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::System => 1,
            Self::Static => 2,
            Self::External => 3,
            Self::Big => 4,
            Self::Group(_) => 5,
        }
    }
}

/// Per-page bookkeeping. Reads are lock-free (conservative scanning and
/// interior-pointer resolution happen without taking any lock); compound
/// updates are serialized by whichever higher-level lock owns this page's
/// transition (`empty_pages_lock` for reclamation, a group's `free_lock` for
/// carving new pages into a group).
#[derive(Debug)]
pub struct PageInfo {
    tag: AtomicU8,
    group_index: AtomicUsize,
    /// Page index of the first page of the run this page belongs to; equal
    /// to this page's own index for a run's first page.
    base_page: AtomicUsize,
    /// Bytes of live payload on this page; informational, used by
    /// `GcMetrics` and `verify_invariants`.
    bytes_used: AtomicUsize,
}

impl PageInfo {
    fn empty(own_index: usize) -> Self {
        Self {
            tag: AtomicU8::new(PageOwner::Empty.tag()),
            group_index: AtomicUsize::new(NONE_PAGE),
            base_page: AtomicUsize::new(own_index),
            bytes_used: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn owner(&self) -> PageOwner {
        match self.tag.load(Ordering::Acquire) {
            0 => PageOwner::Empty,
            1 => PageOwner::System,
            2 => PageOwner::Static,
            3 => PageOwner::External,
            4 => PageOwner::Big,
            _ => PageOwner::Group(self.group_index.load(Ordering::Acquire)),
        }
    }

    fn set_owner(&self, owner: PageOwner) {
        if let PageOwner::Group(idx) = owner {
            self.group_index.store(idx, Ordering::Release);
        }
        self.tag.store(owner.tag(), Ordering::Release);
    }

    #[must_use]
    pub fn base_page(&self) -> usize {
        self.base_page.load(Ordering::Acquire)
    }

    fn set_base_page(&self, page: usize) {
        self.base_page.store(page, Ordering::Release);
    }

    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Relaxed)
    }

    pub fn set_bytes_used(&self, n: usize) {
        self.bytes_used.store(n, Ordering::Relaxed);
    }

    /// Account `delta` more live bytes on this page, e.g. when a size group
    /// allocates an object here.
    pub fn add_bytes_used(&self, delta: usize) {
        self.bytes_used.fetch_add(delta, Ordering::Relaxed);
    }

    /// Account `delta` fewer live bytes on this page, e.g. when sweep
    /// recycles an object here. Once a page's `bytes_used` reaches zero it
    /// becomes a candidate for `Partition::release_pages` during coalesce.
    pub fn sub_bytes_used(&self, delta: usize) {
        self.bytes_used.fetch_sub(delta, Ordering::Relaxed);
    }
}

/// Header written into the first bytes of every empty run, threading the
/// singly-linked hole list directly through the reclaimed memory rather than
/// through a side table.
#[repr(C)]
struct HoleHeader {
    page_count: usize,
    next: usize,
}

/// The empty-pages hole list. Protected by its own lock (`empty_pages_lock`)
/// — the last lock acquired in the global ordering.
struct EmptyPages {
    head: Mutex<usize>,
}

impl EmptyPages {
    fn new() -> Self {
        Self {
            head: Mutex::new(NONE_PAGE),
        }
    }
}

/// The managed heap partition: one contiguous mapping, carved into
/// fixed-size pages.
pub struct Partition {
    mmap: Mmap,
    base: usize,
    page_power: u32,
    page_size: usize,
    page_count: usize,
    pages: Box<[PageInfo]>,
    empty: EmptyPages,
}

impl Partition {
    /// Reserve a fresh partition of `config.default_heap_bytes`, all pages
    /// initially on the empty list as one big hole.
    pub fn new(config: &HeapConfig) -> GcResult<Self> {
        let page_size = config.page_size();
        let page_count = config.default_heap_bytes / page_size;
        if page_count == 0 {
            return Err(GcError::InvariantViolation(
                "default_heap_bytes smaller than one page",
            ));
        }
        // SAFETY: a fresh anonymous mapping with no hint address; ownership
        // of the returned region passes entirely to `Mmap`.
        let mmap = unsafe { MmapOptions::new().len(page_count * page_size).map_anon() }
            .map_err(|_| GcError::OutOfMemory {
                requested: page_count * page_size,
                group: None,
            })?;
        let base = mmap.ptr() as usize;
        let pages = (0..page_count).map(PageInfo::empty).collect::<Vec<_>>().into_boxed_slice();
        let partition = Self {
            mmap,
            base,
            page_power: config.page_power,
            page_size,
            page_count,
            pages,
            empty: EmptyPages::new(),
        };
        partition.write_hole_header(0, page_count, NONE_PAGE);
        *partition.empty.head.lock() = 0;
        Ok(partition)
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Whether `addr` falls within the managed partition.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.page_count * self.page_size
    }

    /// The page index containing `addr`. Caller must have checked `contains`.
    #[must_use]
    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) >> self.page_power
    }

    #[must_use]
    pub fn page_info(&self, index: usize) -> &PageInfo {
        &self.pages[index]
    }

    #[must_use]
    pub fn page_ptr(&self, index: usize) -> *mut u8 {
        (self.base + index * self.page_size) as *mut u8
    }

    /// The first-page owner for a (possibly multi-page) run containing `addr`.
    #[must_use]
    pub fn base_page_index(&self, addr: usize) -> usize {
        self.pages[self.page_index(addr)].base_page()
    }

    fn write_hole_header(&self, page: usize, page_count: usize, next: usize) {
        // SAFETY: `page` is within the partition and not concurrently read as
        // live object data — it is on the empty list, guarded by empty.head.
        unsafe {
            self.page_ptr(page)
                .cast::<HoleHeader>()
                .write(HoleHeader { page_count, next });
        }
    }

    fn read_hole_header(&self, page: usize) -> HoleHeader {
        // SAFETY: `page` is a live hole-list entry.
        unsafe { self.page_ptr(page).cast::<HoleHeader>().read() }
    }

    /// Remove a run of at least `n` contiguous pages from the empty list,
    /// splitting the hole it is found in if it is larger than `n`. Holds
    /// `empty_pages_lock` for the duration.
    pub fn take_pages(&self, n: usize) -> GcResult<usize> {
        let mut head = self.empty.head.lock();
        let mut prev: Option<usize> = None;
        let mut cur = *head;
        while cur != NONE_PAGE {
            let hole = self.read_hole_header(cur);
            if hole.page_count >= n {
                if hole.page_count == n {
                    match prev {
                        None => *head = hole.next,
                        Some(p) => {
                            let mut prev_hole = self.read_hole_header(p);
                            prev_hole.next = hole.next;
                            self.write_hole_header(p, prev_hole.page_count, prev_hole.next);
                        }
                    }
                } else {
                    // Shrink the hole in place; hand out its tail `n` pages so
                    // the header at `cur` never has to move.
                    self.write_hole_header(cur, hole.page_count - n, hole.next);
                }
                let given_start = cur + (hole.page_count - n);
                for i in 0..n {
                    self.pages[given_start + i].set_base_page(given_start);
                }
                return Ok(given_start);
            }
            prev = Some(cur);
            cur = hole.next;
        }
        Err(GcError::OutOfMemory {
            requested: n * self.page_size,
            group: None,
        })
    }

    /// Return a run of `n` pages starting at `first` to the empty list,
    /// marking them `PageOwner::Empty` and pushing a fresh hole header onto
    /// the front of the list.
    pub fn release_pages(&self, first: usize, n: usize) {
        for i in 0..n {
            let page = &self.pages[first + i];
            page.set_owner(PageOwner::Empty);
            page.set_bytes_used(0);
            page.set_base_page(first);
        }
        let mut head = self.empty.head.lock();
        self.write_hole_header(first, n, *head);
        *head = first;
    }

    /// Claim ownership of `n` pages starting at `first` for `owner`, e.g.
    /// right after `take_pages`.
    pub fn assign_pages(&self, first: usize, n: usize, owner: PageOwner) {
        for i in 0..n {
            let page = &self.pages[first + i];
            page.set_owner(owner);
            page.set_base_page(first);
        }
    }

    /// Rebuild the empty list from scratch by scanning the page array once,
    /// merging any pages that are physically adjacent and both empty into a
    /// single hole. Run during the collector's coalesce phase, never on the
    /// allocation fast path.
    pub fn merge_adjacent_holes(&self) {
        let mut head = self.empty.head.lock();
        *head = NONE_PAGE;
        let mut i = 0;
        let mut last_hole: Option<usize> = None;
        while i < self.page_count {
            if self.pages[i].owner() == PageOwner::Empty {
                let start = i;
                while i < self.page_count && self.pages[i].owner() == PageOwner::Empty {
                    self.pages[i].set_base_page(start);
                    i += 1;
                }
                let count = i - start;
                self.write_hole_header(start, count, NONE_PAGE);
                match last_hole {
                    None => *head = start,
                    Some(prev) => {
                        let prev_hole = self.read_hole_header(prev);
                        self.write_hole_header(prev, prev_hole.page_count, start);
                    }
                }
                last_hole = Some(start);
            } else {
                i += 1;
            }
        }
    }

    /// Total pages currently on the empty list; for metrics/diagnostics only
    /// (walks the whole list).
    #[must_use]
    pub fn empty_page_count(&self) -> usize {
        let head = self.empty.head.lock();
        let mut cur = *head;
        let mut total = 0;
        while cur != NONE_PAGE {
            let hole = self.read_hole_header(cur);
            total += hole.page_count;
            cur = hole.next;
        }
        total
    }
}

// SAFETY: Partition's interior mutability is all through atomics and
// parking_lot locks; the raw mmap'd region is addressed only via those.
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}
