//! The per-object header (`GC_HEADER`) threaded through every size-group's
//! intrusive doubly-linked lists.
//!
//! Every managed object begins with an [`ObjectHeader`]: two tagged link
//! words, `prev` and `next`. The low bits of `prev` carry the object's
//! *raw* color tag; the low bits of `next` carry its [`StorageClass`]. All
//! objects in the smallest size-group (16 bytes, `MIN_GROUP_SIZE`) are
//! exactly the size of this header — there is no room for anything else,
//! which is why color and storage class live in spare low bits rather than
//! as separate fields. Every allocation is at least 16-byte aligned (every
//! size class is a power of two `>= 16`), so the low 4 bits of any object
//! address are always free; we use 2 of them per link field.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Number of low bits of each link word reserved for a tag.
const TAG_BITS: u32 = 2;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;
const PTR_MASK: usize = !TAG_MASK;

/// Raw color tags stored in the low bits of `prev`.
///
/// `GRAY` and `GREEN` are absolute. The other two bit patterns, 0 and 1,
/// are *relative* to the collector's current [`ColorEpoch`]: whichever one
/// equals `marked_color` this cycle reads as [`Color::Black`], the other as
/// [`Color::White`]. Flipping the epoch therefore reinterprets every
/// object's color without touching a single header.
mod raw_tag {
    pub const EPOCH_A: u8 = 0;
    pub const EPOCH_B: u8 = 1;
    pub const GRAY: u8 = 2;
    pub const GREEN: u8 = 3;
}

/// Tri-color (plus green) object color, as interpreted through the current
/// [`ColorEpoch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Presumed garbage this cycle.
    White,
    /// Reachable, payload not yet scanned.
    Gray,
    /// Reachable, payload scanned (or freshly allocated).
    Black,
    /// On a free list; must never be promoted to gray by conservative scanning.
    Green,
}

/// Tag stored in the low bits of `next`, selecting how [`crate::marker`]
/// scans an object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageClass {
    /// Payload contains no heap pointers; never scanned.
    NoPointers = 0,
    /// Payload is scanned conservatively, word by word.
    Pointers = 1,
    /// Payload is scanned conservatively today; a documented extension point
    /// for a table-driven, metadata-guided precise scan.
    Metadata = 2,
    /// Same scan strategy as `Metadata` today; kept as a distinct storage
    /// class so an embedder can later attach instance-layout metadata
    /// without renumbering.
    Instance = 3,
}

impl StorageClass {
    const fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::NoPointers,
            1 => Self::Pointers,
            2 => Self::Metadata,
            _ => Self::Instance,
        }
    }
}

/// The collector-wide, swappable interpretation of the two relative color
/// tags (`raw_tag::EPOCH_A` / `raw_tag::EPOCH_B`).
///
/// There is exactly one `ColorEpoch` per heap (it is not per-group): flip
/// swaps it once, under every group's `free_lock`, and that single flip
/// reinterprets last cycle's BLACK objects as this cycle's WHITE across the
/// entire heap.
#[derive(Debug)]
pub struct ColorEpoch {
    /// The raw tag value that currently means "black" (marked).
    marked: AtomicU8,
}

impl ColorEpoch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            marked: AtomicU8::new(raw_tag::EPOCH_A),
        }
    }

    /// The raw tag value meaning BLACK this cycle.
    #[must_use]
    pub fn marked_color(&self) -> u8 {
        self.marked.load(Ordering::Acquire)
    }

    /// The raw tag value meaning WHITE this cycle.
    #[must_use]
    pub fn unmarked_color(&self) -> u8 {
        raw_tag::EPOCH_A + raw_tag::EPOCH_B - self.marked_color()
    }

    /// Swap `marked_color` and `unmarked_color`. Called once per flip, while
    /// the collector holds every group's `free_lock`.
    pub fn flip(&self) {
        let prev = self.marked.load(Ordering::Relaxed);
        let next = raw_tag::EPOCH_A + raw_tag::EPOCH_B - prev;
        self.marked.store(next, Ordering::Release);
    }
}

impl Default for ColorEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// Which link field an accessor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Prev,
    Next,
}

/// The object header threaded through every size-group's free/black/gray/white
/// lists. Exactly [`HEADER_SIZE`] bytes (16 on a 64-bit target): two tagged
/// link words and nothing else, so it fits the smallest (16-byte) size group
/// with zero bytes left for payload.
#[repr(C)]
pub struct ObjectHeader {
    prev: AtomicUsize,
    next: AtomicUsize,
}

/// Size of [`ObjectHeader`] in bytes; must equal `MIN_GROUP_SIZE`.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    /// Construct a header in place at `ptr`, initialized to a freshly
    /// allocated, black (per `epoch`), given-storage-class object with no
    /// links.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `HEADER_SIZE` writable, suitably
    /// aligned bytes that are not concurrently observed by another thread.
    pub unsafe fn init(
        ptr: NonNull<ObjectHeader>,
        class: StorageClass,
        color: Color,
        epoch: &ColorEpoch,
    ) -> NonNull<ObjectHeader> {
        let prev_tag = match color {
            Color::Black => epoch.marked_color(),
            Color::White => epoch.unmarked_color(),
            Color::Gray => raw_tag::GRAY,
            Color::Green => raw_tag::GREEN,
        } as usize;
        let next_tag = class as usize;
        // SAFETY: caller guarantees `ptr` is valid for writes of HEADER_SIZE.
        unsafe {
            ptr.as_ptr()
                .cast::<AtomicUsize>()
                .write(AtomicUsize::new(prev_tag));
            ptr.as_ptr()
                .add(1)
                .cast::<AtomicUsize>()
                .write(AtomicUsize::new(next_tag));
        }
        ptr
    }

    fn field(&self, link: Link) -> &AtomicUsize {
        match link {
            Link::Prev => &self.prev,
            Link::Next => &self.next,
        }
    }

    /// Read the pointer portion of a link field, masking the tag bits.
    #[must_use]
    pub fn link(&self, which: Link) -> Option<NonNull<ObjectHeader>> {
        let raw = self.field(which).load(Ordering::Acquire) & PTR_MASK;
        NonNull::new(raw as *mut ObjectHeader)
    }

    /// Overwrite the pointer portion of a link field, preserving its tag bits.
    pub fn set_link(&self, which: Link, target: Option<NonNull<ObjectHeader>>) {
        let field = self.field(which);
        let new_ptr = target.map_or(0, |p| p.as_ptr() as usize) & PTR_MASK;
        let _ = field.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((cur & TAG_MASK) | new_ptr)
        });
    }

    /// The object's storage class, read from `next`'s tag bits. Fixed at
    /// allocation time; never changes afterward.
    #[must_use]
    pub fn storage_class(&self) -> StorageClass {
        let tag = (self.next.load(Ordering::Relaxed) & TAG_MASK) as u8;
        StorageClass::from_tag(tag)
    }

    /// Overwrite the object's storage class. Only safe to call while the
    /// object is not visible to concurrent scanning (i.e. before it leaves
    /// the free list on allocation).
    pub fn set_storage_class(&self, class: StorageClass) {
        let tag = class as usize;
        let _ = self.next.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((cur & PTR_MASK) | tag)
        });
    }

    /// This object's color, interpreted through the given epoch.
    #[must_use]
    pub fn color(&self, epoch: &ColorEpoch) -> Color {
        let tag = (self.prev.load(Ordering::Acquire) & TAG_MASK) as u8;
        match tag {
            raw_tag::GRAY => Color::Gray,
            raw_tag::GREEN => Color::Green,
            t if t == epoch.marked_color() => Color::Black,
            _ => Color::White,
        }
    }

    /// Set this object's color. For `Black`/`White` this writes whichever
    /// raw tag the current epoch maps to that color, so a later flip
    /// reinterprets it correctly.
    pub fn set_color(&self, color: Color, epoch: &ColorEpoch) {
        let tag = match color {
            Color::Black => epoch.marked_color(),
            Color::White => epoch.unmarked_color(),
            Color::Gray => raw_tag::GRAY,
            Color::Green => raw_tag::GREEN,
        } as usize;
        let _ = self.prev.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((cur & PTR_MASK) | tag)
        });
    }

    /// Cast a payload-start pointer (as handed to mutators) back to its header.
    #[must_use]
    pub fn from_payload(payload: NonNull<u8>) -> NonNull<ObjectHeader> {
        // SAFETY: payload is always header_size bytes past the object base.
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE).cast()) }
    }

    /// The payload pointer for this header (the address handed to mutators).
    #[must_use]
    pub fn payload(header: NonNull<ObjectHeader>) -> NonNull<u8> {
        // SAFETY: header + HEADER_SIZE is always within the same allocation.
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_min_group_size() {
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn color_epoch_flip_is_involution() {
        let epoch = ColorEpoch::new();
        let marked0 = epoch.marked_color();
        epoch.flip();
        epoch.flip();
        assert_eq!(epoch.marked_color(), marked0);
    }

    #[test]
    fn flip_reinterprets_black_as_white_without_touching_header() {
        let mut storage = [0u8; HEADER_SIZE];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap().cast();
        let epoch = ColorEpoch::new();
        let header = unsafe { ObjectHeader::init(ptr, StorageClass::Pointers, Color::Black, &epoch) };
        let header = unsafe { header.as_ref() };
        assert_eq!(header.color(&epoch), Color::Black);
        epoch.flip();
        assert_eq!(header.color(&epoch), Color::White);
    }

    #[test]
    fn set_link_preserves_tag_bits() {
        let mut storage = [0u8; HEADER_SIZE];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap().cast();
        let epoch = ColorEpoch::new();
        let header = unsafe { ObjectHeader::init(ptr, StorageClass::Instance, Color::Black, &epoch) };
        let header = unsafe { header.as_ref() };
        assert_eq!(header.storage_class(), StorageClass::Instance);
        header.set_link(Link::Next, None);
        assert_eq!(header.storage_class(), StorageClass::Instance);
        assert_eq!(header.link(Link::Next), None);
    }
}
