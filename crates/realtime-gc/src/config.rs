//! Heap configuration. A constructible value rather than compile-time
//! constants, so a process can stand up more than one [`crate::RealtimeHeap`]
//! (tests routinely do).

/// Smallest size-group index: objects of `2^4 = 16` bytes (one header, no
/// payload).
pub const DEFAULT_MIN_GROUP_INDEX: u32 = 4;
/// Largest size-group index managed by the segregated allocator: objects
/// up to `2^22 = 4 MiB`. Anything bigger is a multi-page "big" object
/// tracked directly by the partition rather than a size group.
pub const DEFAULT_MAX_GROUP_INDEX: u32 = 22;
/// Default page size: `2^12 = 4 KiB`.
pub const DEFAULT_PAGE_POWER: u32 = 12;

/// Configuration for a [`crate::RealtimeHeap`] instance.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total size in bytes of the managed heap partition, reserved up front
    /// via a single contiguous mapping.
    pub default_heap_bytes: usize,
    /// Size in bytes of the static space used for global roots and
    /// collector-internal bookkeeping outside the managed partition.
    pub static_size: usize,
    /// Log2 of the page size. Pages are the unit the partition is carved
    /// into and handed to size groups.
    pub page_power: u32,
    /// Smallest managed size-group index (inclusive).
    pub min_group_index: u32,
    /// Largest managed size-group index (inclusive). Objects larger than
    /// `2^max_group_index` bytes are allocated as multi-page big objects.
    pub max_group_index: u32,
    /// Objects spanning more pages than this are never retained by an
    /// interior pointer found during conservative scanning — see
    /// `marker::make_object_gray`'s interior-pointer guard.
    pub interior_ptr_retention_limit: usize,
}

impl HeapConfig {
    /// Page size in bytes, derived from `page_power`.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        1 << self.page_power
    }

    /// The range of managed size-group indices.
    #[must_use]
    pub const fn group_indices(&self) -> std::ops::RangeInclusive<u32> {
        self.min_group_index..=self.max_group_index
    }

    /// Byte size of the largest object a size group (as opposed to the big
    /// object path) will ever hold.
    #[must_use]
    pub const fn max_group_size(&self) -> usize {
        1 << self.max_group_index
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            default_heap_bytes: 64 * 1024 * 1024,
            static_size: 1024 * 1024,
            page_power: DEFAULT_PAGE_POWER,
            min_group_index: DEFAULT_MIN_GROUP_INDEX,
            max_group_index: DEFAULT_MAX_GROUP_INDEX,
            interior_ptr_retention_limit: 1 << DEFAULT_PAGE_POWER,
        }
    }
}
