use std::mem::size_of;

#[cfg(target_pointer_width = "64")]
pub const WORD_SIZE_LOG2: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const WORD_SIZE_LOG2: usize = 2;
pub const WORD_SIZE: usize = 1 << WORD_SIZE_LOG2;

/// Every allocation (header included) is a multiple of the granularity.
pub const ALLOCATION_GRANULARITY_LOG2: usize = 3;
pub const ALLOCATION_GRANULARITY: usize = 1 << ALLOCATION_GRANULARITY_LOG2;
pub const ALLOCATION_MASK: usize = ALLOCATION_GRANULARITY - 1;

pub const DEFAULT_ALIGNMENT: usize = ALLOCATION_GRANULARITY;
pub const MAX_SUPPORTED_ALIGNMENT: usize = 2 * ALLOCATION_GRANULARITY;

pub const OBJECT_HEADER_SIZE: usize = size_of::<u64>();

pub const PAGE_SIZE_LOG2: usize = 17;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;
pub const PAGE_BASE_MASK: usize = !PAGE_OFFSET_MASK;

/// Payloads of this size or larger get a dedicated large page.
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = PAGE_SIZE / 2;

/// Upper bound for a LAB carved out of a free-list entry.
pub const MAX_LAB_SIZE: usize = 32 * 1024;

/// A free-list entry is a header followed by a next pointer.
pub const FREE_LIST_ENTRY_SIZE: usize = OBJECT_HEADER_SIZE + size_of::<usize>();

pub const MAX_ALLOCATION_RETRIES: usize = 3;
