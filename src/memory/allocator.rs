use std::{fmt, sync::atomic::Ordering};

use crate::base::{
    constants::*,
    formatted_size,
    utils::{is_aligned, round_up},
};

use super::{
    object_header::{GcInfo, ObjectHeader},
    page::{NormalPage, PagePtr},
    space::{resolve_space, RegularSpaceType, SpaceIndex, SpaceSelector},
    sweeper, HeapShared,
};

/// Requests rejected before touching any page, plus heap exhaustion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocationError {
    ZeroSize,
    UnsupportedAlignment(usize),
    UnknownCustomSpace(usize),
    SizeOverflow(usize),
    OutOfMemory { size: usize, space: SpaceIndex },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "cannot allocate zero bytes"),
            Self::UnsupportedAlignment(alignment) => write!(
                f,
                "alignment {} is not supported (must be a power of two up to {})",
                alignment, MAX_SUPPORTED_ALIGNMENT
            ),
            Self::UnknownCustomSpace(index) => write!(f, "custom space {} was not configured", index),
            Self::SizeOverflow(size) => write!(f, "allocation of {} bytes overflows", size),
            Self::OutOfMemory { size, space } => {
                write!(f, "out of memory allocating {} in space {}", formatted_size(*size), space.0)
            }
        }
    }
}

impl std::error::Error for AllocationError {}

pub enum AllocationResult {
    /// Payload address of a formatted object.
    Object(*mut u8),
    /// The space could not grow; collect and try again.
    Retry(SpaceIndex),
}

/// Thread-exclusive bump region inside one page.
pub struct LinearAllocationBuffer {
    start: usize,
    size: usize,
}

impl LinearAllocationBuffer {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    #[inline(always)]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn set(&mut self, start: usize, size: usize) {
        self.start = start;
        self.size = size;
    }

    /// Returns `(filler, header)` addresses. `filler` is non-zero when a
    /// granule had to be skipped to align the payload.
    #[inline(always)]
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Option<(usize, usize)> {
        let mut padding = 0;
        if alignment > DEFAULT_ALIGNMENT && !is_aligned(self.start + OBJECT_HEADER_SIZE, alignment) {
            padding = ALLOCATION_GRANULARITY;
        }
        if padding + size > self.size {
            return None;
        }
        let filler = if padding != 0 { self.start } else { 0 };
        let header = self.start + padding;
        self.start += padding + size;
        self.size -= padding + size;
        Some((filler, header))
    }
}

/// The mutator's allocation front end: one LAB per normal space.
pub struct ObjectAllocator {
    labs: Vec<LinearAllocationBuffer>,
    custom_spaces: usize,
    allocated_bytes: usize,
}

impl ObjectAllocator {
    pub fn new(space_count: usize, custom_spaces: usize) -> Self {
        Self {
            labs: (0..space_count).map(|_| LinearAllocationBuffer::new(0, 0)).collect(),
            custom_spaces,
            allocated_bytes: 0,
        }
    }

    /// Bytes handed out since the last call to `take_allocated_bytes`.
    pub fn take_allocated_bytes(&mut self) -> usize {
        std::mem::take(&mut self.allocated_bytes)
    }

    pub fn lab(&self, space: SpaceIndex) -> &LinearAllocationBuffer {
        &self.labs[space.0]
    }

    pub fn allocate(
        &mut self,
        shared: &HeapShared,
        payload_size: usize,
        alignment: usize,
        gc_info: &'static GcInfo,
        selector: SpaceSelector,
    ) -> Result<AllocationResult, AllocationError> {
        if payload_size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        if !alignment.is_power_of_two() || alignment > MAX_SUPPORTED_ALIGNMENT {
            return Err(AllocationError::UnsupportedAlignment(alignment));
        }
        if payload_size > isize::MAX as usize / 2 {
            return Err(AllocationError::SizeOverflow(payload_size));
        }
        let space = match resolve_space(selector, payload_size, self.custom_spaces) {
            Some(space) => space,
            None => match selector {
                SpaceSelector::Custom(index) => return Err(AllocationError::UnknownCustomSpace(index)),
                SpaceSelector::Regular => unreachable!(),
            },
        };

        if payload_size >= LARGE_OBJECT_SIZE_THRESHOLD {
            return Ok(self.allocate_large(shared, payload_size, gc_info));
        }

        let size = round_up(payload_size + OBJECT_HEADER_SIZE, ALLOCATION_GRANULARITY);
        if let Some(payload) = self.allocate_in_lab(shared, space, size, alignment, gc_info) {
            return Ok(AllocationResult::Object(payload));
        }
        Ok(self.out_of_line_allocate(shared, space, size, alignment, gc_info))
    }

    #[inline(always)]
    fn allocate_in_lab(
        &mut self,
        shared: &HeapShared,
        space: SpaceIndex,
        size: usize,
        alignment: usize,
        gc_info: &'static GcInfo,
    ) -> Option<*mut u8> {
        let (filler, addr) = self.labs[space.0].allocate(size, alignment)?;
        // Acquire pairs with the Release store that starts marking: an
        // allocation that observes the flag is allocated black.
        let black = shared.is_marking.load(Ordering::Acquire);
        unsafe {
            let page = NormalPage::from_payload(addr);
            if filler != 0 {
                ObjectHeader::format_free(filler, ALLOCATION_GRANULARITY);
                (*page).bitmap.set_bit(filler);
            }
            let header = ObjectHeader::format(addr, size, gc_info, black);
            (*page).bitmap.set_bit(addr);
            self.allocated_bytes += size;
            Some((*header).payload())
        }
    }

    #[cold]
    fn out_of_line_allocate(
        &mut self,
        shared: &HeapShared,
        space: SpaceIndex,
        size: usize,
        alignment: usize,
        gc_info: &'static GcInfo,
    ) -> AllocationResult {
        let needed = if alignment > DEFAULT_ALIGNMENT {
            size + ALLOCATION_GRANULARITY
        } else {
            size
        };
        if !self.refill_linear_allocation_buffer(shared, space, needed) {
            return AllocationResult::Retry(space);
        }
        match self.allocate_in_lab(shared, space, size, alignment, gc_info) {
            Some(payload) => AllocationResult::Object(payload),
            None => {
                debug_assert!(false, "refilled LAB cannot hold {} bytes", needed);
                AllocationResult::Retry(space)
            }
        }
    }

    fn refill_linear_allocation_buffer(&mut self, shared: &HeapShared, space: SpaceIndex, size: usize) -> bool {
        self.close_lab(shared, space);

        if self.refill_linear_allocation_buffer_from_free_list(shared, space, size) {
            return true;
        }

        if sweeper::sweep_for_allocation(shared, space, size)
            && self.refill_linear_allocation_buffer_from_free_list(shared, space, size)
        {
            return true;
        }

        let page = match shared.backend.allocate_normal_page(space) {
            Some(page) => page,
            None => return false,
        };
        shared.spaces[space.0].add_page(PagePtr(page.cast()));
        unsafe {
            self.labs[space.0].set((*page).payload_start(), NormalPage::PAYLOAD_SIZE);
        }
        true
    }

    fn refill_linear_allocation_buffer_from_free_list(&mut self, shared: &HeapShared, space: SpaceIndex, size: usize) -> bool {
        let mut state = shared.spaces[space.0].lock();
        let block = match unsafe { state.free_list.allocate(size) } {
            Some(block) => block,
            None => return false,
        };

        let lab_size = block.size.min(size.max(MAX_LAB_SIZE));
        if lab_size < block.size {
            unsafe {
                state.free_list.add(super::free_list::FreeListBlock {
                    address: block.address + lab_size,
                    size: block.size - lab_size,
                });
            }
        }
        self.labs[space.0].set(block.address, lab_size);
        true
    }

    fn allocate_large(&mut self, shared: &HeapShared, payload_size: usize, gc_info: &'static GcInfo) -> AllocationResult {
        let space = RegularSpaceType::Large.index();
        let payload_size = round_up(payload_size, ALLOCATION_GRANULARITY);
        let page = match shared.backend.allocate_large_page(space, payload_size) {
            Some(page) => page,
            None => return AllocationResult::Retry(space),
        };
        let black = shared.is_marking.load(Ordering::Acquire);
        unsafe {
            let header = ObjectHeader::format((*page).object_header() as usize, 0, gc_info, black);
            shared.spaces[space.0].add_page(PagePtr(page.cast()));
            self.allocated_bytes += (*page).object_size();
            AllocationResult::Object((*header).payload())
        }
    }

    /// Returns the unused part of the space's LAB to its free list.
    fn close_lab(&mut self, shared: &HeapShared, space: SpaceIndex) {
        let lab = &mut self.labs[space.0];
        if lab.size() != 0 {
            let mut state = shared.spaces[space.0].lock();
            unsafe {
                state.free_list.add(super::free_list::FreeListBlock {
                    address: lab.start(),
                    size: lab.size(),
                });
            }
        }
        lab.set(0, 0);
    }

    /// Closes every LAB so that all pages can be walked header by header.
    pub fn reset_linear_allocation_buffers(&mut self, shared: &HeapShared) {
        for index in 0..self.labs.len() {
            self.close_lab(shared, SpaceIndex(index));
        }
    }
}
