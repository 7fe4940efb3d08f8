use std::{
    marker::PhantomData,
    mem::needs_drop,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::base::{bitfield::BitField, constants::*};

use super::{
    page::LargePage,
    traits::{finalize_erased, trace_erased, GarbageCollected},
    visitor::{TraceCallback, Visitor},
};

pub type FinalizationCallback = fn(*mut u8);

/// Per-type descriptor referenced from every object header.
#[repr(align(8))]
pub struct GcInfo {
    pub trace: TraceCallback,
    pub finalize: Option<FinalizationCallback>,
    pub name: fn() -> &'static str,
}

pub trait ConstVal<T> {
    const VAL: T;
}

pub struct VT<T> {
    marker: PhantomData<*const T>,
}

impl<T: GarbageCollected> ConstVal<&'static GcInfo> for VT<T> {
    const VAL: &'static GcInfo = &GcInfo {
        trace: trace_erased::<T>,
        finalize: if needs_drop::<T>() {
            Some(finalize_erased::<T>)
        } else {
            None
        },
        name: std::any::type_name::<T>,
    };
}

pub fn gc_info_of<T: GarbageCollected>() -> &'static GcInfo {
    <VT<T> as ConstVal<&'static GcInfo>>::VAL
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    Atomic,
    NonAtomic,
}

pub const MARK_BIT: u64 = 1 << 0;
pub const FREE_BIT: u64 = 1 << 1;
pub const FINALIZABLE_BIT: u64 = 1 << 2;

pub const SIZE_TAG_POS: usize = 3;
pub const SIZE_TAG_SIZE: usize = 15;
pub const GC_INFO_TAG_POS: usize = SIZE_TAG_POS + SIZE_TAG_SIZE;
pub const GC_INFO_TAG_SIZE: usize = 64 - GC_INFO_TAG_POS;

/// Allocation size in granules. Zero means "large object, ask the page".
pub type SizeTag = BitField<SIZE_TAG_SIZE, SIZE_TAG_POS>;
/// `GcInfo` address shifted right by the granularity.
pub type GcInfoTag = BitField<GC_INFO_TAG_SIZE, GC_INFO_TAG_POS>;

pub const MAX_ENCODED_SIZE: usize = (SizeTag::mask() as usize) << ALLOCATION_GRANULARITY_LOG2;

/// Metadata word in front of every allocation.
///
/// ```text
/// | gc info (46) | size in granules (15) | finalizable | free | mark |
/// ```
///
/// The payload starts right after the header.
#[repr(C)]
pub struct ObjectHeader {
    encoded: AtomicU64,
}

impl ObjectHeader {
    fn encode_size(size: usize) -> u64 {
        debug_assert_eq!(size & ALLOCATION_MASK, 0);
        if size > MAX_ENCODED_SIZE {
            0
        } else {
            SizeTag::encode((size >> ALLOCATION_GRANULARITY_LOG2) as u64)
        }
    }

    /// Formats an object header at `addr`. `size` includes the header; pass 0
    /// for objects living on a large page.
    pub unsafe fn format(addr: usize, size: usize, gc_info: &'static GcInfo, marked: bool) -> *mut Self {
        let info = gc_info as *const GcInfo as usize;
        debug_assert_eq!(info & ALLOCATION_MASK, 0);
        debug_assert!(GcInfoTag::is_valid((info >> ALLOCATION_GRANULARITY_LOG2) as u64));

        let mut bits = Self::encode_size(size) | GcInfoTag::encode((info >> ALLOCATION_GRANULARITY_LOG2) as u64);
        if gc_info.finalize.is_some() {
            bits |= FINALIZABLE_BIT;
        }
        if marked {
            bits |= MARK_BIT;
        }
        let header = addr as *mut Self;
        header.write(Self {
            encoded: AtomicU64::new(bits),
        });
        header
    }

    /// Formats a header for a free-list entry or a filler gap.
    pub unsafe fn format_free(addr: usize, size: usize) -> *mut Self {
        debug_assert!(size >= OBJECT_HEADER_SIZE && size <= MAX_ENCODED_SIZE);
        let header = addr as *mut Self;
        header.write(Self {
            encoded: AtomicU64::new(Self::encode_size(size) | FREE_BIT),
        });
        header
    }

    #[inline(always)]
    fn load(&self, mode: AccessMode) -> u64 {
        match mode {
            AccessMode::Atomic => self.encoded.load(Ordering::Acquire),
            AccessMode::NonAtomic => self.encoded.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub fn from_payload(payload: *const u8) -> *mut Self {
        (payload as usize - OBJECT_HEADER_SIZE) as *mut Self
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + OBJECT_HEADER_SIZE) as *mut u8
    }

    pub fn is_free(&self) -> bool {
        self.load(AccessMode::NonAtomic) & FREE_BIT != 0
    }

    pub fn is_finalizable(&self) -> bool {
        self.load(AccessMode::NonAtomic) & FINALIZABLE_BIT != 0
    }

    pub fn is_large_object(&self) -> bool {
        SizeTag::decode(self.load(AccessMode::NonAtomic)) == 0
    }

    pub fn is_marked(&self, mode: AccessMode) -> bool {
        self.load(mode) & MARK_BIT != 0
    }

    /// Sets the mark bit. Returns true for exactly one of any number of
    /// racing callers.
    #[inline]
    pub fn try_mark_atomic(&self) -> bool {
        self.encoded.fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    pub fn unmark(&self, mode: AccessMode) {
        debug_assert!(self.is_marked(mode));
        match mode {
            AccessMode::Atomic => {
                self.encoded.fetch_and(!MARK_BIT, Ordering::Release);
            }
            AccessMode::NonAtomic => {
                let bits = self.encoded.load(Ordering::Relaxed);
                self.encoded.store(bits & !MARK_BIT, Ordering::Relaxed);
            }
        }
    }

    pub fn gc_info(&self) -> Option<&'static GcInfo> {
        let info = GcInfoTag::decode(self.load(AccessMode::NonAtomic)) as usize;
        if info == 0 {
            None
        } else {
            Some(unsafe { &*((info << ALLOCATION_GRANULARITY_LOG2) as *const GcInfo) })
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.gc_info().map(|info| (info.name)()).unwrap_or("<free>")
    }

    /// Full size of the allocation, header included.
    pub fn allocated_size(&self) -> usize {
        let size = (SizeTag::decode(self.load(AccessMode::NonAtomic)) as usize) << ALLOCATION_GRANULARITY_LOG2;
        if size != 0 {
            return size;
        }
        unsafe { (*LargePage::from_header(self)).object_size() }
    }

    /// Size of the payload only.
    pub fn object_size(&self) -> usize {
        self.allocated_size() - OBJECT_HEADER_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        let start = self as *const Self as usize;
        addr >= start && addr < start + self.allocated_size()
    }

    pub fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(info) = self.gc_info() {
            (info.trace)(self.payload(), visitor);
        }
    }

    /// Runs the type's finalizer. Must be called at most once per object.
    pub unsafe fn finalize(&self) {
        debug_assert!(!self.is_free(), "finalizing free memory");
        if let Some(finalize) = self.gc_info().and_then(|info| info.finalize) {
            finalize(self.payload());
        }
    }
}
