use std::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

use crate::base::{
    constants::*,
    utils::round_up,
    virtual_memory::VirtualMemory,
};

use super::{object_header::ObjectHeader, object_start_bitmap::ObjectStartBitmap, space::SpaceIndex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Normal,
    Large,
}

/// Common prefix of normal and large pages. Lives at the start of the
/// page's own memory.
#[repr(C)]
pub struct BasePage {
    memory: VirtualMemory,
    space: SpaceIndex,
    kind: PageKind,
}

impl BasePage {
    /// Only valid for addresses within the first `PAGE_SIZE` bytes of a page.
    #[inline(always)]
    pub fn from_payload(addr: usize) -> *mut Self {
        (addr & PAGE_BASE_MASK) as *mut Self
    }

    pub fn space(&self) -> SpaceIndex {
        self.space
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    pub fn start(&self) -> usize {
        self.memory.start()
    }

    pub fn end(&self) -> usize {
        self.memory.end()
    }

    /// Bytes of mapped memory backing this page.
    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn payload_start(&self) -> usize {
        match self.kind {
            PageKind::Normal => self.start() + NormalPage::PAYLOAD_OFFSET,
            PageKind::Large => self.start() + LargePage::HEADER_OFFSET,
        }
    }

    pub fn payload_end(&self) -> usize {
        match self.kind {
            PageKind::Normal => self.end(),
            PageKind::Large => unsafe {
                let page = &*(self as *const Self as *const LargePage);
                page.payload() as usize + page.payload_size
            },
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.payload_start() && addr < self.payload_end()
    }

    /// Finds the live or dead object containing `addr`. Free-list entries,
    /// fillers and the unused part of a LAB yield `None`.
    pub unsafe fn find_header(&self, addr: usize) -> Option<*mut ObjectHeader> {
        if !self.contains(addr) {
            return None;
        }
        let header = match self.kind {
            PageKind::Normal => {
                let page = &*(self as *const Self as *const NormalPage);
                let start = page.bitmap.find_header(addr);
                if start == 0 {
                    return None;
                }
                start as *mut ObjectHeader
            }
            PageKind::Large => (*(self as *const Self as *const LargePage)).object_header(),
        };
        if (*header).is_free() || !(*header).contains(addr) {
            return None;
        }
        Some(header)
    }

    /// Unmaps the page. The pointer is dangling afterwards.
    pub unsafe fn destroy(page: *mut BasePage) {
        let memory = std::ptr::read(&(*page).memory);
        drop(memory);
    }
}

/// Bump-allocated page holding many objects of one space.
#[repr(C)]
pub struct NormalPage {
    base: BasePage,
    pub(crate) bitmap: ObjectStartBitmap,
}

impl NormalPage {
    pub const PAYLOAD_OFFSET: usize = round_up(size_of::<Self>(), MAX_SUPPORTED_ALIGNMENT);
    pub const PAYLOAD_SIZE: usize = PAGE_SIZE - Self::PAYLOAD_OFFSET;

    /// Writes the page header into `memory`, which must be `PAGE_SIZE` bytes
    /// aligned to `PAGE_SIZE`.
    pub unsafe fn create(memory: VirtualMemory, space: SpaceIndex) -> *mut Self {
        debug_assert_eq!(memory.start() & PAGE_OFFSET_MASK, 0);
        debug_assert_eq!(memory.size(), PAGE_SIZE);
        let ptr = memory.address().cast::<Self>();
        let bitmap = ObjectStartBitmap::new(memory.start() + Self::PAYLOAD_OFFSET);
        ptr.write(Self {
            base: BasePage {
                memory,
                space,
                kind: PageKind::Normal,
            },
            bitmap,
        });
        ptr
    }

    #[inline(always)]
    pub fn from_payload(addr: usize) -> *mut Self {
        BasePage::from_payload(addr).cast()
    }

    /// Visits every header on the page, free-list entries included.
    pub unsafe fn for_each_header(&self, mut f: impl FnMut(*mut ObjectHeader)) {
        let mut current = self.payload_start();
        let end = self.payload_end();
        while current < end {
            let header = current as *mut ObjectHeader;
            let size = (*header).allocated_size();
            debug_assert!(size > 0, "corrupt header at {:x}", current);
            f(header);
            current += size;
        }
    }
}

impl Deref for NormalPage {
    type Target = BasePage;
    fn deref(&self) -> &BasePage {
        &self.base
    }
}

impl DerefMut for NormalPage {
    fn deref_mut(&mut self) -> &mut BasePage {
        &mut self.base
    }
}

/// Page holding exactly one object. The object's header has a zero size tag;
/// its size lives here.
#[repr(C)]
pub struct LargePage {
    base: BasePage,
    payload_size: usize,
}

impl LargePage {
    /// Places the header so that the payload is `MAX_SUPPORTED_ALIGNMENT` aligned.
    pub const HEADER_OFFSET: usize =
        round_up(size_of::<Self>() + OBJECT_HEADER_SIZE, MAX_SUPPORTED_ALIGNMENT) - OBJECT_HEADER_SIZE;

    pub fn allocation_size(payload_size: usize) -> Option<usize> {
        payload_size.checked_add(Self::HEADER_OFFSET + OBJECT_HEADER_SIZE)
    }

    pub unsafe fn create(memory: VirtualMemory, space: SpaceIndex, payload_size: usize) -> *mut Self {
        debug_assert_eq!(memory.start() & PAGE_OFFSET_MASK, 0);
        let ptr = memory.address().cast::<Self>();
        ptr.write(Self {
            base: BasePage {
                memory,
                space,
                kind: PageKind::Large,
            },
            payload_size,
        });
        ptr
    }

    pub fn from_header(header: *const ObjectHeader) -> *mut Self {
        (header as usize - Self::HEADER_OFFSET) as *mut Self
    }

    pub fn object_header(&self) -> *mut ObjectHeader {
        (self.start() + Self::HEADER_OFFSET) as *mut ObjectHeader
    }

    pub fn payload(&self) -> *mut u8 {
        (self.start() + Self::HEADER_OFFSET + OBJECT_HEADER_SIZE) as *mut u8
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Size of the object including its header.
    pub fn object_size(&self) -> usize {
        self.payload_size + OBJECT_HEADER_SIZE
    }
}

impl Deref for LargePage {
    type Target = BasePage;
    fn deref(&self) -> &BasePage {
        &self.base
    }
}

impl DerefMut for LargePage {
    fn deref_mut(&mut self) -> &mut BasePage {
        &mut self.base
    }
}

/// Page pointer that can be handed between the mutator and the sweeper.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PagePtr(pub *mut BasePage);

unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

impl PagePtr {
    pub fn as_normal(self) -> *mut NormalPage {
        debug_assert!(unsafe { !(*self.0).is_large() });
        self.0.cast()
    }

    pub fn as_large(self) -> *mut LargePage {
        debug_assert!(unsafe { (*self.0).is_large() });
        self.0.cast()
    }

    pub fn is_large(self) -> bool {
        unsafe { (*self.0).is_large() }
    }
}
