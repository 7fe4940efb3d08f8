use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, RwLock};

use crate::base::{
    constants::PAGE_SIZE,
    formatted_size,
    virtual_memory::VirtualMemory,
};

use super::{
    object_header::ObjectHeader,
    page::{BasePage, LargePage, NormalPage, PagePtr},
    space::SpaceIndex,
};

/// Maps and unmaps page memory and answers which page owns an address.
///
/// Every page is registered by address range, so lookups work for interior
/// pointers anywhere in a large object as well.
pub struct PageBackend {
    regions: RwLock<BTreeMap<usize, (usize, PagePtr)>>,
    committed: AtomicUsize,
    max_size: Option<usize>,
    grow: Mutex<()>,
}

impl PageBackend {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            committed: AtomicUsize::new(0),
            max_size,
            grow: Mutex::new(()),
        }
    }

    pub fn committed_size(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn page_count(&self) -> usize {
        self.regions.read().len()
    }

    fn map(&self, size: usize) -> Option<VirtualMemory> {
        let _guard = self.grow.lock();
        let committed = self.committed.load(Ordering::Relaxed);
        if let Some(max) = self.max_size {
            if committed.checked_add(size)? > max {
                log::debug!(target: "gc-alloc", "heap limit {} reached ({} committed)", formatted_size(max), formatted_size(committed));
                return None;
            }
        }
        let memory = VirtualMemory::allocate_aligned(size, PAGE_SIZE)?;
        self.committed.fetch_add(memory.size(), Ordering::Relaxed);
        Some(memory)
    }

    fn register(&self, page: *mut BasePage) {
        unsafe {
            self.regions
                .write()
                .insert((*page).start(), ((*page).end(), PagePtr(page)));
        }
    }

    pub fn allocate_normal_page(&self, space: SpaceIndex) -> Option<*mut NormalPage> {
        let memory = self.map(PAGE_SIZE)?;
        let page = unsafe { NormalPage::create(memory, space) };
        self.register(page.cast());
        log::trace!(target: "gc-alloc", "new normal page {:p} for space {}", page, space.0);
        Some(page)
    }

    pub fn allocate_large_page(&self, space: SpaceIndex, payload_size: usize) -> Option<*mut LargePage> {
        let size = LargePage::allocation_size(payload_size)?;
        let memory = self.map(size)?;
        let page = unsafe { LargePage::create(memory, space, payload_size) };
        self.register(page.cast());
        log::trace!(target: "gc-alloc", "new large page {:p} ({})", page, formatted_size(payload_size));
        Some(page)
    }

    /// Unregisters and unmaps a page.
    pub unsafe fn free_page(&self, page: *mut BasePage) {
        let start = (*page).start();
        let size = (*page).size();
        self.regions.write().remove(&start);
        BasePage::destroy(page);
        self.committed.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn lookup(&self, addr: usize) -> Option<*mut BasePage> {
        let regions = self.regions.read();
        let (_, (end, page)) = regions.range(..=addr).next_back()?;
        if addr < *end {
            Some(page.0)
        } else {
            None
        }
    }

    pub fn find_header(&self, addr: usize) -> Option<*mut ObjectHeader> {
        let page = self.lookup(addr)?;
        unsafe { (*page).find_header(addr) }
    }
}

impl Drop for PageBackend {
    fn drop(&mut self) {
        let regions = std::mem::take(&mut *self.regions.write());
        for (_, (_, page)) in regions {
            unsafe { BasePage::destroy(page.0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::constants::*;

    #[test]
    fn test_normal_page_lookup() {
        let backend = PageBackend::new(None);
        let page = backend.allocate_normal_page(SpaceIndex(0)).unwrap();
        unsafe {
            let start = (*page).start();
            assert_eq!(start % PAGE_SIZE, 0);
            assert_eq!(backend.lookup(start + 100), Some(page.cast()));
            assert_eq!(backend.lookup(start + PAGE_SIZE - 1), Some(page.cast()));
            assert_eq!(backend.lookup(start + PAGE_SIZE), None);
            assert_eq!((*page).payload_start() % MAX_SUPPORTED_ALIGNMENT, 0);
            assert_eq!(backend.committed_size(), PAGE_SIZE);

            backend.free_page(page.cast());
            assert_eq!(backend.lookup(start + 100), None);
            assert_eq!(backend.committed_size(), 0);
        }
    }

    #[test]
    fn test_large_page_interior_lookup() {
        let backend = PageBackend::new(None);
        let payload = 3 * PAGE_SIZE;
        let page = backend.allocate_large_page(SpaceIndex(4), payload).unwrap();
        unsafe {
            let payload_start = (*page).payload() as usize;
            assert_eq!(payload_start % MAX_SUPPORTED_ALIGNMENT, 0);
            let deep = payload_start + 2 * PAGE_SIZE + 8;
            assert_eq!(backend.lookup(deep), Some(page.cast()));
            assert_eq!((*page).object_size(), payload + OBJECT_HEADER_SIZE);
            assert!((*page).contains(deep));
            assert!(!(*page).contains(payload_start + payload));
        }
    }

    #[test]
    fn test_limit_is_respected() {
        let backend = PageBackend::new(Some(2 * PAGE_SIZE));
        assert!(backend.allocate_normal_page(SpaceIndex(0)).is_some());
        assert!(backend.allocate_normal_page(SpaceIndex(0)).is_some());
        assert!(backend.allocate_normal_page(SpaceIndex(0)).is_none());
        assert_eq!(backend.page_count(), 2);
    }
}
