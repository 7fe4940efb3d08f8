use once_cell::sync::Lazy;

use super::{formatted_size, utils::round_up};

static PAGE_SIZE: Lazy<usize> = Lazy::new(determine_page_size);

/// OS page size (not to be confused with the heap's `PAGE_SIZE`).
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// An aligned, committed, read-write region. Unmapped on drop.
pub struct VirtualMemory {
    start: usize,
    size: usize,
    #[cfg(not(unix))]
    alignment: usize,
}

impl VirtualMemory {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn address(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl VirtualMemory {
            /// Maps `size` bytes aligned to `alignment`. Over-reserves and trims
            /// the unaligned head and tail.
            pub fn allocate_aligned(size: usize, alignment: usize) -> Option<Self> {
                let size = round_up(size, page_size());
                let alignment = alignment.max(page_size());
                let allocated_size = size.checked_add(alignment - page_size())?;

                unsafe {
                    let addr = libc::mmap(
                        std::ptr::null_mut(),
                        allocated_size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    );

                    if addr == libc::MAP_FAILED {
                        log::warn!(target: "gc", "mmap of {} failed: {}", formatted_size(allocated_size), errno::errno());
                        return None;
                    }

                    let base = addr as usize;
                    let aligned_base = round_up(base, alignment);
                    unmap(base, aligned_base);
                    unmap(aligned_base + size, base + allocated_size);

                    Some(Self {
                        start: aligned_base,
                        size,
                    })
                }
            }
        }

        unsafe fn unmap(start: usize, end: usize) {
            if start == end {
                return;
            }
            if libc::munmap(start as _, end - start) != 0 {
                log::error!(target: "gc", "munmap({:x}, {}) failed: {}", start, end - start, errno::errno());
            }
        }

        impl Drop for VirtualMemory {
            fn drop(&mut self) {
                unsafe { unmap(self.start, self.end()) }
            }
        }

        fn determine_page_size() -> usize {
            let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if val <= 0 {
                4096
            } else {
                val as usize
            }
        }
    } else {
        use std::alloc::{alloc_zeroed, dealloc, Layout};

        impl VirtualMemory {
            pub fn allocate_aligned(size: usize, alignment: usize) -> Option<Self> {
                let size = round_up(size, page_size());
                let alignment = alignment.max(page_size());
                let layout = Layout::from_size_align(size, alignment).ok()?;
                let ptr = unsafe { alloc_zeroed(layout) };
                if ptr.is_null() {
                    log::warn!(target: "gc", "allocation of {} failed", formatted_size(size));
                    return None;
                }
                Some(Self {
                    start: ptr as usize,
                    size,
                    alignment,
                })
            }
        }

        impl Drop for VirtualMemory {
            fn drop(&mut self) {
                if let Ok(layout) = Layout::from_size_align(self.size, self.alignment) {
                    unsafe { dealloc(self.start as *mut u8, layout) }
                }
            }
        }

        fn determine_page_size() -> usize {
            4096
        }
    }
}
