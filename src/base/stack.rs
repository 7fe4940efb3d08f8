//! Mutator stack bounds for conservative root scanning.

use std::mem::size_of;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackBounds {
    /// Highest address; the stack grows down from here.
    pub origin: usize,
    /// Lowest usable address.
    pub bound: usize,
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Option<Self> {
        unsafe {
            let thread = libc::pthread_self();
            let origin = libc::pthread_get_stackaddr_np(thread) as usize;
            let size = libc::pthread_get_stacksize_np(thread);
            Some(Self {
                origin,
                bound: origin - size,
            })
        }
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Option<Self> {
        unsafe {
            let mut bound = std::ptr::null_mut::<libc::c_void>();
            let mut stack_size = 0;
            let mut sattr: libc::pthread_attr_t = std::mem::zeroed();
            libc::pthread_attr_init(&mut sattr);
            #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
            let rc = libc::pthread_attr_get_np(libc::pthread_self(), &mut sattr);
            #[cfg(not(any(target_os = "freebsd", target_os = "netbsd")))]
            let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut sattr);
            if rc != 0 {
                libc::pthread_attr_destroy(&mut sattr);
                return None;
            }
            let rc = libc::pthread_attr_getstack(&sattr, &mut bound, &mut stack_size);
            libc::pthread_attr_destroy(&mut sattr);
            if rc != 0 || bound.is_null() {
                return None;
            }
            Some(Self {
                bound: bound as usize,
                origin: bound as usize + stack_size,
            })
        }
    }
}

#[cfg(not(unix))]
impl StackBounds {
    pub fn current_thread_stack_bounds() -> Option<Self> {
        None
    }
}

#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker as *const usize as usize)
}

/// Calls `visitor` with every word between the current stack pointer and
/// the stack origin.
#[inline(never)]
pub fn scan_current_stack(bounds: StackBounds, visitor: &mut dyn FnMut(usize)) {
    let start = approximate_stack_pointer() & !(size_of::<usize>() - 1);
    let mut current = start.max(bounds.bound);
    while current + size_of::<usize>() <= bounds.origin {
        let word = unsafe { (current as *const usize).read_volatile() };
        if word != 0 {
            visitor(word);
        }
        current += size_of::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_stack_bounds_contain_locals() {
        let bounds = StackBounds::current_thread_stack_bounds().unwrap();
        let local = 1u64;
        let addr = &local as *const u64 as usize;
        assert!(bounds.bound < addr && addr < bounds.origin);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_finds_value_on_stack() {
        let needle = std::hint::black_box(0xdead_beef_usize);
        let bounds = StackBounds::current_thread_stack_bounds().unwrap();
        let mut found = false;
        scan_current_stack(bounds, &mut |word| found |= word == needle);
        assert!(found);
        std::hint::black_box(&needle);
    }
}
