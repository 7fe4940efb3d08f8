use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Deref,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use super::{
    object_header::ObjectHeader,
    traits::{trace_erased, GarbageCollected, GarbageCollectedMixin, Trace},
    visitor::{LivenessBroker, TraceDescriptor, Visitor},
    Heap,
};

/// Unbarriered pointer to a managed object. Valid while the object is
/// reachable from a root or the stack.
pub struct Handle<T> {
    ptr: NonNull<T>,
    marker: PhantomData<T>,
}

impl<T> Handle<T> {
    /// # Safety
    ///
    /// `ptr` must be the payload of a live allocation holding a `T`.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
            marker: PhantomData,
        }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn header(self) -> *mut ObjectHeader {
        ObjectHeader::from_payload(self.ptr.as_ptr().cast())
    }

    pub fn ptr_eq(self, other: Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: GarbageCollected> Handle<T> {
    pub fn trace_descriptor(self) -> TraceDescriptor {
        TraceDescriptor::new(self.ptr.as_ptr().cast(), trace_erased::<T>)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: GarbageCollected> Trace for Handle<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.visit(self.trace_descriptor());
    }
}

/// Strong, mutable reference field of a managed object.
pub struct Member<T> {
    ptr: AtomicPtr<T>,
}

impl<T: GarbageCollected> Member<T> {
    pub fn new(value: Handle<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(value.as_ptr()),
        }
    }

    pub fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(null_mut()),
        }
    }

    pub fn get(&self) -> Option<Handle<T>> {
        let ptr = self.ptr.load(Ordering::Acquire);
        NonNull::new(ptr).map(|ptr| Handle {
            ptr,
            marker: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Relaxed).is_null()
    }

    /// Plain store. Only correct while no incremental marking is running;
    /// use [`set_with_barrier`](Self::set_with_barrier) otherwise.
    pub fn set(&self, value: Option<Handle<T>>) {
        self.ptr
            .store(value.map_or(null_mut(), |handle| handle.as_ptr()), Ordering::Release);
    }

    pub fn set_with_barrier(&self, heap: &Heap, value: Option<Handle<T>>) {
        self.set(value);
        if let Some(handle) = value {
            heap.write_barrier(handle);
        }
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl<T: GarbageCollected> Default for Member<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: GarbageCollected> Trace for Member<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(handle) = self.get() {
            visitor.visit(handle.trace_descriptor());
        }
    }
}

impl<T: GarbageCollected> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({:p})", self.ptr.load(Ordering::Relaxed))
    }
}

/// Weak reference field. Cleared after a marking phase that did not reach
/// its target.
pub struct WeakMember<T> {
    ptr: AtomicPtr<T>,
}

fn clear_weak_slot<T>(broker: &LivenessBroker<'_>, slot: *const u8) {
    let slot = unsafe { &*(slot as *const AtomicPtr<T>) };
    let ptr = slot.load(Ordering::Acquire);
    if !broker.is_heap_object_alive(ptr as *const u8) {
        slot.store(null_mut(), Ordering::Release);
    }
}

impl<T: GarbageCollected> WeakMember<T> {
    pub fn new(value: Handle<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(value.as_ptr()),
        }
    }

    pub fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(null_mut()),
        }
    }

    pub fn get(&self) -> Option<Handle<T>> {
        NonNull::new(self.ptr.load(Ordering::Acquire)).map(|ptr| Handle {
            ptr,
            marker: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Relaxed).is_null()
    }

    pub fn set(&self, value: Option<Handle<T>>) {
        self.ptr
            .store(value.map_or(null_mut(), |handle| handle.as_ptr()), Ordering::Release);
    }
}

impl<T: GarbageCollected> Default for WeakMember<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: GarbageCollected> Trace for WeakMember<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(handle) = self.get() {
            visitor.visit_weak(
                handle.trace_descriptor(),
                clear_weak_slot::<T>,
                &self.ptr as *const AtomicPtr<T> as *const u8,
            );
        }
    }
}

/// Strong reference to a mixin facet embedded somewhere inside another
/// allocation. Tracing marks the enclosing object.
pub struct MixinMember<M> {
    ptr: AtomicPtr<M>,
}

impl<M: GarbageCollectedMixin> MixinMember<M> {
    /// `facet` must live inside a managed allocation.
    pub fn new(facet: &M) -> Self {
        Self {
            ptr: AtomicPtr::new(facet as *const M as *mut M),
        }
    }

    pub fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(null_mut()),
        }
    }

    pub fn get(&self) -> Option<&M> {
        unsafe { self.ptr.load(Ordering::Acquire).as_ref() }
    }

    pub fn as_ptr(&self) -> *const M {
        self.ptr.load(Ordering::Acquire)
    }

    pub fn set(&self, facet: Option<&M>) {
        self.ptr.store(
            facet.map_or(null_mut(), |facet| facet as *const M as *mut M),
            Ordering::Release,
        );
    }
}

impl<M: GarbageCollectedMixin> Trace for MixinMember<M> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        let ptr = self.ptr.load(Ordering::Acquire);
        if !ptr.is_null() {
            visitor.visit_inner_pointer(ptr as *const u8);
        }
    }
}

/// Weak counterpart of [`MixinMember`].
pub struct WeakMixinMember<M> {
    ptr: AtomicPtr<M>,
}

impl<M: GarbageCollectedMixin> WeakMixinMember<M> {
    pub fn new(facet: &M) -> Self {
        Self {
            ptr: AtomicPtr::new(facet as *const M as *mut M),
        }
    }

    pub fn get(&self) -> Option<&M> {
        unsafe { self.ptr.load(Ordering::Acquire).as_ref() }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Relaxed).is_null()
    }
}

impl<M: GarbageCollectedMixin> Trace for WeakMixinMember<M> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        let ptr = self.ptr.load(Ordering::Acquire);
        if !ptr.is_null() {
            visitor.visit_weak_inner_pointer(
                ptr as *const u8,
                clear_weak_slot::<M>,
                &self.ptr as *const AtomicPtr<M> as *const u8,
            );
        }
    }
}
