use super::{
    extension::ExtensionId,
    object_header::{AccessMode, ObjectHeader},
    page_backend::PageBackend,
};

pub type TraceCallback = fn(*const u8, &mut dyn Visitor);

/// Invoked once after marking with the liveness broker and the parameter it
/// was registered with (usually the address of a weak slot).
pub type WeakCallback = fn(&LivenessBroker<'_>, *const u8);

/// What the marker needs to know about a reference: where the enclosing
/// allocation's payload starts and how to trace it.
#[derive(Clone, Copy, Debug)]
pub struct TraceDescriptor {
    pub base_object_payload: *const u8,
    pub callback: TraceCallback,
}

unsafe impl Send for TraceDescriptor {}
unsafe impl Sync for TraceDescriptor {}

impl TraceDescriptor {
    pub fn new(base_object_payload: *const u8, callback: TraceCallback) -> Self {
        Self {
            base_object_payload,
            callback,
        }
    }

    /// Resolves a pointer anywhere inside a live allocation (a mixin facet, an
    /// interior field or a conservative stack word) to its enclosing object.
    pub fn for_inner_pointer(backend: &PageBackend, ptr: *const u8) -> Option<Self> {
        let header = backend.find_header(ptr as usize)?;
        let header = unsafe { &*header };
        let info = header.gc_info()?;
        Some(Self::new(header.payload(), info.trace))
    }

    pub fn header(&self) -> *mut ObjectHeader {
        ObjectHeader::from_payload(self.base_object_payload)
    }
}

/// Graph walker handed to [`Trace::trace`](super::traits::Trace::trace).
///
/// Strong edges go through [`visit`](Visitor::visit), weak edges through
/// [`visit_weak`](Visitor::visit_weak). Inline (composite) members are traced
/// by calling their own `trace` with the same visitor.
pub trait Visitor {
    fn visit(&mut self, desc: TraceDescriptor);

    fn visit_weak(&mut self, desc: TraceDescriptor, callback: WeakCallback, slot: *const u8);

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8);

    fn page_backend(&self) -> &PageBackend;

    fn visit_external_extension(&mut self, id: ExtensionId) {
        let _ = id;
    }

    fn visit_inner_pointer(&mut self, ptr: *const u8) {
        if let Some(desc) = TraceDescriptor::for_inner_pointer(self.page_backend(), ptr) {
            self.visit(desc);
        }
    }

    fn visit_weak_inner_pointer(&mut self, ptr: *const u8, callback: WeakCallback, slot: *const u8) {
        if let Some(desc) = TraceDescriptor::for_inner_pointer(self.page_backend(), ptr) {
            self.visit_weak(desc, callback, slot);
        }
    }
}

/// Answers "did this object survive marking" for weak callbacks.
pub struct LivenessBroker<'a> {
    backend: &'a PageBackend,
}

impl<'a> LivenessBroker<'a> {
    pub fn new(backend: &'a PageBackend) -> Self {
        Self { backend }
    }

    /// Null and addresses outside the managed heap count as alive.
    pub fn is_heap_object_alive(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return true;
        }
        match self.backend.find_header(ptr as usize) {
            Some(header) => unsafe { (*header).is_marked(AccessMode::Atomic) },
            None => true,
        }
    }
}

/// Heap iteration callback.
pub trait ObjectVisitor {
    fn visit_object(&mut self, header: &ObjectHeader);
}

impl<F: FnMut(&ObjectHeader)> ObjectVisitor for F {
    fn visit_object(&mut self, header: &ObjectHeader) {
        self(header)
    }
}
