use std::{
    mem::{align_of, size_of},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::base::{constants::MAX_ALLOCATION_RETRIES, formatted_size};

use self::{
    allocator::{AllocationError, AllocationResult, ObjectAllocator},
    extension::{BackingStore, ExtensionId, ExtensionTable},
    marker::{Marker, MarkingPool, MarkingSummary},
    member::Handle,
    object_header::{gc_info_of, GcInfo, ObjectHeader},
    options::{EmptyPageHandling, GcConfig, HeapOptions, MarkingType, StackState},
    page_backend::PageBackend,
    persistent::PersistentRoots,
    space::{create_spaces, Space, SpaceIndex, SpaceSelector},
    stats::{HeapStats, SpaceStatistics},
    sweeper::{Sweeper, SweeperState, SweepingQueues},
    traits::{GarbageCollected, GarbageCollectedMixin, Trace},
    visitor::{ObjectVisitor, TraceDescriptor},
};

pub mod allocator;
pub mod extension;
pub mod free_list;
pub mod marker;
pub mod member;
pub mod object_header;
pub mod object_start_bitmap;
pub mod options;
pub mod page;
pub mod page_backend;
pub mod persistent;
pub mod space;
pub mod stats;
pub mod sweeper;
pub mod traits;
pub mod visitor;

/// State reachable from the background sweeper and marking workers.
pub struct HeapShared {
    pub(crate) backend: PageBackend,
    pub(crate) spaces: Vec<Space>,
    pub(crate) sweeping: SweepingQueues,
    pub(crate) extensions: ExtensionTable,
    pub(crate) is_marking: AtomicBool,
    pub(crate) mutator_parked: AtomicBool,
    pub(crate) empty_page_handling: EmptyPageHandling,
}

/// Marks the mutator as parked while it waits for a collection it
/// requested. Unparks on drop.
pub struct ParkedScope<'a> {
    shared: &'a HeapShared,
}

impl<'a> ParkedScope<'a> {
    pub fn new(shared: &'a HeapShared) -> Self {
        let was_parked = shared.mutator_parked.swap(true, Ordering::AcqRel);
        debug_assert!(!was_parked, "mutator parked twice");
        Self { shared }
    }
}

impl Drop for ParkedScope<'_> {
    fn drop(&mut self) {
        self.shared.mutator_parked.store(false, Ordering::Release);
    }
}

/// A managed heap. Owned by its mutator thread; collections run when asked
/// for or when allocation cannot make progress.
pub struct Heap {
    shared: Arc<HeapShared>,
    allocator: ObjectAllocator,
    sweeper: Sweeper,
    marker: Option<Marker>,
    marking_pool: Option<MarkingPool>,
    roots: PersistentRoots,
    options: HeapOptions,
    collections: usize,
    allocated_since_last_gc: usize,
    last_marking: Option<MarkingSummary>,
}

impl Heap {
    pub fn new(options: HeapOptions) -> Self {
        let spaces = create_spaces(&options.custom_spaces);
        let space_count = spaces.len();
        let shared = Arc::new(HeapShared {
            backend: PageBackend::new(options.max_heap_size),
            spaces,
            sweeping: SweepingQueues::new(space_count),
            extensions: ExtensionTable::new(),
            is_marking: AtomicBool::new(false),
            mutator_parked: AtomicBool::new(false),
            empty_page_handling: options.empty_page_handling,
        });

        log::info!(
            target: "gc",
            "heap created: max size {}, {} marking workers, {:?} sweeping, {} custom spaces",
            options
                .max_heap_size
                .map(|size| formatted_size(size).to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
            options.marking_workers,
            options.sweeping_type,
            options.custom_spaces.len()
        );

        Self {
            allocator: ObjectAllocator::new(space_count, options.custom_spaces.len()),
            sweeper: Sweeper::new(),
            marker: None,
            marking_pool: MarkingPool::new(options.marking_workers),
            roots: PersistentRoots::new(),
            shared,
            options,
            collections: 0,
            allocated_since_last_gc: 0,
            last_marking: None,
        }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    /// Allocates `value` on the heap, collecting if needed. Aborts the
    /// process when the heap stays exhausted.
    pub fn allocate<T: GarbageCollected>(&mut self, value: T) -> Handle<T> {
        match self.try_allocate(value) {
            Ok(handle) => handle,
            Err(err @ AllocationError::OutOfMemory { .. }) => self.fatal_out_of_memory(err),
            Err(err) => panic!("cannot allocate {}: {}", std::any::type_name::<T>(), err),
        }
    }

    pub fn try_allocate<T: GarbageCollected>(&mut self, value: T) -> Result<Handle<T>, AllocationError> {
        let payload = self.allocate_with_retry(size_of::<T>().max(1), align_of::<T>(), gc_info_of::<T>(), T::SPACE)?;
        let handle = unsafe {
            payload.cast::<T>().write(value);
            Handle::from_raw(payload.cast::<T>())
        };
        if let Some(marker) = self.marker.as_ref() {
            marker.push_black_allocated(handle.trace_descriptor());
        }
        Ok(handle)
    }

    /// Allocates `size` zeroed payload bytes described by `gc_info`.
    ///
    /// # Safety
    ///
    /// The payload must be initialized into a value `gc_info` can trace
    /// and finalize before the next collection or marking step.
    pub unsafe fn allocate_raw(
        &mut self,
        size: usize,
        alignment: usize,
        gc_info: &'static GcInfo,
        space: SpaceSelector,
    ) -> Result<*mut u8, AllocationError> {
        let payload = self.allocate_with_retry(size, alignment, gc_info, space)?;
        payload.write_bytes(0, size);
        if let Some(marker) = self.marker.as_ref() {
            marker.push_black_allocated(TraceDescriptor::new(payload, gc_info.trace));
        }
        Ok(payload)
    }

    fn allocate_with_retry(
        &mut self,
        size: usize,
        alignment: usize,
        gc_info: &'static GcInfo,
        space: SpaceSelector,
    ) -> Result<*mut u8, AllocationError> {
        let mut attempts = 0;
        loop {
            match self.allocator.allocate(&self.shared, size, alignment, gc_info, space)? {
                AllocationResult::Object(payload) => return Ok(payload),
                AllocationResult::Retry(space) if attempts == MAX_ALLOCATION_RETRIES => {
                    return Err(AllocationError::OutOfMemory { size, space });
                }
                AllocationResult::Retry(space) => {
                    attempts += 1;
                    log::debug!(
                        target: "gc-alloc",
                        "space {} exhausted allocating {}, collecting (attempt {})",
                        space.0,
                        formatted_size(size),
                        attempts
                    );
                    let shared = self.shared.clone();
                    let _parked = ParkedScope::new(&shared);
                    self.collect_garbage(GcConfig::conservative_atomic());
                }
            }
        }
    }

    #[cold]
    fn fatal_out_of_memory(&self, err: AllocationError) -> ! {
        log::error!(
            target: "gc",
            "fatal: {} ({} committed)",
            err,
            formatted_size(self.shared.backend.committed_size())
        );
        eprintln!("fatal: {}", err);
        std::process::abort()
    }

    pub fn add_persistent_root<T: 'static + Trace>(&mut self, root: T) -> u32 {
        self.roots.add(root)
    }

    pub fn remove_persistent_root(&mut self, key: u32) -> Option<Box<dyn Trace>> {
        self.roots.remove(key)
    }

    /// Runs a full atomic collection. `reason` is only logged.
    pub fn force_collection(&mut self, stack_state: StackState, reason: &str) {
        log::info!(target: "gc", "forced collection: {}", reason);
        self.collect_garbage(GcConfig {
            marking_type: MarkingType::Atomic,
            sweeping_type: self.options.sweeping_type,
            stack_state,
        });
    }

    /// Marks and starts sweeping. An incremental marking cycle already in
    /// progress is finished instead of starting a new one.
    pub fn collect_garbage(&mut self, config: GcConfig) {
        if self.marker.is_none() {
            self.finish_sweeping();
            self.allocator.reset_linear_allocation_buffers(&self.shared);
            self.marker = Some(Marker::start(&self.shared, &self.roots, config));
        }
        self.finish_marking(config.stack_state);
    }

    fn finish_marking(&mut self, stack_state: StackState) {
        let marker = match self.marker.take() {
            Some(marker) => marker,
            None => return,
        };
        let sweeping_type = marker.config().sweeping_type;
        let summary = marker.finish(&self.shared, &self.roots, stack_state, self.marking_pool.as_ref());

        self.collections += 1;
        self.allocated_since_last_gc = self.allocator.take_allocated_bytes();
        self.last_marking = Some(summary);

        self.allocator.reset_linear_allocation_buffers(&self.shared);
        self.sweeper.start(&self.shared, sweeping_type);
    }

    pub fn start_incremental_marking(&mut self) {
        if self.marker.is_some() {
            return;
        }
        self.finish_sweeping();
        self.allocator.reset_linear_allocation_buffers(&self.shared);
        let config = GcConfig {
            marking_type: MarkingType::Incremental,
            sweeping_type: self.options.sweeping_type,
            stack_state: StackState::MayContainHeapPointers,
        };
        self.marker = Some(Marker::start(&self.shared, &self.roots, config));
    }

    /// Traces about `budget` bytes. Returns true when the worklist is empty
    /// or no marking is running.
    pub fn incremental_marking_step(&mut self, budget: usize) -> bool {
        match self.marker.as_ref() {
            Some(marker) => marker.advance(&self.shared, budget),
            None => true,
        }
    }

    pub fn finish_incremental_marking(&mut self, stack_state: StackState) {
        self.finish_marking(stack_state);
    }

    pub fn is_marking(&self) -> bool {
        self.marker.is_some()
    }

    /// Must follow every store of a heap reference into a managed object
    /// while incremental marking is running.
    pub fn write_barrier<T: GarbageCollected>(&self, target: Handle<T>) {
        if let Some(marker) = self.marker.as_ref() {
            marker.write_barrier(target.trace_descriptor());
        }
    }

    pub fn sweeper_state(&self) -> SweeperState {
        self.sweeper.state()
    }

    /// Sweeps up to `max_pages` pages on the calling thread. Returns true
    /// once sweeping is complete.
    pub fn sweep_step(&mut self, max_pages: usize) -> bool {
        self.sweeper.sweep_step(&self.shared, max_pages)
    }

    pub fn wait_for_concurrent_sweep(&mut self) {
        self.sweeper.wait_for_concurrent_sweep();
    }

    pub fn finish_sweeping(&mut self) {
        self.sweeper.finish(&self.shared);
    }

    pub fn object_size<T>(&self, handle: Handle<T>) -> usize {
        unsafe { (*handle.header()).object_size() }
    }

    /// Size of the allocation `facet` is embedded in.
    pub fn object_size_of_mixin<M: GarbageCollectedMixin>(&mut self, facet: &M) -> Option<usize> {
        self.sweeper.wait_for_concurrent_sweep();
        let header = self.shared.backend.find_header(facet as *const M as usize)?;
        Some(unsafe { (*header).object_size() })
    }

    /// Visits every allocated object. Finishes sweeping first.
    pub fn for_each_object(&mut self, visitor: &mut dyn ObjectVisitor) {
        self.finish_sweeping();
        self.allocator.reset_linear_allocation_buffers(&self.shared);
        for space in self.shared.spaces.iter() {
            let state = space.lock();
            for page in state.pages.iter() {
                unsafe {
                    if page.is_large() {
                        visitor.visit_object(&*(*page.as_large()).object_header());
                    } else {
                        (*page.as_normal()).for_each_header(|header| {
                            if !(*header).is_free() {
                                visitor.visit_object(&*header);
                            }
                        });
                    }
                }
            }
        }
    }

    pub fn statistics(&self) -> HeapStats {
        let spaces = self
            .shared
            .spaces
            .iter()
            .map(|space| {
                let state = space.lock();
                SpaceStatistics {
                    name: space.name().to_string(),
                    pages: state.pages.len(),
                    free_list_bytes: state.free_list.size(),
                    free_list_entries: state.free_list.entry_count(),
                }
            })
            .collect();
        let sweeping = &self.shared.sweeping;
        HeapStats {
            committed_size: self.shared.backend.committed_size(),
            max_heap_size: self.shared.backend.max_size(),
            collections: self.collections,
            allocated_since_last_gc: self.allocated_since_last_gc,
            marked_bytes: self.last_marking.map_or(0, |summary| summary.marked_bytes),
            last_marking_time: self.last_marking.map(|summary| summary.duration).unwrap_or_default(),
            finalized_objects: sweeping.finalized_objects.load(Ordering::Relaxed),
            released_pages: sweeping.released_pages.load(Ordering::Relaxed),
            extensions: self.shared.extensions.len(),
            extension_bytes: self.shared.extensions.accounted_bytes(),
            spaces,
        }
    }

    pub fn extensions(&self) -> &ExtensionTable {
        &self.shared.extensions
    }

    /// Attaches a native record to `owner`. The owner's trace should report
    /// the id through `Visitor::visit_external_extension`.
    ///
    /// Records created while marking or sweeping is in progress start out
    /// marked, since the owner may already have been traced.
    pub fn register_external_extension<T: GarbageCollected>(
        &self,
        owner: Handle<T>,
        backing_store: Option<Arc<BackingStore>>,
    ) -> ExtensionId {
        let marked = self.is_marking() || self.sweeper.is_running();
        self.shared
            .extensions
            .insert_with_mark(owner.as_ptr() as *const u8, backing_store, marked)
    }

    pub fn page_backend(&self) -> &PageBackend {
        &self.shared.backend
    }

    pub fn space(&self, index: SpaceIndex) -> Option<&Space> {
        self.shared.spaces.get(index.0)
    }

    pub fn reset_linear_allocation_buffers(&mut self) {
        self.allocator.reset_linear_allocation_buffers(&self.shared);
    }

    pub fn is_mutator_parked(&self) -> bool {
        self.shared.mutator_parked.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> &HeapShared {
        &self.shared
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            marker.abort(&self.shared);
        }
        self.finish_sweeping();
        self.allocator.reset_linear_allocation_buffers(&self.shared);

        let mut finalized = 0;
        for space in self.shared.spaces.iter() {
            let state = space.lock();
            for page in state.pages.iter() {
                unsafe {
                    let mut finalize = |header: *mut ObjectHeader| {
                        if !(*header).is_free() && (*header).is_finalizable() {
                            (*header).finalize();
                            finalized += 1;
                        }
                    };
                    if page.is_large() {
                        finalize((*page.as_large()).object_header());
                    } else {
                        (*page.as_normal()).for_each_header(finalize);
                    }
                }
            }
        }
        log::debug!(
            target: "gc",
            "heap destroyed after {} collections, {} objects finalized on teardown",
            self.collections,
            finalized
        );
    }
}
