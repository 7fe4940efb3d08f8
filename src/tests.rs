use std::{
    mem::size_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use memoffset::offset_of;
use once_cell::sync::OnceCell;

use crate::{
    base::constants::{OBJECT_HEADER_SIZE, PAGE_SIZE},
    memory::{
        free_list::FreeListBlock,
        object_header::{gc_info_of, AccessMode, ObjectHeader},
        page::PagePtr,
        space::{RegularSpaceType, SpaceIndex},
    },
    *,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn heap_with(sweeping_type: SweepingType, empty_pages: EmptyPageHandling) -> Heap {
    init_logging();
    Heap::new(
        HeapOptions::default()
            .with_marking_workers(1)
            .with_sweeping_type(sweeping_type)
            .with_empty_page_handling(empty_pages),
    )
}

fn precise(sweeping_type: SweepingType) -> GcConfig {
    GcConfig::precise_atomic().with_sweeping_type(sweeping_type)
}

fn header<T>(handle: Handle<T>) -> &'static ObjectHeader {
    unsafe { &*handle.header() }
}

fn block_of<T>(handle: Handle<T>) -> FreeListBlock {
    FreeListBlock {
        address: handle.header() as usize,
        size: header(handle).allocated_size(),
    }
}

fn space_of<T>() -> SpaceIndex {
    RegularSpaceType::for_size(size_of::<T>() + OBJECT_HEADER_SIZE).index()
}

struct Leaf {
    value: usize,
}

impl Trace for Leaf {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Leaf {}

static NODE_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Node {
    next: Member<Node>,
    value: usize,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.next.trace(visitor);
    }
}

impl GarbageCollected for Node {}

impl Drop for Node {
    fn drop(&mut self) {
        NODE_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_reachable_survive_unreachable_freed() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let leaf = heap.allocate(Leaf { value: 7 });
    let child = heap.allocate(Node {
        next: Member::null(),
        value: 2,
    });
    let root = heap.allocate(Node {
        next: Member::new(child),
        value: 1,
    });
    heap.add_persistent_root(root);
    let before = NODE_DROPS.load(Ordering::Relaxed);

    heap.collect_garbage(precise(SweepingType::Atomic));

    assert_eq!(heap.sweeper_state(), SweeperState::Finished);
    assert_eq!(root.value, 1);
    assert_eq!(root.next.get().map(|node| node.value), Some(2));
    assert!(!header(root).is_marked(AccessMode::NonAtomic));
    assert!(!header(child).is_free());
    assert!(heap.page_backend().find_header(leaf.as_ptr() as usize).is_none());
    assert!(heap
        .space(space_of::<Leaf>())
        .unwrap()
        .lock()
        .free_list
        .contains(FreeListBlock {
            address: leaf.header() as usize,
            size: 16
        }));
    // Nothing of `Node` died.
    assert_eq!(NODE_DROPS.load(Ordering::Relaxed), before);
    assert_eq!(heap.statistics().collections, 1);
}

struct WeakHolder {
    strong: Member<Leaf>,
    first: WeakMember<Leaf>,
    second: WeakMember<Leaf>,
    to_live: WeakMember<Leaf>,
}

impl Trace for WeakHolder {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.strong.trace(visitor);
        self.first.trace(visitor);
        self.second.trace(visitor);
        self.to_live.trace(visitor);
    }
}

impl GarbageCollected for WeakHolder {}

#[test]
fn test_weak_members_cleared() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let live = heap.allocate(Leaf { value: 1 });
    let dead = heap.allocate(Leaf { value: 2 });
    let holder = heap.allocate(WeakHolder {
        strong: Member::new(live),
        first: WeakMember::new(dead),
        second: WeakMember::new(dead),
        to_live: WeakMember::new(live),
    });
    heap.add_persistent_root(holder);

    heap.collect_garbage(precise(SweepingType::Atomic));

    assert!(holder.first.is_null());
    assert!(holder.second.is_null());
    assert!(holder.to_live.get() == Some(live));
    assert_eq!(holder.to_live.get().map(|leaf| leaf.value), Some(1));
}

struct Named {
    name: &'static str,
}

impl Trace for Named {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollectedMixin for Named {}

struct Counted {
    count: u64,
}

impl Trace for Counted {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollectedMixin for Counted {}

static WIDGET_TRACES: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
struct Widget {
    id: u64,
    named: Named,
    counted: Counted,
}

impl Trace for Widget {
    fn trace(&self, visitor: &mut dyn Visitor) {
        WIDGET_TRACES.fetch_add(1, Ordering::Relaxed);
        self.named.trace(visitor);
        self.counted.trace(visitor);
    }
}

impl GarbageCollected for Widget {}

struct FacetHolder {
    named: MixinMember<Named>,
    counted: MixinMember<Counted>,
    weak_named: WeakMixinMember<Named>,
}

impl Trace for FacetHolder {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.named.trace(visitor);
        self.counted.trace(visitor);
        self.weak_named.trace(visitor);
    }
}

impl GarbageCollected for FacetHolder {}

#[test]
fn test_mixin_facets_mark_once() {
    assert!(offset_of!(Widget, named) > 0);
    assert!(offset_of!(Widget, counted) > offset_of!(Widget, named));

    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let widget = heap.allocate(Widget {
        id: 3,
        named: Named { name: "widget" },
        counted: Counted { count: 9 },
    });
    let unreachable = heap.allocate(Widget {
        id: 4,
        named: Named { name: "gone" },
        counted: Counted { count: 0 },
    });
    let holder = heap.allocate(FacetHolder {
        named: MixinMember::new(&widget.named),
        counted: MixinMember::new(&widget.counted),
        weak_named: WeakMixinMember::new(&unreachable.named),
    });
    heap.add_persistent_root(holder);

    let before = WIDGET_TRACES.load(Ordering::Relaxed);
    heap.collect_garbage(precise(SweepingType::Atomic));
    assert_eq!(WIDGET_TRACES.load(Ordering::Relaxed) - before, 1);

    assert_eq!(widget.id, 3);
    assert_eq!(holder.named.get().map(|named| named.name), Some("widget"));
    assert_eq!(holder.counted.get().map(|counted| counted.count), Some(9));
    assert!(holder.weak_named.is_null());
    assert_eq!(heap.object_size_of_mixin(&widget.counted), Some(heap.object_size(widget)));
    assert_eq!(heap.object_size(widget), size_of::<Widget>());
}

static DEFERRED_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Deferred {
    id: usize,
}

impl Trace for Deferred {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Deferred {}

impl Drop for Deferred {
    fn drop(&mut self) {
        DEFERRED_DROPS.fetch_add(self.id.min(1), Ordering::Relaxed);
    }
}

static RETAINED_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Retained {
    id: usize,
}

impl Trace for Retained {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Retained {}

impl Drop for Retained {
    fn drop(&mut self) {
        RETAINED_DROPS.fetch_add(self.id.min(1), Ordering::Relaxed);
    }
}

#[test]
fn test_finalizers_deferred_to_finish() {
    let mut heap = heap_with(SweepingType::IncrementalAndConcurrent, EmptyPageHandling::Release);
    let space = space_of::<Deferred>();
    let objects: Vec<_> = (1..=10).map(|id| heap.allocate(Deferred { id })).collect();
    let addr = objects[0].as_ptr() as usize;

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.wait_for_concurrent_sweep();

    assert_eq!(DEFERRED_DROPS.load(Ordering::Relaxed), 0);
    assert_eq!(heap.space(space).unwrap().page_count(), 0);
    assert!(heap.page_backend().lookup(addr).is_some());
    assert_eq!(heap.shared().sweeping.pending_finalization_pages(), 1);

    heap.finish_sweeping();

    assert_eq!(heap.shared().sweeping.pending_finalization_pages(), 0);
    assert_eq!(DEFERRED_DROPS.load(Ordering::Relaxed), 10);
    // The page held nothing else and is released.
    assert!(heap.page_backend().lookup(addr).is_none());
    assert_eq!(heap.statistics().finalized_objects, 10);
}

#[test]
fn test_finalized_storage_reaches_free_list() {
    let mut heap = heap_with(SweepingType::IncrementalAndConcurrent, EmptyPageHandling::Retain);
    let space = space_of::<Retained>();
    let objects: Vec<_> = (1..=10).map(|id| heap.allocate(Retained { id })).collect();
    let blocks: Vec<_> = objects.iter().map(|object| block_of(*object)).collect();

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.wait_for_concurrent_sweep();
    assert_eq!(RETAINED_DROPS.load(Ordering::Relaxed), 0);
    {
        let state = heap.space(space).unwrap().lock();
        assert!(state.pages.is_empty());
        assert!(blocks.iter().all(|block| !state.free_list.contains(*block)));
    }

    heap.finish_sweeping();

    assert_eq!(RETAINED_DROPS.load(Ordering::Relaxed), 10);
    let state = heap.space(space).unwrap().lock();
    assert_eq!(state.pages.len(), 1);
    assert!(blocks.iter().all(|block| state.free_list.contains(*block)));
}

#[test]
fn test_marked_and_unmarked_share_page() {
    let mut heap = heap_with(SweepingType::IncrementalAndConcurrent, EmptyPageHandling::Release);
    let space = space_of::<Leaf>();
    let a = heap.allocate(Leaf { value: 0 });
    let b = heap.allocate(Leaf { value: 1 });
    let c = heap.allocate(Leaf { value: 2 });
    let d = heap.allocate(Leaf { value: 3 });
    let (block_a, block_c) = (block_of(a), block_of(c));
    assert_eq!(heap.page_backend().lookup(a.as_ptr() as usize), heap.page_backend().lookup(d.as_ptr() as usize));
    heap.add_persistent_root(b);
    heap.add_persistent_root(d);

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.wait_for_concurrent_sweep();

    assert!(header(a).is_free());
    assert!(header(c).is_free());
    assert!(heap.page_backend().find_header(a.as_ptr() as usize).is_none());
    assert!(heap.page_backend().find_header(c.as_ptr() as usize).is_none());
    assert!(!header(b).is_marked(AccessMode::NonAtomic));
    assert!(!header(d).is_marked(AccessMode::NonAtomic));
    assert_eq!((b.value, d.value), (1, 3));
    {
        let state = heap.space(space).unwrap().lock();
        assert!(!state.free_list.contains(block_a));
        assert!(!state.free_list.contains(block_c));
    }

    heap.finish_sweeping();
    let state = heap.space(space).unwrap().lock();
    assert!(state.free_list.contains(block_a));
    assert!(state.free_list.contains(block_c));
    assert_eq!(state.pages.len(), 1);
}

struct Big {
    words: [u64; 9000],
}

impl Trace for Big {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Big {}

#[test]
fn test_large_objects() {
    let mut heap = heap_with(SweepingType::IncrementalAndConcurrent, EmptyPageHandling::Release);
    let large = RegularSpaceType::Large.index();
    let dead = heap.allocate(Big { words: [1; 9000] });
    let live = heap.allocate(Big { words: [2; 9000] });
    assert!(header(live).is_large_object());
    assert_eq!(live.as_ptr() as usize % 16, 0);
    assert_eq!(heap.object_size(live), size_of::<Big>());
    heap.add_persistent_root(live);

    let dead_addr = dead.as_ptr() as usize + 8 * 8000;
    let live_page = PagePtr(heap.page_backend().lookup(live.as_ptr() as usize).unwrap());
    assert_eq!(heap.space(large).unwrap().page_count(), 2);

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.wait_for_concurrent_sweep();

    assert!(heap.page_backend().lookup(dead_addr).is_none());
    assert!(heap.space(large).unwrap().contains_page(live_page));
    assert!(!header(live).is_marked(AccessMode::NonAtomic));
    assert_eq!(live.words[8999], 2);

    heap.finish_sweeping();
    assert_eq!(heap.space(large).unwrap().page_count(), 1);
}

struct StringSpace;

impl CustomSpace for StringSpace {
    const SPACE_INDEX: usize = 0;
}

struct BaseString {
    len: usize,
}

impl Trace for BaseString {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for BaseString {
    const SPACE: SpaceSelector = custom_space::<StringSpace>();
}

struct ShortString {
    base: BaseString,
    bytes: [u8; 8],
}

impl Trace for ShortString {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.base.trace(visitor);
    }
}

impl GarbageCollected for ShortString {
    const SPACE: SpaceSelector = <BaseString as GarbageCollected>::SPACE;
}

struct Misplaced;

impl Trace for Misplaced {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Misplaced {
    const SPACE: SpaceSelector = SpaceSelector::Custom(3);
}

#[test]
fn test_custom_space_routing() {
    init_logging();
    let mut heap = Heap::new(
        HeapOptions::default()
            .with_marking_workers(1)
            .with_custom_space(CustomSpaceConfig::new("strings")),
    );
    let custom = SpaceIndex(5);
    assert_eq!(heap.space(custom).map(|space| space.name()), Some("strings"));

    let space_of_ptr = |heap: &Heap, ptr: usize| unsafe { (*heap.page_backend().lookup(ptr).unwrap()).space() };

    let base = heap.allocate(BaseString { len: 1 });
    let short = heap.allocate(ShortString {
        base: BaseString { len: 2 },
        bytes: *b"abcdefgh",
    });
    heap.add_persistent_root(base);
    heap.add_persistent_root(short);
    assert_eq!(space_of_ptr(&heap, base.as_ptr() as usize), custom);
    assert_eq!(space_of_ptr(&heap, short.as_ptr() as usize), custom);

    heap.collect_garbage(precise(SweepingType::Atomic));

    let again = heap.allocate(ShortString {
        base: BaseString { len: 3 },
        bytes: [0; 8],
    });
    assert_eq!(space_of_ptr(&heap, again.as_ptr() as usize), custom);
    assert_eq!((base.len, short.base.len, short.bytes[7]), (1, 2, b'h'));

    assert_eq!(heap.try_allocate(Misplaced).err(), Some(AllocationError::UnknownCustomSpace(3)));
}

#[test]
fn test_out_of_memory_after_retries() {
    init_logging();
    let mut heap = Heap::new(
        HeapOptions::default()
            .with_marking_workers(1)
            .with_sweeping_type(SweepingType::Atomic)
            .with_max_heap_size(4 * PAGE_SIZE),
    );

    let mut allocated = 0;
    let err = loop {
        match heap.try_allocate(Big { words: [0; 9000] }) {
            Ok(big) => {
                heap.add_persistent_root(big);
                allocated += 1;
            }
            Err(err) => break err,
        }
        assert!(allocated < 100, "heap limit ignored");
    };

    assert!(allocated > 0);
    assert!(matches!(err, AllocationError::OutOfMemory { .. }));
    assert!(!heap.is_mutator_parked());
    assert_eq!(heap.statistics().collections, crate::base::constants::MAX_ALLOCATION_RETRIES);
    assert!(heap.statistics().committed_size <= 4 * PAGE_SIZE);
}

#[test]
fn test_allocation_errors() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Release);
    let info = gc_info_of::<Leaf>();
    unsafe {
        assert_eq!(
            heap.allocate_raw(0, 8, info, SpaceSelector::Regular).err(),
            Some(AllocationError::ZeroSize)
        );
        assert_eq!(
            heap.allocate_raw(16, 32, info, SpaceSelector::Regular).err(),
            Some(AllocationError::UnsupportedAlignment(32))
        );
        assert_eq!(
            heap.allocate_raw(16, 12, info, SpaceSelector::Regular).err(),
            Some(AllocationError::UnsupportedAlignment(12))
        );
        assert_eq!(
            heap.allocate_raw(16, 8, info, SpaceSelector::Custom(0)).err(),
            Some(AllocationError::UnknownCustomSpace(0))
        );
        let raw = heap.allocate_raw(8, 8, info, SpaceSelector::Regular).unwrap();
        assert_eq!(*(raw as *const usize), 0);
    }
    assert_eq!(heap.statistics().committed_size, PAGE_SIZE);
}

#[repr(align(16))]
struct Aligned {
    value: u64,
}

impl Trace for Aligned {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for Aligned {}

#[test]
fn test_sixteen_byte_alignment() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Release);
    for i in 0..64 {
        let leaf = heap.allocate(Leaf { value: i });
        let aligned = heap.allocate(Aligned { value: i as u64 });
        assert_eq!(aligned.as_ptr() as usize % 16, 0);
        assert_eq!((leaf.value, aligned.value), (i, i as u64));
    }
    let mut objects = 0;
    heap.for_each_object(&mut |_: &ObjectHeader| objects += 1);
    assert_eq!(objects, 128);
}

static BARRIER_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Slot {
    target: Member<Slot>,
    id: usize,
}

impl Trace for Slot {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.target.trace(visitor);
    }
}

impl GarbageCollected for Slot {}

impl Drop for Slot {
    fn drop(&mut self) {
        BARRIER_DROPS.fetch_add(self.id.min(1), Ordering::Relaxed);
    }
}

#[test]
fn test_incremental_marking_barrier_and_black_allocation() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let holder = heap.allocate(Slot {
        target: Member::null(),
        id: 0,
    });
    let stored_later = heap.allocate(Slot {
        target: Member::null(),
        id: 1,
    });
    let referenced_by_new = heap.allocate(Slot {
        target: Member::null(),
        id: 1,
    });
    heap.add_persistent_root(holder);

    heap.start_incremental_marking();
    assert!(heap.is_marking());
    assert!(heap.incremental_marking_step(usize::MAX));
    assert!(header(holder).is_marked(AccessMode::Atomic));

    holder.target.set_with_barrier(&heap, Some(stored_later));
    let black = heap.allocate(Slot {
        target: Member::new(referenced_by_new),
        id: 1,
    });
    assert!(header(black).is_marked(AccessMode::Atomic));

    heap.finish_incremental_marking(StackState::NoHeapPointers);
    assert!(!heap.is_marking());

    assert_eq!(BARRIER_DROPS.load(Ordering::Relaxed), 0);
    assert!(!header(stored_later).is_free());
    assert!(!header(referenced_by_new).is_free());
    assert!(holder.target.get() == Some(stored_later));

    // Next cycle: only `holder -> stored_later` is reachable.
    heap.collect_garbage(precise(SweepingType::Atomic));
    assert_eq!(BARRIER_DROPS.load(Ordering::Relaxed), 2);
}

static LIST_DROPS: AtomicUsize = AtomicUsize::new(0);

struct ListNode {
    next: Member<ListNode>,
    children: Vec<Member<ListNode>>,
    tracked: bool,
}

impl Trace for ListNode {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.next.trace(visitor);
        self.children.trace(visitor);
    }
}

impl GarbageCollected for ListNode {}

impl Drop for ListNode {
    fn drop(&mut self) {
        if self.tracked {
            LIST_DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build_list(heap: &mut Heap, length: usize, tracked: bool) -> Handle<ListNode> {
    let mut head = heap.allocate(ListNode {
        next: Member::null(),
        children: Vec::new(),
        tracked,
    });
    for i in 1..length {
        let children = if i % 100 == 0 {
            (0..8)
                .map(|_| {
                    Member::new(heap.allocate(ListNode {
                        next: Member::null(),
                        children: Vec::new(),
                        tracked,
                    }))
                })
                .collect()
        } else {
            Vec::new()
        };
        head = heap.allocate(ListNode {
            next: Member::new(head),
            children,
            tracked,
        });
    }
    head
}

#[test]
fn test_parallel_marking() {
    init_logging();
    let mut heap = Heap::new(
        HeapOptions::default()
            .with_marking_workers(4)
            .with_sweeping_type(SweepingType::IncrementalAndConcurrent),
    );
    let live = build_list(&mut heap, 20_000, false);
    heap.add_persistent_root(live);
    build_list(&mut heap, 5_000, true);

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.finish_sweeping();

    assert_eq!(LIST_DROPS.load(Ordering::Relaxed), 5_000 + 49 * 8);
    let mut length = 0;
    let mut current = Some(live);
    while let Some(node) = current {
        length += 1;
        current = node.next.get();
    }
    assert_eq!(length, 20_000);
    let stats = heap.statistics();
    assert!(stats.marked_bytes >= (20_000 + 199 * 8) * size_of::<ListNode>());
    assert!(stats.to_string().contains("collections: 1"));
}

#[test]
fn test_incremental_and_lazy_sweeping() {
    let mut heap = heap_with(SweepingType::Incremental, EmptyPageHandling::Release);
    for i in 0..20_000 {
        heap.allocate(Leaf { value: i });
    }
    let committed = heap.statistics().committed_size;

    heap.collect_garbage(precise(SweepingType::Incremental));
    assert_eq!(heap.sweeper_state(), SweeperState::Running(SweepingType::Incremental));

    // Allocation sweeps pages on demand instead of mapping new ones.
    for i in 0..1_000 {
        heap.allocate(Leaf { value: i });
    }
    assert_eq!(heap.statistics().committed_size, committed);

    while !heap.sweep_step(1) {}
    assert_eq!(heap.sweeper_state(), SweeperState::Finished);
}

#[test]
fn test_conservative_stack_scan() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    // Only the stack slot refers to the leaf.
    let slot = [heap.allocate(Leaf { value: 42 })];
    std::hint::black_box(&slot);

    heap.collect_garbage(GcConfig::conservative_atomic());

    assert!(!header(slot[0]).is_free());
    assert_eq!(slot[0].value, 42);
}

struct Buffer {
    extension: OnceCell<ExtensionId>,
}

impl Trace for Buffer {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(id) = self.extension.get() {
            visitor.visit_external_extension(*id);
        }
    }
}

impl GarbageCollected for Buffer {}

#[test]
fn test_external_extensions_follow_owners() {
    let mut heap = heap_with(SweepingType::IncrementalAndConcurrent, EmptyPageHandling::Release);
    let store = Arc::new(BackingStore::new(4096));
    let live = heap.allocate(Buffer {
        extension: OnceCell::new(),
    });
    let dead = heap.allocate(Buffer {
        extension: OnceCell::new(),
    });
    let live_id = heap.register_external_extension(live, Some(store.clone()));
    let dead_id = heap.register_external_extension(dead, Some(Arc::new(BackingStore::new(1024))));
    let _ = live.extension.set(live_id);
    let _ = dead.extension.set(dead_id);
    heap.add_persistent_root(live);
    assert_eq!(heap.statistics().extension_bytes, 5120);

    heap.collect_garbage(precise(SweepingType::IncrementalAndConcurrent));
    heap.finish_sweeping();

    let extensions = heap.extensions();
    assert!(extensions.contains(live_id));
    assert!(!extensions.contains(dead_id));
    assert!(!extensions.is_marked(live_id));
    assert_eq!(extensions.owner(live_id), Some(live.as_ptr() as *const u8));
    assert_eq!(extensions.old_len(), 1);
    assert_eq!(Arc::strong_count(&store), 2);
    assert_eq!(heap.statistics().extension_bytes, 4096);
}

#[test]
fn test_extension_registered_while_sweeping() {
    let mut heap = heap_with(SweepingType::Incremental, EmptyPageHandling::Release);
    let owner = heap.allocate(Buffer {
        extension: OnceCell::new(),
    });
    let root = heap.add_persistent_root(owner);

    heap.collect_garbage(precise(SweepingType::Incremental));
    assert_eq!(heap.sweeper_state(), SweeperState::Running(SweepingType::Incremental));
    let id = heap.register_external_extension(owner, Some(Arc::new(BackingStore::new(256))));
    let _ = owner.extension.set(id);

    heap.finish_sweeping();
    assert!(heap.extensions().contains(id));

    // Later cycles track the owner as usual.
    heap.collect_garbage(precise(SweepingType::Incremental));
    heap.finish_sweeping();
    assert!(heap.extensions().contains(id));

    heap.remove_persistent_root(root);
    heap.collect_garbage(precise(SweepingType::Incremental));
    heap.finish_sweeping();
    assert!(!heap.extensions().contains(id));
    assert_eq!(heap.statistics().extension_bytes, 0);
}

#[test]
fn test_extension_registered_during_incremental_marking() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Release);
    let owner = heap.allocate(Buffer {
        extension: OnceCell::new(),
    });
    heap.add_persistent_root(owner);

    heap.start_incremental_marking();
    assert!(heap.incremental_marking_step(usize::MAX));
    assert!(header(owner).is_marked(AccessMode::Atomic));

    let id = heap.register_external_extension(owner, Some(Arc::new(BackingStore::new(64))));
    let _ = owner.extension.set(id);
    heap.finish_incremental_marking(StackState::NoHeapPointers);

    assert_eq!(heap.sweeper_state(), SweeperState::Finished);
    assert!(heap.extensions().contains(id));
    assert!(!heap.extensions().is_marked(id));
    assert_eq!(heap.statistics().extension_bytes, 64);
}

static RAW_TARGET_DROPS: AtomicUsize = AtomicUsize::new(0);

struct RawTarget;

impl Trace for RawTarget {
    fn trace(&self, _: &mut dyn Visitor) {}
}

impl GarbageCollected for RawTarget {}

impl Drop for RawTarget {
    fn drop(&mut self) {
        RAW_TARGET_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

struct RawHolder {
    target: Member<RawTarget>,
}

impl Trace for RawHolder {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.target.trace(visitor);
    }
}

impl GarbageCollected for RawHolder {}

#[test]
fn test_raw_allocation_during_incremental_marking() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let target = heap.allocate(RawTarget);

    heap.start_incremental_marking();
    assert!(heap.incremental_marking_step(usize::MAX));

    let holder = unsafe {
        let payload = heap
            .allocate_raw(
                size_of::<RawHolder>(),
                std::mem::align_of::<RawHolder>(),
                gc_info_of::<RawHolder>(),
                RawHolder::SPACE,
            )
            .unwrap();
        payload.cast::<RawHolder>().write(RawHolder {
            target: Member::new(target),
        });
        Handle::from_raw(payload.cast::<RawHolder>())
    };
    assert!(header(holder).is_marked(AccessMode::Atomic));
    heap.add_persistent_root(holder);

    heap.finish_incremental_marking(StackState::NoHeapPointers);

    assert_eq!(RAW_TARGET_DROPS.load(Ordering::Relaxed), 0);
    assert!(!header(target).is_free());
    assert!(holder.target.get() == Some(target));
}

#[test]
fn test_force_collection_stack_states() {
    let mut heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Retain);
    let slot = [heap.allocate(Leaf { value: 9 })];
    std::hint::black_box(&slot);
    let addr = slot[0].as_ptr() as usize;

    heap.force_collection(StackState::MayContainHeapPointers, "stack scanned");
    assert_eq!(heap.statistics().collections, 1);
    assert!(heap.page_backend().find_header(addr).is_some());
    assert_eq!(slot[0].value, 9);

    heap.force_collection(StackState::NoHeapPointers, "stack ignored");
    assert_eq!(heap.statistics().collections, 2);
    assert!(heap.page_backend().find_header(addr).is_none());
}

#[test]
fn test_parked_scope() {
    let heap = heap_with(SweepingType::Atomic, EmptyPageHandling::Release);
    {
        let _parked = ParkedScope::new(heap.shared());
        assert!(heap.is_mutator_parked());
    }
    assert!(!heap.is_mutator_parked());
}
