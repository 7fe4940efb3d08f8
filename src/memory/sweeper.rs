use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::base::formatted_size;

use super::{
    free_list::{FreeList, FreeListBlock},
    object_header::{AccessMode, ObjectHeader},
    options::{EmptyPageHandling, SweepingType},
    page::PagePtr,
    space::SpaceIndex,
    HeapShared,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweeperState {
    Idle,
    Running(SweepingType),
    Finished,
}

/// Result of sweeping one page off the mutator. Applied to the page's
/// space by [`finalize_swept_page`].
pub(crate) struct SweptPageState {
    page: PagePtr,
    cached_free_list: FreeList,
    unfinalized_objects: Vec<usize>,
    is_empty: bool,
    largest_new_free_list_entry: usize,
}

/// Page queues shared between the mutator and the background sweeper.
pub(crate) struct SweepingQueues {
    unswept: Vec<Mutex<Vec<PagePtr>>>,
    swept: Mutex<Vec<SweptPageState>>,
    cancelled: AtomicBool,
    extensions_swept: AtomicBool,
    pub(crate) finalized_objects: AtomicUsize,
    pub(crate) released_pages: AtomicUsize,
    pub(crate) live_bytes: AtomicUsize,
}

impl SweepingQueues {
    pub(crate) fn new(space_count: usize) -> Self {
        Self {
            unswept: (0..space_count).map(|_| Mutex::new(Vec::new())).collect(),
            swept: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            extensions_swept: AtomicBool::new(false),
            finalized_objects: AtomicUsize::new(0),
            released_pages: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    fn pop_unswept(&self, space: usize) -> Option<PagePtr> {
        self.unswept[space].lock().pop()
    }

    pub(crate) fn unswept_pages(&self) -> usize {
        self.unswept.iter().map(|pages| pages.lock().len()).sum()
    }

    pub(crate) fn pending_finalization_pages(&self) -> usize {
        self.swept.lock().len()
    }
}

fn add_gap(free_list: &mut FreeList, largest: &mut usize, start: usize, end: usize) {
    if start == end {
        return;
    }
    unsafe {
        free_list.add(FreeListBlock {
            address: start,
            size: end - start,
        });
    }
    *largest = (*largest).max(end - start);
}

/// Scans a normal page left to right. Dead storage is coalesced into
/// `cached_free_list`; live objects are unmarked. Dead finalizable objects
/// are either finalized on the spot or left intact for later.
unsafe fn sweep_normal_page(shared: &HeapShared, page: PagePtr, finalize_inline: bool) -> SweptPageState {
    let normal = &mut *page.as_normal();
    let mut cached_free_list = FreeList::new();
    let mut unfinalized_objects = Vec::new();
    let mut largest = 0;
    let mut live = 0;
    let mut finalized = 0;

    let end = normal.payload_end();
    let mut begin = normal.payload_start();
    let mut start_of_gap = begin;
    normal.bitmap.clear();

    while begin != end {
        let header = begin as *mut ObjectHeader;
        let size = (*header).allocated_size();
        debug_assert!(size != 0, "corrupt header at {:x}", begin);

        if (*header).is_free() {
            begin += size;
            continue;
        }

        if !(*header).is_marked(AccessMode::NonAtomic) {
            if (*header).is_finalizable() {
                if finalize_inline {
                    (*header).finalize();
                    finalized += 1;
                } else {
                    add_gap(&mut cached_free_list, &mut largest, start_of_gap, begin);
                    normal.bitmap.set_bit(begin);
                    unfinalized_objects.push(begin);
                    begin += size;
                    start_of_gap = begin;
                    continue;
                }
            }
            begin += size;
            continue;
        }

        add_gap(&mut cached_free_list, &mut largest, start_of_gap, begin);
        (*header).unmark(AccessMode::NonAtomic);
        normal.bitmap.set_bit(begin);
        live += size;
        begin += size;
        start_of_gap = begin;
    }
    add_gap(&mut cached_free_list, &mut largest, start_of_gap, end);

    shared.sweeping.finalized_objects.fetch_add(finalized, Ordering::Relaxed);
    shared.sweeping.live_bytes.fetch_add(live, Ordering::Relaxed);
    log::trace!(
        target: "gc-sweeper",
        "swept page {:p} of space {}: live {}, largest free {}, {} deferred",
        page.0,
        normal.space().0,
        formatted_size(live),
        formatted_size(largest),
        unfinalized_objects.len()
    );

    SweptPageState {
        page,
        cached_free_list,
        unfinalized_objects,
        is_empty: live == 0,
        largest_new_free_list_entry: largest,
    }
}

/// Large pages are never queued for finalization unless their object is
/// dead and has a finalizer that cannot run here.
unsafe fn sweep_large_page(shared: &HeapShared, page: PagePtr, finalize_inline: bool) -> Option<SweptPageState> {
    let large = &*page.as_large();
    let header = &*large.object_header();

    if header.is_marked(AccessMode::NonAtomic) {
        header.unmark(AccessMode::NonAtomic);
        shared.sweeping.live_bytes.fetch_add(large.object_size(), Ordering::Relaxed);
        shared.spaces[large.space().0].add_page(page);
        return None;
    }

    if header.is_finalizable() {
        if !finalize_inline {
            return Some(SweptPageState {
                page,
                cached_free_list: FreeList::new(),
                unfinalized_objects: vec![header as *const ObjectHeader as usize],
                is_empty: true,
                largest_new_free_list_entry: 0,
            });
        }
        header.finalize();
        shared.sweeping.finalized_objects.fetch_add(1, Ordering::Relaxed);
    }

    log::trace!(target: "gc-sweeper", "releasing large page {:p} ({})", page.0, formatted_size(large.payload_size()));
    shared.backend.free_page(page.0);
    shared.sweeping.released_pages.fetch_add(1, Ordering::Relaxed);
    None
}

unsafe fn sweep_page(shared: &HeapShared, page: PagePtr, finalize_inline: bool) -> Option<SweptPageState> {
    if page.is_large() {
        sweep_large_page(shared, page, finalize_inline)
    } else {
        Some(sweep_normal_page(shared, page, finalize_inline))
    }
}

/// Runs deferred finalizers and hands the page's storage back to its space.
/// Mutator only.
unsafe fn finalize_swept_page(shared: &HeapShared, mut state: SweptPageState, empty_pages: EmptyPageHandling) {
    for &header in state.unfinalized_objects.iter() {
        (*(header as *const ObjectHeader)).finalize();
    }
    shared
        .sweeping
        .finalized_objects
        .fetch_add(state.unfinalized_objects.len(), Ordering::Relaxed);

    let page = state.page;
    if page.is_large() || (state.is_empty && empty_pages == EmptyPageHandling::Release) {
        log::trace!(target: "gc-sweeper", "releasing empty page {:p}", page.0);
        shared.backend.free_page(page.0);
        shared.sweeping.released_pages.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let space = &shared.spaces[(*page.0).space().0];
    let mut space_state = space.lock();
    space_state.free_list.append(&mut state.cached_free_list);
    for &header in state.unfinalized_objects.iter() {
        let size = (*(header as *const ObjectHeader)).allocated_size();
        space_state.free_list.add(FreeListBlock { address: header, size });
    }
    space_state.pages.push(page);
}

fn sweep_page_on_mutator(shared: &HeapShared, page: PagePtr) {
    unsafe {
        if let Some(state) = sweep_page(shared, page, true) {
            finalize_swept_page(shared, state, shared.empty_page_handling);
        }
    }
}

/// Lazily sweeps unswept pages of `space` until one of them yields a free
/// block of at least `size` bytes. Empty pages are kept for the allocator.
pub(crate) fn sweep_for_allocation(shared: &HeapShared, space: SpaceIndex, size: usize) -> bool {
    while let Some(page) = shared.sweeping.pop_unswept(space.0) {
        unsafe {
            let state = match sweep_page(shared, page, true) {
                Some(state) => state,
                None => continue,
            };
            let largest = state.largest_new_free_list_entry;
            finalize_swept_page(shared, state, EmptyPageHandling::Retain);
            if largest >= size {
                return true;
            }
        }
    }
    false
}

fn sweep_in_background(shared: Arc<HeapShared>) {
    let mut pages = 0;
    'spaces: for space in 0..shared.spaces.len() {
        loop {
            if shared.sweeping.cancelled.load(Ordering::Relaxed) {
                break 'spaces;
            }
            let page = match shared.sweeping.pop_unswept(space) {
                Some(page) => page,
                None => break,
            };
            if let Some(state) = unsafe { sweep_page(&shared, page, false) } {
                shared.sweeping.swept.lock().push(state);
            }
            pages += 1;
        }
    }

    if !shared.sweeping.cancelled.load(Ordering::Relaxed)
        && !shared.sweeping.extensions_swept.swap(true, Ordering::AcqRel)
    {
        shared.extensions.sweep_full();
    }
    log::debug!(target: "gc-sweeper", "background sweeper done after {} pages", pages);
}

/// Mutator-side driver of the sweeping state machine.
pub struct Sweeper {
    state: SweeperState,
    job: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self {
            state: SweeperState::Idle,
            job: None,
        }
    }

    pub fn state(&self) -> SweeperState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SweeperState::Running(_))
    }

    /// Moves every page into the unswept queues. All LABs must be closed.
    pub(crate) fn start(&mut self, shared: &Arc<HeapShared>, sweeping_type: SweepingType) {
        debug_assert!(!self.is_running(), "sweeper already running");
        let queues = &shared.sweeping;
        queues.cancelled.store(false, Ordering::Relaxed);
        queues.extensions_swept.store(false, Ordering::Relaxed);
        queues.finalized_objects.store(0, Ordering::Relaxed);
        queues.released_pages.store(0, Ordering::Relaxed);
        queues.live_bytes.store(0, Ordering::Relaxed);

        let mut pages = 0;
        for space in shared.spaces.iter() {
            let mut state = space.lock();
            state.free_list.clear();
            pages += state.pages.len();
            queues.unswept[space.index().0].lock().append(&mut state.pages);
        }
        log::debug!(target: "gc-sweeper", "start sweeping {} pages ({:?})", pages, sweeping_type);
        self.state = SweeperState::Running(sweeping_type);

        match sweeping_type {
            SweepingType::Atomic => self.finish(shared),
            SweepingType::Incremental => {}
            SweepingType::IncrementalAndConcurrent => {
                let shared = shared.clone();
                match std::thread::Builder::new()
                    .name("gc-sweeper".to_string())
                    .spawn(move || sweep_in_background(shared))
                {
                    Ok(job) => self.job = Some(job),
                    Err(err) => {
                        log::warn!(target: "gc-sweeper", "cannot spawn sweeper thread, sweeping incrementally: {}", err);
                    }
                }
            }
        }
    }

    /// Sweeps up to `max_pages` pages on the mutator. Returns true once
    /// sweeping has finished.
    pub(crate) fn sweep_step(&mut self, shared: &HeapShared, max_pages: usize) -> bool {
        if !self.is_running() {
            return true;
        }
        let mut swept = 0;
        for space in 0..shared.spaces.len() {
            while swept < max_pages {
                match shared.sweeping.pop_unswept(space) {
                    Some(page) => sweep_page_on_mutator(shared, page),
                    None => break,
                }
                swept += 1;
            }
        }
        if shared.sweeping.unswept_pages() == 0 {
            self.finish(shared);
            return true;
        }
        false
    }

    /// Joins the background job without cancelling it. Deferred
    /// finalizers stay pending until [`finish`](Self::finish).
    pub fn wait_for_concurrent_sweep(&mut self) {
        if let Some(job) = self.job.take() {
            if let Err(err) = job.join() {
                std::panic::resume_unwind(err);
            }
        }
    }

    pub(crate) fn finish(&mut self, shared: &HeapShared) {
        if !self.is_running() {
            return;
        }
        shared.sweeping.cancelled.store(true, Ordering::Relaxed);
        self.wait_for_concurrent_sweep();

        for space in 0..shared.spaces.len() {
            while let Some(page) = shared.sweeping.pop_unswept(space) {
                sweep_page_on_mutator(shared, page);
            }
        }

        let swept = std::mem::take(&mut *shared.sweeping.swept.lock());
        for state in swept {
            unsafe { finalize_swept_page(shared, state, shared.empty_page_handling) };
        }

        if !shared.sweeping.extensions_swept.swap(true, Ordering::AcqRel) {
            shared.extensions.sweep_full();
        }

        self.state = SweeperState::Finished;
        log::debug!(
            target: "gc-sweeper",
            "sweeping finished: {} live, {} finalized, {} pages released",
            formatted_size(shared.sweeping.live_bytes.load(Ordering::Relaxed)),
            shared.sweeping.finalized_objects.load(Ordering::Relaxed),
            shared.sweeping.released_pages.load(Ordering::Relaxed)
        );
    }
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}
