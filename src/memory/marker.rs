use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_queue::SegQueue;
use rand::{distributions::Uniform, prelude::Distribution, thread_rng};

use crate::base::{formatted_size, stack::{scan_current_stack, StackBounds}};

use super::{
    extension::ExtensionId,
    options::{GcConfig, MarkingType, StackState},
    page_backend::PageBackend,
    traits::Trace,
    visitor::{LivenessBroker, TraceDescriptor, Visitor, WeakCallback},
    HeapShared,
};

pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // Someone still had work; keep going.
                Ok(_) => return false,
                Err(prev_nworkers) => nworkers = prev_nworkers,
            }
        }
    }
}

/// Helper threads for atomic marking. The mutator is always worker 0.
pub struct MarkingPool {
    pool: scoped_thread_pool::Pool,
    threads: usize,
}

impl MarkingPool {
    /// `None` when marking should stay on the mutator.
    pub fn new(marking_workers: usize) -> Option<Self> {
        let threads = marking_workers.saturating_sub(1);
        if threads == 0 {
            return None;
        }
        Some(Self {
            pool: scoped_thread_pool::Pool::new(threads),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

struct WeakCallbackItem {
    callback: WeakCallback,
    parameter: *const u8,
}

unsafe impl Send for WeakCallbackItem {}

/// Marking state that outlives a single step or worker.
pub(crate) struct MarkingWorklists {
    injector: Injector<TraceDescriptor>,
    weak_callbacks: SegQueue<WeakCallbackItem>,
    marked_bytes: AtomicUsize,
}

impl MarkingWorklists {
    fn new() -> Self {
        Self {
            injector: Injector::new(),
            weak_callbacks: SegQueue::new(),
            marked_bytes: AtomicUsize::new(0),
        }
    }
}

const SEGMENT_SIZE: usize = 64;

pub struct MarkingTask<'a> {
    task_id: usize,
    local: Vec<TraceDescriptor>,
    worker: Worker<TraceDescriptor>,
    stealers: &'a [Stealer<TraceDescriptor>],
    worklists: &'a MarkingWorklists,
    terminator: &'a Terminator,
    shared: &'a HeapShared,
    pushed: usize,
    marked_bytes: usize,
}

impl<'a> MarkingTask<'a> {
    fn new(
        task_id: usize,
        worker: Worker<TraceDescriptor>,
        stealers: &'a [Stealer<TraceDescriptor>],
        worklists: &'a MarkingWorklists,
        terminator: &'a Terminator,
        shared: &'a HeapShared,
    ) -> Self {
        Self {
            task_id,
            local: Vec::with_capacity(SEGMENT_SIZE),
            worker,
            stealers,
            worklists,
            terminator,
            shared,
            pushed: 0,
            marked_bytes: 0,
        }
    }

    fn pop(&mut self) -> Option<TraceDescriptor> {
        self.local
            .pop()
            .or_else(|| self.worker.pop())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_global(&self) -> Option<TraceDescriptor> {
        loop {
            match self.worklists.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn steal(&self) -> Option<TraceDescriptor> {
        if self.stealers.len() <= 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;

            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(desc) => return Some(desc),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Every so often half of the local segment is published so that idle
    /// workers have something to steal.
    fn defensive_push(&mut self) {
        self.pushed += 1;

        if self.pushed > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;

                while self.local.len() > target_len {
                    if let Some(desc) = self.local.pop() {
                        self.worklists.injector.push(desc);
                    }
                }
            }

            self.pushed = 0;
        }
    }

    fn push(&mut self, desc: TraceDescriptor) {
        if self.local.len() < SEGMENT_SIZE {
            self.local.push(desc);
            self.defensive_push();
        } else {
            self.worker.push(desc);
        }
    }

    fn process(&mut self, desc: TraceDescriptor) {
        (desc.callback)(desc.base_object_payload, self);
        self.marked_bytes += unsafe { (*desc.header()).allocated_size() };
    }

    fn run(&mut self) {
        loop {
            let desc = if let Some(desc) = self.pop() {
                desc
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            self.process(desc);
        }
    }

    /// Processes objects until roughly `budget` bytes were traced. Returns
    /// true when the worklist ran dry.
    fn run_with_budget(&mut self, budget: usize) -> bool {
        let start = self.marked_bytes;
        while self.marked_bytes - start < budget {
            match self.pop() {
                Some(desc) => self.process(desc),
                None => return true,
            }
        }
        false
    }

    fn visit_conservatively(&mut self, word: usize) {
        if let Some(desc) = TraceDescriptor::for_inner_pointer(&self.shared.backend, word as *const u8) {
            self.visit(desc);
        }
    }

    /// Hands leftover work back to the injector.
    fn publish(mut self) {
        while let Some(desc) = self.local.pop() {
            self.worklists.injector.push(desc);
        }
        while let Some(desc) = self.worker.pop() {
            self.worklists.injector.push(desc);
        }
        self.worklists
            .marked_bytes
            .fetch_add(self.marked_bytes, Ordering::Relaxed);
    }
}

impl<'a> Visitor for MarkingTask<'a> {
    fn visit(&mut self, desc: TraceDescriptor) {
        if unsafe { (*desc.header()).try_mark_atomic() } {
            self.push(desc);
        }
    }

    fn visit_weak(&mut self, _desc: TraceDescriptor, callback: WeakCallback, slot: *const u8) {
        self.register_weak_callback(callback, slot);
    }

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8) {
        self.worklists
            .weak_callbacks
            .push(WeakCallbackItem { callback, parameter });
    }

    fn page_backend(&self) -> &PageBackend {
        &self.shared.backend
    }

    fn visit_external_extension(&mut self, id: ExtensionId) {
        self.shared.extensions.mark(id);
    }
}

/// One marking cycle, from `start` to `finish`.
pub struct Marker {
    config: GcConfig,
    worklists: MarkingWorklists,
    started: Instant,
}

impl Marker {
    /// Publishes the marking flag and traces the persistent roots.
    pub(crate) fn start(shared: &HeapShared, roots: &dyn Trace, config: GcConfig) -> Self {
        log::debug!(target: "gc-marker", "start marking ({:?})", config.marking_type);
        // Release pairs with the allocator's Acquire load.
        shared.is_marking.store(true, Ordering::Release);
        let marker = Self {
            config,
            worklists: MarkingWorklists::new(),
            started: Instant::now(),
        };
        marker.with_mutator_task(shared, |task| roots.trace(task));
        marker
    }

    pub fn config(&self) -> GcConfig {
        self.config
    }

    pub fn marked_bytes(&self) -> usize {
        self.worklists.marked_bytes.load(Ordering::Relaxed)
    }

    fn with_mutator_task<R>(&self, shared: &HeapShared, f: impl FnOnce(&mut MarkingTask<'_>) -> R) -> R {
        let terminator = Terminator::new(1);
        let mut task = MarkingTask::new(0, Worker::new_lifo(), &[], &self.worklists, &terminator, shared);
        let result = f(&mut task);
        task.publish();
        result
    }

    /// Incremental step on the mutator. Returns true when no work is left.
    pub(crate) fn advance(&self, shared: &HeapShared, budget: usize) -> bool {
        let done = self.with_mutator_task(shared, |task| task.run_with_budget(budget));
        log::trace!(target: "gc-marker", "incremental step: {} marked so far", formatted_size(self.marked_bytes()));
        done && self.worklists.injector.is_empty()
    }

    /// Dijkstra barrier: the new target of a store is marked and queued.
    pub(crate) fn write_barrier(&self, desc: TraceDescriptor) {
        if unsafe { (*desc.header()).try_mark_atomic() } {
            self.worklists.injector.push(desc);
        }
    }

    /// Queues an object allocated black so that the values it was
    /// initialized with get traced.
    pub(crate) fn push_black_allocated(&self, desc: TraceDescriptor) {
        self.worklists.injector.push(desc);
    }

    fn drain(&self, shared: &HeapShared, pool: Option<&MarkingPool>) {
        let pool = match pool {
            Some(pool) if self.config.marking_type == MarkingType::Atomic => pool,
            _ => {
                self.with_mutator_task(shared, |task| task.run());
                return;
            }
        };

        let nworkers = pool.threads + 1;
        let workers: Vec<_> = (0..nworkers).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<_> = workers.iter().map(|worker| worker.stealer()).collect();
        let terminator = Terminator::new(nworkers);
        let worklists = &self.worklists;

        pool.pool.scoped(|scope| {
            let mut workers = workers.into_iter().enumerate();
            let (_, own) = match workers.next() {
                Some(worker) => worker,
                None => return,
            };
            for (task_id, worker) in workers {
                let stealers = &stealers;
                let terminator = &terminator;
                scope.execute(move || {
                    let mut task = MarkingTask::new(task_id, worker, stealers, worklists, terminator, shared);
                    task.run();
                    task.publish();
                });
            }
            let mut task = MarkingTask::new(0, own, &stealers, worklists, &terminator, shared);
            task.run();
            task.publish();
        });
    }

    /// Final pause: re-traces roots, scans the stack if asked to, drains
    /// the worklist and processes weak callbacks. Clears the marking flag.
    pub(crate) fn finish(
        self,
        shared: &HeapShared,
        roots: &dyn Trace,
        stack_state: StackState,
        pool: Option<&MarkingPool>,
    ) -> MarkingSummary {
        self.with_mutator_task(shared, |task| {
            roots.trace(task);
            if stack_state == StackState::MayContainHeapPointers {
                match StackBounds::current_thread_stack_bounds() {
                    Some(bounds) => scan_current_stack(bounds, &mut |word| task.visit_conservatively(word)),
                    None => log::warn!(target: "gc-marker", "stack bounds unknown, skipping stack scan"),
                }
            }
        });

        self.drain(shared, pool);
        debug_assert!(self.worklists.injector.is_empty());

        let broker = LivenessBroker::new(&shared.backend);
        let mut weak_callbacks = 0;
        while let Some(item) = self.worklists.weak_callbacks.pop() {
            (item.callback)(&broker, item.parameter);
            weak_callbacks += 1;
        }

        shared.is_marking.store(false, Ordering::Release);

        let summary = MarkingSummary {
            marked_bytes: self.marked_bytes(),
            duration: self.started.elapsed(),
        };
        log::debug!(
            target: "gc-marker",
            "marking finished: {} marked in {:.2}ms, {} weak callbacks",
            formatted_size(summary.marked_bytes),
            summary.duration.as_micros() as f64 / 1000.0,
            weak_callbacks
        );
        summary
    }

    /// Leaves marking without sweeping. Mark bits already set stay set.
    pub(crate) fn abort(self, shared: &HeapShared) {
        shared.is_marking.store(false, Ordering::Release);
        while self.worklists.weak_callbacks.pop().is_some() {}
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MarkingSummary {
    pub marked_bytes: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_terminator_single_worker() {
        let terminator = Terminator::new(1);
        assert!(terminator.try_terminate());
    }

    #[test]
    fn test_terminator_all_workers_finish() {
        let terminator = Arc::new(Terminator::new(4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let terminator = terminator.clone();
                std::thread::spawn(move || while !terminator.try_terminate() {})
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
