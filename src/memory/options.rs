use crate::base::{
    constants::PAGE_SIZE,
    utils::{read_bool_from_env, read_string_from_env, read_uint_from_env, round_up},
};

use super::space::CustomSpaceConfig;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkingType {
    /// Stop-the-world marking, possibly on several worker threads.
    Atomic,
    /// Marking interleaved with the mutator in bounded steps.
    Incremental,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepingType {
    /// Sweep everything right after marking.
    Atomic,
    /// Sweep in steps driven by the mutator and by allocation.
    Incremental,
    /// Incremental, plus a background thread sweeping ahead of the mutator.
    IncrementalAndConcurrent,
}

/// Whether the mutator stack may hold references into the heap when a
/// collection is requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackState {
    NoHeapPointers,
    MayContainHeapPointers,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EmptyPageHandling {
    /// Unmap normal pages with no live objects once they are finalized.
    Release,
    /// Keep them in their space for reuse.
    Retain,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GcConfig {
    pub marking_type: MarkingType,
    pub sweeping_type: SweepingType,
    pub stack_state: StackState,
}

impl GcConfig {
    /// The configuration used by allocation retries: everything on the
    /// mutator, stack scanned.
    pub const fn conservative_atomic() -> Self {
        Self {
            marking_type: MarkingType::Atomic,
            sweeping_type: SweepingType::Atomic,
            stack_state: StackState::MayContainHeapPointers,
        }
    }

    pub const fn precise_atomic() -> Self {
        Self {
            marking_type: MarkingType::Atomic,
            sweeping_type: SweepingType::Atomic,
            stack_state: StackState::NoHeapPointers,
        }
    }

    pub const fn with_sweeping_type(mut self, sweeping_type: SweepingType) -> Self {
        self.sweeping_type = sweeping_type;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeapOptions {
    /// Upper bound for committed page memory. `None` means unbounded.
    pub max_heap_size: Option<usize>,
    /// Threads used by atomic marking, the mutator included.
    pub marking_workers: usize,
    /// Sweeping used by collections the heap triggers on its own.
    pub sweeping_type: SweepingType,
    pub empty_page_handling: EmptyPageHandling,
    /// Custom spaces, addressed by their position in this list.
    pub custom_spaces: Vec<CustomSpaceConfig>,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            marking_workers: num_cpus::get().clamp(1, 8),
            sweeping_type: SweepingType::IncrementalAndConcurrent,
            empty_page_handling: EmptyPageHandling::Release,
            custom_spaces: Vec::new(),
        }
    }
}

impl HeapOptions {
    pub fn from_env() -> Self {
        let mut options = Self::default();

        options.max_heap_size = match read_uint_from_env("GC_MAX_HEAP_SIZE") {
            Some(0) | None => None,
            Some(size) => Some(round_up(size, PAGE_SIZE)),
        };

        if let Some(threads) = read_uint_from_env("GC_MARKING_THREADS") {
            options.marking_workers = threads.max(1);
        }

        options.sweeping_type = match read_string_from_env("GC_SWEEP_MODE") {
            Some(mode) => match mode.to_lowercase().as_str() {
                "atomic" => SweepingType::Atomic,
                "incremental" => SweepingType::Incremental,
                "concurrent" => SweepingType::IncrementalAndConcurrent,
                _ => {
                    log::warn!(target: "gc", "unknown GC_SWEEP_MODE '{}', using concurrent", mode);
                    SweepingType::IncrementalAndConcurrent
                }
            },
            None => SweepingType::IncrementalAndConcurrent,
        };

        if let Some(true) = read_bool_from_env("GC_RETAIN_EMPTY_PAGES") {
            options.empty_page_handling = EmptyPageHandling::Retain;
        }

        options
    }

    pub fn with_max_heap_size(mut self, size: usize) -> Self {
        self.max_heap_size = Some(size);
        self
    }

    pub fn with_marking_workers(mut self, workers: usize) -> Self {
        self.marking_workers = workers.max(1);
        self
    }

    pub fn with_sweeping_type(mut self, sweeping_type: SweepingType) -> Self {
        self.sweeping_type = sweeping_type;
        self
    }

    pub fn with_empty_page_handling(mut self, handling: EmptyPageHandling) -> Self {
        self.empty_page_handling = handling;
        self
    }

    pub fn with_custom_space(mut self, space: CustomSpaceConfig) -> Self {
        self.custom_spaces.push(space);
        self
    }

    /// Configuration for collections the heap starts on its own.
    pub fn default_gc_config(&self) -> GcConfig {
        GcConfig::conservative_atomic().with_sweeping_type(self.sweeping_type)
    }
}
