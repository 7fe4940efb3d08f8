pub mod base;
pub mod memory;

pub use base::formatted_size;
pub use memory::{
    allocator::AllocationError,
    extension::{BackingStore, ExtensionId, YoungGcState},
    member::{Handle, Member, MixinMember, WeakMember, WeakMixinMember},
    options::{EmptyPageHandling, GcConfig, HeapOptions, MarkingType, StackState, SweepingType},
    space::{CustomSpaceConfig, SpaceSelector},
    stats::HeapStats,
    sweeper::SweeperState,
    traits::{custom_space, CustomSpace, GarbageCollected, GarbageCollectedMixin, Trace},
    visitor::{LivenessBroker, Visitor},
    Heap, ParkedScope,
};

#[cfg(test)]
mod tests;
