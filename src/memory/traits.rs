use super::{space::SpaceSelector, visitor::Visitor};

/// Reports outgoing references to the visitor.
///
/// Called by marking threads while the mutator is paused or interleaved with
/// it, so implementations must only read `self`.
pub trait Trace {
    fn trace(&self, visitor: &mut dyn Visitor);
}

/// A type that can be allocated on the managed heap.
///
/// Objects whose type needs drop are finalized by the sweeper on the mutator
/// thread; the rest are reclaimed without running any code.
pub trait GarbageCollected: Trace + Sized + 'static {
    /// Space new instances are placed into. A subtype may forward to its
    /// base with `const SPACE: SpaceSelector = <Base as GarbageCollected>::SPACE;`.
    const SPACE: SpaceSelector = SpaceSelector::Regular;
}

/// A facet embedded inside a [`GarbageCollected`] allocation. Never allocated
/// on its own; references to it resolve to the enclosing object.
pub trait GarbageCollectedMixin: Trace + 'static {}

/// Marker for a custom space configured on the heap.
pub trait CustomSpace: 'static {
    const SPACE_INDEX: usize;
}

pub const fn custom_space<S: CustomSpace>() -> SpaceSelector {
    SpaceSelector::Custom(S::SPACE_INDEX)
}

pub fn trace_erased<T: Trace>(payload: *const u8, visitor: &mut dyn Visitor) {
    unsafe { (*payload.cast::<T>()).trace(visitor) }
}

pub fn finalize_erased<T>(payload: *mut u8) {
    unsafe { core::ptr::drop_in_place(payload.cast::<T>()) }
}

macro_rules! impl_leaf {
    ($($t:ty)*) => {
        $(
            impl Trace for $t {
                #[inline(always)]
                fn trace(&self, _: &mut dyn Visitor) {}
            }
        )*
    };
}

impl_leaf!(() u8 u16 u32 u64 u128 usize i8 i16 i32 i64 i128 isize f32 f64 bool char String);

impl GarbageCollected for String {}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for value in self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for value in self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        (**self).trace(visitor);
    }
}

impl<A: Trace, B: Trace> Trace for (A, B) {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.0.trace(visitor);
        self.1.trace(visitor);
    }
}
