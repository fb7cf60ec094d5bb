//! Atomic primitives used throughout the crate.
//!
//! Under `--cfg loom` the checked model versions are substituted so the
//! containers can be exercised by exhaustive interleaving tests.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64};

pub(crate) use core::sync::atomic::Ordering;

/// Called on every failed CAS in a retry loop.
///
/// Loom requires an explicit yield so its scheduler can bound the spin;
/// on real hardware this lowers to a PAUSE-style hint.
#[inline]
pub(crate) fn retry_hint() {
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(not(loom))]
    core::hint::spin_loop();
}
