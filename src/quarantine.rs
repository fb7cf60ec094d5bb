//! Bounded quarantine for nodes retired from the FIFO queue.
//!
//! A dequeuing thread may hold a stale tagged pointer to a node that a
//! faster thread has already unlinked. The queue therefore never frees
//! a node directly: retirement swaps it into a fixed slot table and
//! frees whatever occupied the slot before. With 512 slots, a node sits
//! in quarantine for at least 511 further retirements before its memory
//! is released, by which time every stale reader has either finished or
//! will fail its CAS against the bumped generation counter. Until then
//! the node stays allocated and node-shaped, which is the
//! type-preservation the Michael-Scott algorithm requires.

use core::ptr;

use crate::sync::{
    retry_hint, AtomicPtr, AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

/// Number of quarantine slots per queue.
#[cfg(not(loom))]
const SLOT_COUNT: usize = 512;
/// Loom models every atomic access; a full-size table would drown the
/// checker, and the protocol is the same at any slot count.
#[cfg(loom)]
const SLOT_COUNT: usize = 4;

////////////////////////////////////////////////////////////////////////////////////////////////////
// SlotState
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Packed slot state: a 31-bit generation counter and an in-use lock
/// bit in the topmost position.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SlotState(u32);

const LOCK_BIT: u32 = 1 << 31;

impl SlotState {
    #[inline]
    fn new(counter: u32, locked: bool) -> Self {
        Self((counter & !LOCK_BIT) | if locked { LOCK_BIT } else { 0 })
    }

    #[inline]
    fn counter(self) -> u32 {
        self.0 & !LOCK_BIT
    }

    #[inline]
    fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Quarantine
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Slot<N> {
    node: AtomicPtr<N>,
    state: AtomicU32,
}

/// The slot table plus the global generation source.
///
/// `N` is the node type; the quarantine owns every non-null pointer
/// parked in its slots and frees them with `Box::from_raw` when they
/// are displaced or when the table itself is dropped.
pub(crate) struct Quarantine<N> {
    slots: Box<[Slot<N>]>,
    epoch: AtomicU32,
}

unsafe impl<N: Send> Send for Quarantine<N> {}
unsafe impl<N: Send> Sync for Quarantine<N> {}

impl<N> Quarantine<N> {
    pub(crate) fn new() -> Self {
        let slots = (0..SLOT_COUNT)
            .map(|_| Slot {
                node: AtomicPtr::new(ptr::null_mut()),
                state: AtomicU32::new(SlotState::new(0, false).0),
            })
            .collect();
        Self {
            slots,
            epoch: AtomicU32::new(1),
        }
    }

    /// Takes a quarantined node back out for reuse, if one is available.
    ///
    /// Scans for the first unlocked occupied slot and makes a single
    /// lock attempt; on any contention the caller falls back to a fresh
    /// allocation. Returns null if nothing was reclaimed.
    pub(crate) fn try_reuse(&self) -> *mut N {
        let candidate = self.slots.iter().find(|slot| {
            let state = SlotState(slot.state.load(Relaxed));
            !state.is_locked() && !slot.node.load(Relaxed).is_null()
        });

        if let Some(slot) = candidate {
            let expected = SlotState(slot.state.load(Relaxed));
            if !expected.is_locked()
                && slot
                    .state
                    .compare_exchange(
                        expected.0,
                        SlotState::new(expected.counter(), true).0,
                        Acquire,
                        Relaxed,
                    )
                    .is_ok()
            {
                let node = slot.node.swap(ptr::null_mut(), Relaxed);
                slot.state.store(SlotState::new(0, false).0, Release);
                if !node.is_null() {
                    return node;
                }
            }
        }
        ptr::null_mut()
    }

    /// Parks `node` and frees the node it displaces.
    ///
    /// Locks the unlocked slot with the smallest generation counter,
    /// swaps `node` in, stamps the slot with a fresh generation and
    /// only then deallocates the previous occupant, which has aged
    /// through the full quarantine window.
    ///
    /// # Safety
    ///
    /// The caller must own `node`: it must be unlinked from the queue
    /// and allocated via `Box`, and no new references to it can be
    /// created afterwards.
    pub(crate) unsafe fn retire(&self, node: *mut N) {
        loop {
            let slot = self.oldest_slot();
            let expected = SlotState(slot.state.load(Relaxed));
            if expected.is_locked() {
                retry_hint();
                continue;
            }
            if slot
                .state
                .compare_exchange(
                    expected.0,
                    SlotState::new(expected.counter(), true).0,
                    Acquire,
                    Relaxed,
                )
                .is_err()
            {
                retry_hint();
                continue;
            }

            let displaced = slot.node.swap(node, Relaxed);
            let stamp = self.epoch.fetch_add(1, Relaxed).wrapping_add(1);
            slot.state.store(SlotState::new(stamp, false).0, Release);

            if !displaced.is_null() {
                drop(Box::from_raw(displaced));
            }
            return;
        }
    }

    /// Finds the preferred slot for retirement: unlocked before locked,
    /// then smallest generation counter.
    fn oldest_slot(&self) -> &Slot<N> {
        let mut oldest = &self.slots[0];
        let mut oldest_key = slot_key(oldest);
        for slot in &self.slots[1..] {
            let key = slot_key(slot);
            if key < oldest_key {
                oldest = slot;
                oldest_key = key;
            }
        }
        oldest
    }
}

#[inline]
fn slot_key<N>(slot: &Slot<N>) -> (bool, u32) {
    let state = SlotState(slot.state.load(Relaxed));
    (state.is_locked(), state.counter())
}

impl<N> Drop for Quarantine<N> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let node = slot.node.load(Relaxed);
            if !node.is_null() {
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::{Quarantine, SlotState, SLOT_COUNT};

    #[test]
    fn state_packing() {
        let unlocked = SlotState::new(7, false);
        assert_eq!(unlocked.counter(), 7);
        assert!(!unlocked.is_locked());

        let locked = SlotState::new(7, true);
        assert_eq!(locked.counter(), 7);
        assert!(locked.is_locked());

        // counters are truncated to 31 bits
        let wrapped = SlotState::new(u32::MAX, false);
        assert!(!wrapped.is_locked());
        assert_eq!(wrapped.counter(), u32::MAX >> 1);
    }

    #[test]
    fn reuse_prefers_quarantined_nodes() {
        let quarantine: Quarantine<u64> = Quarantine::new();
        assert!(quarantine.try_reuse().is_null());

        let node = Box::into_raw(Box::new(42_u64));
        unsafe { quarantine.retire(node) };

        let reused = quarantine.try_reuse();
        assert_eq!(reused, node);
        assert!(quarantine.try_reuse().is_null());

        drop(unsafe { Box::from_raw(reused) });
    }

    #[test]
    fn displacement_frees_only_after_a_full_cycle() {
        let quarantine: Quarantine<u64> = Quarantine::new();

        // fill every slot, then push it through one more full round;
        // each retirement displaces the oldest node without touching
        // the rest, so nothing is freed twice and nothing leaks
        for round in 0..2_u64 {
            for i in 0..SLOT_COUNT as u64 {
                let node = Box::into_raw(Box::new(round * SLOT_COUNT as u64 + i));
                unsafe { quarantine.retire(node) };
            }
        }

        let mut reclaimed = 0;
        loop {
            let node = quarantine.try_reuse();
            if node.is_null() {
                break;
            }
            // only nodes of the second round can still be resident
            assert!(unsafe { *node } >= SLOT_COUNT as u64);
            drop(unsafe { Box::from_raw(node) });
            reclaimed += 1;
        }
        assert_eq!(reclaimed, SLOT_COUNT);
    }
}
