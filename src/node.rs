//! The linked-list node shared by the LIFO-based containers and the
//! type-preserving free-list that recycles it.
//!
//! Retired nodes are never handed back to the allocator while the
//! container is live. A racing `pull` may read the `next` field of a
//! node that another thread has just detached; keeping the node
//! allocated (and still shaped like a node) makes that read harmless,
//! because the reader's subsequent CAS on the list head fails and the
//! stale value is discarded.

use core::mem::ManuallyDrop;
use core::ptr;

use crossbeam_utils::CachePadded;

use crate::sync::{
    retry_hint, AtomicPtr,
    Ordering::{Acquire, Relaxed, Release},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A singly linked list node carrying one payload value.
///
/// The payload slot is wrapped in [`ManuallyDrop`] because nodes parked
/// on the free list have had their value moved out; only the node's
/// current owner may touch the slot. The `next` field is atomic because
/// losing pullers read it while the winner rewrites it.
pub(crate) struct Node<T> {
    pub(crate) value: ManuallyDrop<T>,
    pub(crate) next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    #[inline]
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Boxes a fresh node and leaks it into the raw-pointer world the
    /// list protocols operate in.
    #[inline]
    pub(crate) fn alloc(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Self::new(value)))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ListHead
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The raw atomic list protocols: a single head word mutated by CAS.
///
/// This is the engine below [`Stack`](crate::Stack), the push side of
/// [`BatchQueue`](crate::BatchQueue) and the free-list cache.
pub(crate) struct ListHead<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
}

impl<T> ListHead<T> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Links `node` in front of the current head.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node exclusively owned by the caller
    /// with an initialized payload slot; ownership transfers to the
    /// list.
    pub(crate) unsafe fn push_node(&self, node: *mut Node<T>) {
        loop {
            let head = self.head.load(Relaxed);
            (*node).next.store(head, Relaxed);
            if self
                .head
                .compare_exchange_weak(head, node, Release, Relaxed)
                .is_ok()
            {
                return;
            }
            retry_hint();
        }
    }

    /// Detaches the current head node; the winning caller owns it.
    ///
    /// Returns null when the list is empty. The detached node's `next`
    /// is reset to null before it is handed out.
    pub(crate) fn pop_node(&self) -> *mut Node<T> {
        loop {
            let head = self.head.load(Acquire);
            if head.is_null() {
                return head;
            }
            // `head` stays allocated even if another puller wins the
            // race below, so this read cannot touch freed memory.
            let next = unsafe { (*head).next.load(Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, next, Release, Relaxed)
                .is_ok()
            {
                unsafe { (*head).next.store(ptr::null_mut(), Relaxed) };
                return head;
            }
            retry_hint();
        }
    }

    /// Detaches the entire chain in one CAS; the winner owns every node.
    ///
    /// Returns null when the list is empty, otherwise the most recently
    /// pushed node (the chain is in LIFO order).
    pub(crate) fn take_all(&self) -> *mut Node<T> {
        loop {
            let head = self.head.load(Relaxed);
            if head.is_null() {
                return head;
            }
            if self
                .head
                .compare_exchange_weak(head, ptr::null_mut(), Release, Relaxed)
                .is_ok()
            {
                return head;
            }
            retry_hint();
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NodeCache
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A private LIFO of retired nodes.
///
/// `construct` prefers recycling a parked node over asking the
/// allocator; `retire` parks a node whose payload slot has been
/// vacated. Parked nodes are released to the allocator only when the
/// cache itself is dropped, together with its owning container.
pub(crate) struct NodeCache<T> {
    free: ListHead<T>,
}

impl<T> NodeCache<T> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            free: ListHead::new(),
        }
    }

    /// Produces a node owning `value`, recycled if possible.
    pub(crate) fn construct(&self, value: T) -> *mut Node<T> {
        let node = self.free.pop_node();
        if node.is_null() {
            return Node::alloc(value);
        }
        unsafe {
            ptr::addr_of_mut!((*node).value).write(ManuallyDrop::new(value));
            (*node).next.store(ptr::null_mut(), Relaxed);
        }
        node
    }

    /// Parks `node` for later reuse.
    ///
    /// # Safety
    ///
    /// The caller must own `node` and must already have moved its
    /// payload out of the value slot.
    #[inline]
    pub(crate) unsafe fn retire(&self, node: *mut Node<T>) {
        self.free.push_node(node);
    }
}

impl<T> Drop for NodeCache<T> {
    fn drop(&mut self) {
        // Payload slots of parked nodes are vacant; freeing the boxes
        // must not drop them again, which ManuallyDrop guarantees.
        let mut node = self.free.take_all();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Relaxed);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use core::mem::ManuallyDrop;
    use core::ptr;
    use core::sync::atomic::Ordering::Relaxed;

    use super::{ListHead, NodeCache};

    #[test]
    fn push_pop_is_lifo() {
        let list = ListHead::new();
        for i in 0..4 {
            unsafe { list.push_node(super::Node::alloc(i)) };
        }

        for expected in (0..4).rev() {
            let node = list.pop_node();
            assert!(!node.is_null());
            let boxed = unsafe { Box::from_raw(node) };
            assert_eq!(ManuallyDrop::into_inner(boxed.value), expected);
        }
        assert!(list.pop_node().is_null());
        assert!(list.is_empty());
    }

    #[test]
    fn take_all_detaches_the_chain() {
        let list = ListHead::new();
        for i in 0..3 {
            unsafe { list.push_node(super::Node::alloc(i)) };
        }

        let mut node = list.take_all();
        assert!(list.is_empty());

        let mut drained = Vec::new();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Relaxed);
            drained.push(ManuallyDrop::into_inner(boxed.value));
        }
        assert_eq!(drained, [2, 1, 0]);
        assert!(list.take_all().is_null());
    }

    #[test]
    fn cache_recycles_retired_nodes() {
        let cache = NodeCache::new();

        let first = cache.construct(1_u32);
        unsafe {
            ptr::addr_of!((*first).value).read();
            cache.retire(first);
        }

        // the parked node is preferred over a fresh allocation
        let second = cache.construct(2_u32);
        assert_eq!(second, first);
        assert_eq!(unsafe { *(*second).value }, 2);

        unsafe {
            ptr::addr_of!((*second).value).read();
            cache.retire(second);
        }
    }
}
