//! Unbounded lock-free MPMC FIFO queue.
//!
//! This is the Michael-Scott two-pointer queue with the two classical
//! pitfalls closed:
//!
//! - head and tail are [`AtomicTaggedPtr`]s, so a CAS cannot mistake a
//!   recycled node at an old address for an unchanged queue (ABA);
//! - retired nodes go through the bounded quarantine instead of
//!   straight back to the allocator, so a dequeuer that still holds a
//!   stale pointer reads valid, node-shaped memory and then fails its
//!   CAS against the bumped counter.

use core::fmt;
use core::ptr;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::quarantine::Quarantine;
use crate::sync::{
    retry_hint, AtomicBool, AtomicIsize, AtomicPtr,
    Ordering::{Acquire, Relaxed, Release},
};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// QueueNode
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A queue node; the payload lives in its own heap box so the node can
/// be recycled independently of the value's lifetime.
///
/// Both fields are atomic: losing dequeuers race the winner for `value`
/// and every thread races on `next`. The sentinel at the head position
/// (and any consumed node) carries a null payload pointer.
struct QueueNode<T> {
    value: AtomicPtr<T>,
    next: AtomicTaggedPtr<QueueNode<T>>,
}

impl<T> QueueNode<T> {
    #[inline]
    fn vacant() -> Self {
        Self {
            value: AtomicPtr::new(ptr::null_mut()),
            next: AtomicTaggedPtr::null(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Queue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An unbounded lock-free first-in first-out queue shared by any number
/// of pushing and pulling threads.
///
/// A successful push linearizes at the CAS on the last node's `next`; a
/// successful pull linearizes at the CAS on `head`. Together these are
/// consistent with a sequential queue history, and with a single
/// producer a single consumer observes exact program order.
///
/// # Examples
///
/// ```
/// use handoff::Queue;
///
/// let queue = Queue::new();
/// queue.push(1);
/// queue.push(2);
///
/// assert_eq!(queue.pull(), Some(1));
/// assert_eq!(queue.pull(), Some(2));
/// assert_eq!(queue.pull(), None);
/// ```
pub struct Queue<T> {
    head: CachePadded<AtomicTaggedPtr<QueueNode<T>>>,
    tail: CachePadded<AtomicTaggedPtr<QueueNode<T>>>,
    len: CachePadded<AtomicIsize>,
    finish: AtomicBool,
    quarantine: Quarantine<QueueNode<T>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a new empty queue holding only the sentinel node.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(QueueNode::vacant()));
        Self {
            head: CachePadded::new(AtomicTaggedPtr::new(TaggedPtr::compose(sentinel, 0))),
            tail: CachePadded::new(AtomicTaggedPtr::new(TaggedPtr::compose(sentinel, 0))),
            len: CachePadded::new(AtomicIsize::new(0)),
            finish: AtomicBool::new(false),
            quarantine: Quarantine::new(),
        }
    }

    /// Reuses a quarantined node or allocates a fresh one, initialized
    /// to carry `payload`.
    fn alloc_node(&self, payload: *mut T) -> *mut QueueNode<T> {
        let mut node = self.quarantine.try_reuse();
        if node.is_null() {
            node = Box::into_raw(Box::new(QueueNode::vacant()));
        }
        unsafe {
            (*node).value.store(payload, Relaxed);
            (*node).next.store(TaggedPtr::null(), Relaxed);
        }
        node
    }

    /// Appends `value` at the tail of the queue.
    ///
    /// The push proceeds even when
    /// [`finish_waiting`](Queue::finish_waiting) is enabled; the flag
    /// only affects [`pull_wait`](Queue::pull_wait). Producers that
    /// should stop at shutdown have to observe the flag themselves.
    pub fn push(&self, value: T) {
        let payload = Box::into_raw(Box::new(value));
        let node = self.alloc_node(payload);

        let mut tail;
        loop {
            tail = self.tail.load(Relaxed);
            // head and tail always reference a live node
            let tail_ref = unsafe { &*tail.decompose_ptr() };
            let next = tail_ref.next.load(Relaxed);

            // are tail and next consistent?
            if tail != self.tail.load(Acquire) {
                retry_hint();
                continue;
            }

            if next.is_null() {
                // tail points at the last node; try to link ours
                let linked = TaggedPtr::compose(node, next.decompose_tag().wrapping_add(1));
                if tail_ref
                    .next
                    .compare_exchange(next, linked, Release, Relaxed)
                    .is_ok()
                {
                    break;
                }
            } else {
                // tail lags behind; help swing it forward and retry
                let swung =
                    TaggedPtr::compose(next.decompose_ptr(), tail.decompose_tag().wrapping_add(1));
                let _ = self.tail.compare_exchange(tail, swung, Release, Relaxed);
            }
            retry_hint();
        }

        // best-effort swing of tail to the new node; if it fails, the
        // lagging-tail branch above fixes it up on some later operation
        let swung = TaggedPtr::compose(node, tail.decompose_tag().wrapping_add(1));
        let _ = self.tail.compare_exchange(tail, swung, Release, Relaxed);

        self.len.fetch_add(1, Relaxed);
    }

    /// Removes the oldest value, or returns `None` if the queue is
    /// currently empty.
    pub fn pull(&self) -> Option<T> {
        let payload;
        let retired;
        loop {
            let head = self.head.load(Acquire);
            let tail = self.tail.load(Acquire);
            let head_ref = unsafe { &*head.decompose_ptr() };
            let next = head_ref.next.load(Acquire);

            // are head, tail and next consistent?
            if head != self.head.load(Acquire) {
                retry_hint();
                continue;
            }

            if head.decompose_ptr() == tail.decompose_ptr() {
                if next.is_null() {
                    return None;
                }
                // tail lags behind the sentinel's successor; help it
                let swung =
                    TaggedPtr::compose(next.decompose_ptr(), tail.decompose_tag().wrapping_add(1));
                let _ = self.tail.compare_exchange(tail, swung, Release, Relaxed);
            } else {
                let node = next.decompose_ptr();
                // guard against an inconsistent null successor even
                // though head != tail says there should be one
                if !node.is_null() {
                    // read the payload pointer before the head CAS; once
                    // another dequeuer wins, `node` may be retired and
                    // recycled at any time
                    let candidate = unsafe { (*node).value.load(Relaxed) };
                    let advanced = TaggedPtr::compose(node, head.decompose_tag().wrapping_add(1));
                    if self
                        .head
                        .compare_exchange(head, advanced, Release, Relaxed)
                        .is_ok()
                    {
                        payload = candidate;
                        retired = head.decompose_ptr();
                        break;
                    }
                }
                retry_hint();
            }
        }

        // the old sentinel is ours now; clear the stale payload pointer
        // before parking it in quarantine
        unsafe {
            (*retired).value.store(ptr::null_mut(), Relaxed);
            self.quarantine.retire(retired);
        }
        self.len.fetch_sub(1, Relaxed);

        debug_assert!(!payload.is_null());
        let boxed = unsafe { Box::from_raw(payload) };
        Some(*boxed)
    }

    /// Pulls in a loop, sleeping for `sleep` between attempts, until a
    /// value is available or [`finish_waiting`](Queue::finish_waiting)
    /// is enabled.
    pub fn pull_wait(&self, sleep: Duration) -> Option<T> {
        loop {
            let value = self.pull();
            if value.is_some() || self.is_finish_waiting() {
                return value;
            }
            thread::sleep(sleep);
        }
    }

    /// Returns the number of resident values.
    ///
    /// The counter is advisory under concurrency: it is maintained with
    /// relaxed operations and only exact in quiescent states.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Acquire).max(0) as usize
    }

    /// Returns true if no value is currently resident (advisory).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggles the shutdown flag consulted by
    /// [`pull_wait`](Queue::pull_wait).
    #[inline]
    pub fn finish_waiting(&self, enabled: bool) {
        self.finish.store(enabled, Release);
    }

    /// Returns the current state of the shutdown flag.
    #[inline]
    pub fn is_finish_waiting(&self) -> bool {
        self.finish.load(Acquire)
    }
}

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // drain the resident payloads through the regular path, then
        // release the last sentinel; the quarantine frees its own slots
        while self.pull().is_some() {}
        let sentinel = self.head.load(Relaxed).decompose_ptr();
        drop(unsafe { Box::from_raw(sentinel) });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Queue;

    #[test]
    fn pull_on_empty() {
        let queue: Queue<i32> = Queue::new();
        assert_eq!(queue.pull(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn interleaved_push_pull_preserves_order() {
        let queue = Queue::new();
        queue.push(0);
        assert_eq!(queue.pull(), Some(0));

        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pull(), Some(1));

        queue.push(3);
        queue.push(4);
        assert_eq!(queue.pull(), Some(2));
        assert_eq!(queue.pull(), Some(3));
        assert_eq!(queue.pull(), Some(4));

        assert_eq!(queue.pull(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn fifo_order_across_node_recycling() {
        let queue = Queue::new();
        // enough traffic to cycle nodes through the quarantine
        for round in 0..4_u32 {
            for i in 0..1000 {
                queue.push(round * 1000 + i);
            }
            for i in 0..1000 {
                assert_eq!(queue.pull(), Some(round * 1000 + i));
            }
        }
        assert_eq!(queue.pull(), None);
    }

    #[test]
    fn finish_waiting_only_affects_pull_wait() {
        let queue = Queue::new();
        queue.finish_waiting(true);
        queue.push(1);

        assert_eq!(queue.pull_wait(Duration::from_millis(1)), Some(1));
        assert_eq!(queue.pull_wait(Duration::from_millis(1)), None);
    }

    #[test]
    fn drop_releases_resident_payloads() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = Queue::new();
            for _ in 0..100 {
                queue.push(Counted(Arc::clone(&drops)));
            }
            for _ in 0..30 {
                assert!(queue.pull().is_some());
            }
        }
        assert_eq!(drops.load(Relaxed), 100);
    }

    #[test]
    fn concurrent_push_pull_conserves_values() {
        const PER_THREAD: usize = 10_000;

        let queue = Arc::new(Queue::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        queue.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut pulled = 0_usize;
                    for _ in 0..PER_THREAD {
                        if queue.pull().is_some() {
                            pulled += 1;
                        }
                    }
                    pulled
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut total = 0;
        for consumer in consumers {
            total += consumer.join().unwrap();
        }
        while queue.pull().is_some() {
            total += 1;
        }

        assert_eq!(total, 4 * PER_THREAD);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}

#[cfg(loom)]
mod loom_tests {
    use loom::sync::Arc;
    use loom::thread;

    use super::Queue;

    #[test]
    fn push_races_with_pull() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());
            queue.push(1);

            let q1 = Arc::clone(&queue);
            let producer = thread::spawn(move || q1.push(2));
            let q2 = Arc::clone(&queue);
            let consumer = thread::spawn(move || q2.pull());

            producer.join().unwrap();
            let first = consumer.join().unwrap();

            // the consumer must observe the oldest resident value
            assert_eq!(first, Some(1));
            assert_eq!(queue.pull(), Some(2));
            assert_eq!(queue.pull(), None);
        });
    }

    #[test]
    fn racing_pulls_take_distinct_values() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());
            queue.push(1);

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.pull());
            let h2 = thread::spawn(move || q2.pull());

            let (r1, r2) = (h1.join().unwrap(), h2.join().unwrap());
            match (r1, r2) {
                (Some(1), None) | (None, Some(1)) => {}
                other => panic!("value duplicated or lost: {:?}", other),
            }
        });
    }
}
