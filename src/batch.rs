//! Unbounded multi-push / single-consumer drain-all queue.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::node::{ListHead, Node, NodeCache};
use crate::sync::{
    AtomicBool, AtomicIsize,
    Ordering::{Acquire, Relaxed, Release},
};

/// An unbounded queue where producers push one value at a time and a
/// consumer atomically detaches the whole accumulated backlog as one
/// batch, iterating over it in insertion order.
///
/// Internally this is an atomic LIFO list; the detaching consumer owns
/// the whole chain after a single CAS and reverses it in place, which
/// is what yields first-in first-out batches without any tail pointer.
/// Values pushed after the winning CAS land in the next batch.
///
/// # Examples
///
/// ```
/// use handoff::BatchQueue;
///
/// let queue = BatchQueue::new();
/// queue.push(1);
/// queue.push(2);
/// queue.push(3);
///
/// let batch = queue.pull().unwrap();
/// assert_eq!(batch.collect::<Vec<_>>(), [1, 2, 3]);
/// assert!(queue.pull().is_none());
/// ```
pub struct BatchQueue<T> {
    list: ListHead<T>,
    len: CachePadded<AtomicIsize>,
    finish: AtomicBool,
    cache: NodeCache<T>,
}

unsafe impl<T: Send> Send for BatchQueue<T> {}
unsafe impl<T: Send> Sync for BatchQueue<T> {}

impl<T> BatchQueue<T> {
    /// Creates a new empty queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            list: ListHead::new(),
            len: CachePadded::new(AtomicIsize::new(0)),
            finish: AtomicBool::new(false),
            cache: NodeCache::new(),
        }
    }

    /// Pushes `value` onto the queue.
    ///
    /// After [`finish_waiting`](BatchQueue::finish_waiting) has been
    /// enabled the push becomes a no-op and `value` is dropped.
    pub fn push(&self, value: T) {
        if self.is_finish_waiting() {
            return;
        }
        let node = self.cache.construct(value);
        unsafe { self.list.push_node(node) };
        self.len.fetch_add(1, Relaxed);
    }

    /// Detaches everything currently enqueued and returns an iterator
    /// over the batch in insertion order, or `None` if the queue is
    /// currently empty.
    ///
    /// The returned [`Drain`] exclusively owns the detached chain;
    /// dropping it releases unconsumed values and recycles their nodes.
    pub fn pull(&self) -> Option<Drain<'_, T>> {
        let chain = self.list.take_all();
        if chain.is_null() {
            return None;
        }

        // The chain is private now; count it so the resident counter
        // reflects the whole detached batch, then flip it to FIFO.
        let mut count = 0_isize;
        let mut cursor = chain;
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*cursor).next.load(Relaxed) };
        }
        self.len.fetch_sub(count, Relaxed);

        Some(Drain {
            head: unsafe { reverse(chain) },
            queue: self,
        })
    }

    /// Pulls in a loop, sleeping for `sleep` between attempts, until a
    /// batch is available or
    /// [`finish_waiting`](BatchQueue::finish_waiting) is enabled.
    pub fn pull_wait(&self, sleep: Duration) -> Option<Drain<'_, T>> {
        loop {
            let batch = self.pull();
            if batch.is_some() || self.is_finish_waiting() {
                return batch;
            }
            thread::sleep(sleep);
        }
    }

    /// Returns the number of resident values (advisory).
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Acquire).max(0) as usize
    }

    /// Returns true if no value is currently resident (advisory).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Toggles the shutdown flag consulted by
    /// [`push`](BatchQueue::push) and
    /// [`pull_wait`](BatchQueue::pull_wait).
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

impl<T> Default for BatchQueue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BatchQueue<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        let mut node = self.list.take_all();
        while !node.is_null() {
            let mut boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Relaxed);
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
        }
    }
}

/// Reverses a detached chain in place.
///
/// # Safety
///
/// The caller must exclusively own every node reachable from `list`.
unsafe fn reverse<T>(mut list: *mut Node<T>) -> *mut Node<T> {
    let mut prev = ptr::null_mut();
    while !list.is_null() {
        let next = (*list).next.load(Relaxed);
        (*list).next.store(prev, Relaxed);
        prev = list;
        list = next;
    }
    prev
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Drain
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A move-only iterator over one detached batch, in insertion order.
///
/// The iterator owns its chain outright; no synchronization happens
/// while consuming it. Dropping a partially consumed `Drain` drops the
/// remaining values and returns their nodes to the parent queue.
pub struct Drain<'a, T> {
    head: *mut Node<T>,
    queue: &'a BatchQueue<T>,
}

unsafe impl<T: Send> Send for Drain<'_, T> {}

impl<T> Drain<'_, T> {
    /// Returns true once the batch is exhausted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        let node = self.head;
        unsafe {
            self.head = (*node).next.load(Relaxed);
            let value = ptr::addr_of!((*node).value).read();
            self.queue.cache.retire(node);
            Some(ManuallyDrop::into_inner(value))
        }
    }
}

impl<T> Drop for Drain<'_, T> {
    fn drop(&mut self) {
        while !self.head.is_null() {
            let node = self.head;
            unsafe {
                self.head = (*node).next.load(Relaxed);
                ManuallyDrop::drop(&mut *ptr::addr_of_mut!((*node).value));
                self.queue.cache.retire(node);
            }
        }
    }
}

impl<T> fmt::Debug for Drain<'_, T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Drain")
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;
    use std::time::Duration;

    use super::BatchQueue;

    #[test]
    fn pull_on_empty() {
        let queue: BatchQueue<i32> = BatchQueue::new();
        assert!(queue.pull().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn batches_preserve_insertion_order() {
        let queue = BatchQueue::new();
        queue.push(0);

        let mut batch = queue.pull().unwrap();
        assert_eq!(batch.next(), Some(0));
        assert!(batch.is_empty());
        assert_eq!(batch.next(), None);
        drop(batch);

        for i in 1..5 {
            queue.push(i);
        }
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 4);

        let batch = queue.pull().unwrap();
        assert_eq!(batch.collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn items_pushed_after_detach_land_in_next_batch() {
        let queue = BatchQueue::new();
        queue.push(1);

        let first = queue.pull().unwrap();
        queue.push(2);
        queue.push(3);

        assert_eq!(first.collect::<Vec<_>>(), [1]);
        let second = queue.pull().unwrap();
        assert_eq!(second.collect::<Vec<_>>(), [2, 3]);
    }

    #[test]
    fn dropping_a_batch_releases_values() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let queue = BatchQueue::new();
        for _ in 0..10 {
            queue.push(Counted(Arc::clone(&drops)));
        }

        let mut batch = queue.pull().unwrap();
        drop(batch.next());
        drop(batch.next());
        assert_eq!(drops.load(Relaxed), 2);

        // dropping the iterator releases the unconsumed remainder
        drop(batch);
        assert_eq!(drops.load(Relaxed), 10);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn finish_waiting_drops_pushes() {
        let queue = BatchQueue::new();
        queue.push(1);
        queue.finish_waiting(true);
        queue.push(2);

        let batch = queue.pull().unwrap();
        assert_eq!(batch.collect::<Vec<_>>(), [1]);
        assert!(queue.pull_wait(Duration::from_millis(1)).is_none());
    }
}

#[cfg(loom)]
mod loom_tests {
    use loom::sync::Arc;
    use loom::thread;

    use super::BatchQueue;

    #[test]
    fn detach_races_with_push() {
        loom::model(|| {
            let queue = Arc::new(BatchQueue::new());
            queue.push(1);

            let q1 = Arc::clone(&queue);
            let producer = thread::spawn(move || q1.push(2));

            let mut seen = vec![];
            if let Some(batch) = queue.pull() {
                seen.extend(batch);
            }
            producer.join().unwrap();
            if let Some(batch) = queue.pull() {
                seen.extend(batch);
            }

            seen.sort_unstable();
            assert_eq!(seen, [1, 2]);
        });
    }
}
