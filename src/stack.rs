//! Unbounded lock-free LIFO container.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::node::{ListHead, NodeCache};
use crate::sync::{
    AtomicBool, AtomicIsize,
    Ordering::{Acquire, Relaxed, Release},
};

/// An unbounded lock-free stack shared by any number of pushing and
/// pulling threads.
///
/// Consumers observe a last-writer-wins order: values pushed by one
/// thread come back in reverse program order, while the interleaving
/// across threads is decided by which CAS wins. Detached nodes are
/// recycled through a private free list and returned to the allocator
/// only when the stack is dropped.
///
/// # Examples
///
/// ```
/// use handoff::Stack;
///
/// let stack = Stack::new();
/// stack.push(1);
/// stack.push(2);
///
/// assert_eq!(stack.pull(), Some(2));
/// assert_eq!(stack.pull(), Some(1));
/// assert_eq!(stack.pull(), None);
/// ```
pub struct Stack<T> {
    list: ListHead<T>,
    len: CachePadded<AtomicIsize>,
    finish: AtomicBool,
    cache: NodeCache<T>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Creates a new empty stack.
    #[inline]
    pub fn new() -> Self {
        Self {
            list: ListHead::new(),
            len: CachePadded::new(AtomicIsize::new(0)),
            finish: AtomicBool::new(false),
            cache: NodeCache::new(),
        }
    }

    /// Pushes `value` onto the stack.
    ///
    /// After [`finish_waiting`](Stack::finish_waiting) has been enabled
    /// the push becomes a no-op and `value` is dropped, so a consumer
    /// that toggled the flag can drain without racing new arrivals.
    pub fn push(&self, value: T) {
        if self.is_finish_waiting() {
            return;
        }
        let node = self.cache.construct(value);
        unsafe { self.list.push_node(node) };
        self.len.fetch_add(1, Relaxed);
    }

    /// Removes the most recently pushed value, or returns `None` if the
    /// stack is currently empty.
    pub fn pull(&self) -> Option<T> {
        let node = self.list.pop_node();
        if node.is_null() {
            return None;
        }
        self.len.fetch_sub(1, Relaxed);
        // The winning CAS in `pop_node` made this thread the unique
        // owner; move the payload out and park the vacated node.
        unsafe {
            let value = ptr::addr_of!((*node).value).read();
            self.cache.retire(node);
            Some(ManuallyDrop::into_inner(value))
        }
    }

    /// Pulls in a loop, sleeping for `sleep` between attempts, until a
    /// value is available or [`finish_waiting`](Stack::finish_waiting)
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
        self.list.is_empty()
    }

    /// Toggles the shutdown flag consulted by [`push`](Stack::push) and
    /// [`pull_wait`](Stack::pull_wait).
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

impl<T> Default for Stack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Stack<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack").field("len", &self.len()).finish()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Still-resident nodes own live payloads, parked nodes do not;
        // the cache frees its own share.
        let mut node = self.list.take_all();
        while !node.is_null() {
            let mut boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Relaxed);
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
        }
    }
}


#[cfg(loom)]
mod loom_tests {
    use loom::sync::Arc;
    use loom::thread;

    use super::Stack;

    #[test]
    fn racing_pushes_both_land() {
        loom::model(|| {
            let stack = Arc::new(Stack::new());

            let s1 = Arc::clone(&stack);
            let s2 = Arc::clone(&stack);
            let h1 = thread::spawn(move || s1.push(1));
            let h2 = thread::spawn(move || s2.push(2));
            h1.join().unwrap();
            h2.join().unwrap();

            let mut values = vec![];
            while let Some(v) = stack.pull() {
                values.push(v);
            }
            values.sort_unstable();
            assert_eq!(values, [1, 2]);
        });
    }

    #[test]
    fn racing_pulls_take_distinct_values() {
        loom::model(|| {
            let stack = Arc::new(Stack::new());
            stack.push(1);

            let s1 = Arc::clone(&stack);
            let s2 = Arc::clone(&stack);
            let h1 = thread::spawn(move || s1.pull());
            let h2 = thread::spawn(move || s2.pull());

            let (r1, r2) = (h1.join().unwrap(), h2.join().unwrap());
            match (r1, r2) {
                (Some(1), None) | (None, Some(1)) => {}
                other => panic!("value duplicated or lost: {:?}", other),
            }
        });
    }
}
