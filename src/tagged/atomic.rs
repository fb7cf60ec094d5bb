use core::fmt;
use core::marker::PhantomData;

use crate::sync::{AtomicU64, Ordering};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

unsafe impl<T> Send for AtomicTaggedPtr<T> {}
unsafe impl<T> Sync for AtomicTaggedPtr<T> {}

impl<T> AtomicTaggedPtr<T> {
    /// Creates a new `AtomicTaggedPtr` holding `ptr`.
    #[inline]
    pub fn new(ptr: TaggedPtr<T>) -> Self {
        Self {
            inner: AtomicU64::new(ptr.into_u64()),
            _marker: PhantomData,
        }
    }

    /// Creates a null pointer with a zero counter.
    #[inline]
    pub fn null() -> Self {
        Self::new(TaggedPtr::null())
    }

    /// Loads the packed word.
    ///
    /// `load` takes an [`Ordering`] argument which describes the memory
    /// ordering of this operation; `Release` and `AcqRel` panic, as for
    /// any atomic load.
    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<T> {
        TaggedPtr::from_u64(self.inner.load(order))
    }

    /// Stores a packed word.
    #[inline]
    pub fn store(&self, ptr: TaggedPtr<T>, order: Ordering) {
        self.inner.store(ptr.into_u64(), order);
    }

    /// Stores `new` if the current word equals `current`, in one atomic
    /// operation on the whole pointer + counter word.
    ///
    /// Returns the previous value on success and the actually observed
    /// value on failure. The comparison is bitwise, so a matching
    /// address with a bumped counter does not match.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.inner
            .compare_exchange(current.into_u64(), new.into_u64(), success, failure)
            .map(TaggedPtr::from_u64)
            .map_err(TaggedPtr::from_u64)
    }
}

impl<T> Default for AtomicTaggedPtr<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicTaggedPtr<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ptr = self.load(Ordering::SeqCst);
        f.debug_struct("AtomicTaggedPtr")
            .field("ptr", &ptr.decompose_ptr())
            .field("tag", &ptr.decompose_tag())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

    use super::{AtomicTaggedPtr, TaggedPtr};

    #[test]
    fn load_store() {
        let value = Box::into_raw(Box::new(1_u64));

        let atomic: AtomicTaggedPtr<u64> = AtomicTaggedPtr::null();
        assert!(atomic.load(Relaxed).is_null());

        atomic.store(TaggedPtr::compose(value, 5), Relaxed);
        let loaded = atomic.load(Acquire);
        assert_eq!(loaded.decompose_ptr(), value);
        assert_eq!(loaded.decompose_tag(), 5);

        unsafe { drop(Box::from_raw(value)) };
    }

    #[test]
    fn compare_exchange_checks_the_counter() {
        let value = Box::into_raw(Box::new(1_u64));

        let atomic = AtomicTaggedPtr::new(TaggedPtr::compose(value, 1));

        // same address, stale counter
        let stale = TaggedPtr::compose(value, 0);
        let res = atomic.compare_exchange(stale, TaggedPtr::null(), Release, Relaxed);
        assert_eq!(res, Err(TaggedPtr::compose(value, 1)));

        let current = TaggedPtr::compose(value, 1);
        let res = atomic.compare_exchange(current, TaggedPtr::null(), Release, Relaxed);
        assert_eq!(res, Ok(current));
        assert!(atomic.load(Relaxed).is_null());

        unsafe { drop(Box::from_raw(value)) };
    }
}
