//! Striped reader/writer locks protecting body data
//!
//! Every body index maps onto one of a small, power-of-two number of locks.
//! Batches lock the union of their stripes, always in ascending stripe order,
//! so two threads locking overlapping batches cannot deadlock.

use parking_lot::lock_api::RawRwLock;

/// Lock type used for the body stripes
pub type BodyMutex = parking_lot::RawRwLock;

/// Bitset of stripes, one bit per lock in a [`MutexArray`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MutexMask(u64);

impl MutexMask {
    pub const NONE: MutexMask = MutexMask(0);
    /// Every stripe; also used when a batch is too large to be worth computing
    pub const ALL: MutexMask = MutexMask(u64::MAX);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn with_stripe(self, stripe: usize) -> Self {
        Self(self.0 | (1u64 << stripe))
    }

    pub fn contains(self, stripe: usize) -> bool {
        stripe < 64 && self.0 & (1u64 << stripe) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Stripe indices in ascending order
    pub fn stripes(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let stripe = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(stripe)
        })
    }
}

/// Fixed array of reader/writer locks indexed by body index
pub struct MutexArray<R: RawRwLock = BodyMutex> {
    mutexes: Box<[R]>,
}

impl<R: RawRwLock> MutexArray<R> {
    /// Upper bound on the number of stripes, one per bit of a [`MutexMask`]
    pub const MAX_MUTEXES: usize = 64;

    /// Create `num_mutexes` stripes, rounded up to a power of two and clamped to `[1, 64]`
    pub fn new(num_mutexes: usize) -> Self {
        let count = num_mutexes.clamp(1, Self::MAX_MUTEXES).next_power_of_two();
        Self {
            mutexes: (0..count).map(|_| R::INIT).collect(),
        }
    }

    pub fn num_mutexes(&self) -> usize {
        self.mutexes.len()
    }

    /// Stripe protecting the element at `element_index`
    pub fn mutex_index(&self, element_index: u32) -> usize {
        element_index as usize & (self.mutexes.len() - 1)
    }

    pub fn mutex_by_index(&self, stripe: usize) -> &R {
        &self.mutexes[stripe]
    }

    pub fn mutex_for(&self, element_index: u32) -> &R {
        &self.mutexes[self.mutex_index(element_index)]
    }

    /// Mask covering every stripe that exists in this array
    pub fn full_mask(&self) -> MutexMask {
        if self.mutexes.len() == Self::MAX_MUTEXES {
            MutexMask::ALL
        } else {
            MutexMask((1u64 << self.mutexes.len()) - 1)
        }
    }

    /// Union of the stripes of the given element indices.
    ///
    /// Batches with at least as many elements as there are stripes lock
    /// everything instead of computing the exact union.
    pub fn mask_for(&self, element_indices: &[u32]) -> MutexMask {
        if element_indices.len() >= self.mutexes.len() {
            return self.full_mask();
        }
        element_indices
            .iter()
            .fold(MutexMask::NONE, |mask, &index| mask.with_stripe(self.mutex_index(index)))
    }

    fn clip(&self, mask: MutexMask) -> MutexMask {
        MutexMask(mask.0 & self.full_mask().0)
    }

    pub fn lock_shared(&self, mask: MutexMask) {
        for stripe in self.clip(mask).stripes() {
            self.mutexes[stripe].lock_shared();
        }
    }

    /// # Safety
    ///
    /// Every stripe in `mask` must be held in shared mode by the caller.
    pub unsafe fn unlock_shared(&self, mask: MutexMask) {
        for stripe in self.clip(mask).stripes() {
            // SAFETY: the caller holds a shared lock on this stripe
            unsafe { self.mutexes[stripe].unlock_shared() };
        }
    }

    pub fn lock_exclusive(&self, mask: MutexMask) {
        for stripe in self.clip(mask).stripes() {
            self.mutexes[stripe].lock_exclusive();
        }
    }

    /// # Safety
    ///
    /// Every stripe in `mask` must be held in exclusive mode by the caller.
    pub unsafe fn unlock_exclusive(&self, mask: MutexMask) {
        for stripe in self.clip(mask).stripes() {
            // SAFETY: the caller holds an exclusive lock on this stripe
            unsafe { self.mutexes[stripe].unlock_exclusive() };
        }
    }

    pub fn lock_all(&self) {
        self.lock_exclusive(MutexMask::ALL);
    }

    /// # Safety
    ///
    /// The caller must hold every stripe exclusively, e.g. through [`MutexArray::lock_all`].
    pub unsafe fn unlock_all(&self) {
        // SAFETY: forwarded from the caller
        unsafe { self.unlock_exclusive(MutexMask::ALL) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::lock_api::GuardSend;
    use std::cell::RefCell;

    thread_local! {
        static ACQUIRED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    /// Lock that records the address of every acquisition on the current thread
    struct RecordingLock {
        inner: BodyMutex,
    }

    impl RecordingLock {
        fn record(&self) {
            ACQUIRED.with(|log| log.borrow_mut().push(self as *const Self as usize));
        }
    }

    // SAFETY: all locking is forwarded to a real parking_lot lock
    unsafe impl RawRwLock for RecordingLock {
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = RecordingLock {
            inner: <BodyMutex as RawRwLock>::INIT,
        };
        type GuardMarker = GuardSend;

        fn lock_shared(&self) {
            self.record();
            self.inner.lock_shared();
        }

        fn try_lock_shared(&self) -> bool {
            self.inner.try_lock_shared()
        }

        unsafe fn unlock_shared(&self) {
            // SAFETY: forwarded from the caller
            unsafe { self.inner.unlock_shared() }
        }

        fn lock_exclusive(&self) {
            self.record();
            self.inner.lock_exclusive();
        }

        fn try_lock_exclusive(&self) -> bool {
            self.inner.try_lock_exclusive()
        }

        unsafe fn unlock_exclusive(&self) {
            // SAFETY: forwarded from the caller
            unsafe { self.inner.unlock_exclusive() }
        }
    }

    fn take_acquired_stripes(array: &MutexArray<RecordingLock>) -> Vec<usize> {
        let base = array.mutex_by_index(0) as *const RecordingLock as usize;
        let size = std::mem::size_of::<RecordingLock>();
        ACQUIRED.with(|log| {
            log.borrow_mut()
                .drain(..)
                .map(|address| (address - base) / size)
                .collect()
        })
    }

    #[test]
    fn test_count_is_power_of_two_and_clamped() {
        assert_eq!(MutexArray::<BodyMutex>::new(0).num_mutexes(), 1);
        assert_eq!(MutexArray::<BodyMutex>::new(5).num_mutexes(), 8);
        assert_eq!(MutexArray::<BodyMutex>::new(64).num_mutexes(), 64);
        assert_eq!(MutexArray::<BodyMutex>::new(1000).num_mutexes(), 64);
    }

    #[test]
    fn test_mutex_index_wraps() {
        let array = MutexArray::<BodyMutex>::new(8);
        assert_eq!(array.mutex_index(3), 3);
        assert_eq!(array.mutex_index(11), 3);
        assert_eq!(array.mask_for(&[3, 11, 4]), MutexMask::from_bits(0b11000));
    }

    #[test]
    fn test_large_batches_lock_everything() {
        let array = MutexArray::<BodyMutex>::new(4);
        assert_eq!(array.mask_for(&[0, 1, 2, 3]), array.full_mask());
        assert_eq!(array.full_mask(), MutexMask::from_bits(0b1111));
        assert_eq!(MutexArray::<BodyMutex>::new(64).full_mask(), MutexMask::ALL);
    }

    #[test]
    fn test_mask_stripes_ascending() {
        let mask = MutexMask::NONE.with_stripe(9).with_stripe(2).with_stripe(63);
        assert_eq!(mask.stripes().collect::<Vec<_>>(), vec![2, 9, 63]);
        assert!(mask.contains(63));
        assert!(!mask.contains(3));
    }

    #[test]
    fn test_lock_order_is_ascending_regardless_of_input_order() {
        let array = MutexArray::<RecordingLock>::new(16);
        let orders: [&[u32]; 3] = [&[12, 3, 7], &[7, 12, 3], &[3, 7, 12]];

        for indices in orders {
            let mask = array.mask_for(indices);
            array.lock_exclusive(mask);
            // SAFETY: locked just above
            unsafe { array.unlock_exclusive(mask) };
            assert_eq!(take_acquired_stripes(&array), vec![3, 7, 12]);

            array.lock_shared(mask);
            // SAFETY: locked just above
            unsafe { array.unlock_shared(mask) };
            assert_eq!(take_acquired_stripes(&array), vec![3, 7, 12]);
        }
    }

    #[test]
    fn test_lock_all_covers_existing_stripes_only() {
        let array = MutexArray::<RecordingLock>::new(4);
        array.lock_all();
        // SAFETY: locked just above
        unsafe { array.unlock_all() };
        assert_eq!(take_acquired_stripes(&array), vec![0, 1, 2, 3]);
    }
}
