//! Strategies for locking bodies
//!
//! Code that touches bodies goes through a [`BodyLockInterface`]. The locking
//! variant maps bodies onto the manager's stripes; the no-lock variant is used
//! by simulation stages that already guarantee exclusive access.

use super::body::Body;
use super::id::BodyId;
use super::manager::BodyManager;
use super::mutex_array::{BodyMutex, MutexMask};
use parking_lot::lock_api::RawRwLock;
use std::ptr::NonNull;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::BodyLockInterfaceLocking {}
    impl Sealed for super::BodyLockInterfaceNoLock {}
}

/// Lock primitives used by the scoped body locks in [`super::lock`].
///
/// The scoped locks hand out `&Body` / `&mut Body` on the strength of these
/// primitives, so the trait is sealed: only [`BodyLockInterfaceLocking`] and
/// [`BodyLockInterfaceNoLock`] implement it.
///
/// ```compile_fail
/// use rigid_engine::physics::body::{BodyId, BodyLockInterface, BodyManager, BodyMutex, MutexMask};
/// use std::sync::Arc;
///
/// struct NoLocks(Arc<BodyManager>);
///
/// impl BodyLockInterface for NoLocks {
///     fn body_manager(&self) -> &BodyManager {
///         &self.0
///     }
///     fn lock_read(&self, _id: BodyId) -> Option<&BodyMutex> {
///         None
///     }
///     unsafe fn unlock_read(&self, _mutex: Option<&BodyMutex>) {}
///     fn lock_write(&self, _id: BodyId) -> Option<&BodyMutex> {
///         None
///     }
///     unsafe fn unlock_write(&self, _mutex: Option<&BodyMutex>) {}
///     fn mutex_mask(&self, _ids: &[BodyId]) -> MutexMask {
///         MutexMask::NONE
///     }
///     fn lock_read_mask(&self, _mask: MutexMask) {}
///     unsafe fn unlock_read_mask(&self, _mask: MutexMask) {}
///     fn lock_write_mask(&self, _mask: MutexMask) {}
///     unsafe fn unlock_write_mask(&self, _mask: MutexMask) {}
/// }
/// ```
pub trait BodyLockInterface: sealed::Sealed + Send + Sync {
    fn body_manager(&self) -> &BodyManager;

    /// Take the stripe covering `id` in shared mode; `None` when nothing was locked
    fn lock_read(&self, id: BodyId) -> Option<&BodyMutex>;

    /// # Safety
    ///
    /// `mutex` must be the value returned by a matching [`BodyLockInterface::lock_read`].
    unsafe fn unlock_read(&self, mutex: Option<&BodyMutex>);

    /// Take the stripe covering `id` in exclusive mode; `None` when nothing was locked
    fn lock_write(&self, id: BodyId) -> Option<&BodyMutex>;

    /// # Safety
    ///
    /// `mutex` must be the value returned by a matching [`BodyLockInterface::lock_write`].
    unsafe fn unlock_write(&self, mutex: Option<&BodyMutex>);

    /// Stripes to lock for a batch of ids
    fn mutex_mask(&self, ids: &[BodyId]) -> MutexMask;

    fn lock_read_mask(&self, mask: MutexMask);

    /// # Safety
    ///
    /// `mask` must have been locked with [`BodyLockInterface::lock_read_mask`].
    unsafe fn unlock_read_mask(&self, mask: MutexMask);

    fn lock_write_mask(&self, mask: MutexMask);

    /// # Safety
    ///
    /// `mask` must have been locked with [`BodyLockInterface::lock_write_mask`].
    unsafe fn unlock_write_mask(&self, mask: MutexMask);

    /// Resolve an id whose stripe the caller holds
    fn try_get_body(&self, id: BodyId) -> Option<NonNull<Body>> {
        self.body_manager().try_get_body_ptr(id)
    }
}

/// Takes the real stripe locks
pub struct BodyLockInterfaceLocking {
    body_manager: Arc<BodyManager>,
}

impl BodyLockInterfaceLocking {
    pub fn new(body_manager: Arc<BodyManager>) -> Self {
        Self { body_manager }
    }
}

impl BodyLockInterface for BodyLockInterfaceLocking {
    fn body_manager(&self) -> &BodyManager {
        &self.body_manager
    }

    fn lock_read(&self, id: BodyId) -> Option<&BodyMutex> {
        if !id.is_valid() {
            return None;
        }
        let mutex = self.body_manager.mutex_for_body(id);
        mutex.lock_shared();
        Some(mutex)
    }

    unsafe fn unlock_read(&self, mutex: Option<&BodyMutex>) {
        if let Some(mutex) = mutex {
            // SAFETY: forwarded from the caller
            unsafe { mutex.unlock_shared() };
        }
    }

    fn lock_write(&self, id: BodyId) -> Option<&BodyMutex> {
        if !id.is_valid() {
            return None;
        }
        let mutex = self.body_manager.mutex_for_body(id);
        mutex.lock_exclusive();
        Some(mutex)
    }

    unsafe fn unlock_write(&self, mutex: Option<&BodyMutex>) {
        if let Some(mutex) = mutex {
            // SAFETY: forwarded from the caller
            unsafe { mutex.unlock_exclusive() };
        }
    }

    fn mutex_mask(&self, ids: &[BodyId]) -> MutexMask {
        self.body_manager.mutex_mask(ids)
    }

    fn lock_read_mask(&self, mask: MutexMask) {
        self.body_manager.body_mutexes().lock_shared(mask);
    }

    unsafe fn unlock_read_mask(&self, mask: MutexMask) {
        // SAFETY: forwarded from the caller
        unsafe { self.body_manager.body_mutexes().unlock_shared(mask) };
    }

    fn lock_write_mask(&self, mask: MutexMask) {
        self.body_manager.body_mutexes().lock_exclusive(mask);
    }

    unsafe fn unlock_write_mask(&self, mask: MutexMask) {
        // SAFETY: forwarded from the caller
        unsafe { self.body_manager.body_mutexes().unlock_exclusive(mask) };
    }
}

/// Takes no locks at all
pub struct BodyLockInterfaceNoLock {
    body_manager: Arc<BodyManager>,
}

impl BodyLockInterfaceNoLock {
    /// # Safety
    ///
    /// While any lock obtained through this interface is alive, no other code
    /// may access the same bodies, and no body may be removed.
    pub unsafe fn new(body_manager: Arc<BodyManager>) -> Self {
        Self { body_manager }
    }
}

impl BodyLockInterface for BodyLockInterfaceNoLock {
    fn body_manager(&self) -> &BodyManager {
        &self.body_manager
    }

    fn lock_read(&self, _id: BodyId) -> Option<&BodyMutex> {
        None
    }

    unsafe fn unlock_read(&self, _mutex: Option<&BodyMutex>) {}

    fn lock_write(&self, _id: BodyId) -> Option<&BodyMutex> {
        None
    }

    unsafe fn unlock_write(&self, _mutex: Option<&BodyMutex>) {}

    fn mutex_mask(&self, _ids: &[BodyId]) -> MutexMask {
        MutexMask::NONE
    }

    fn lock_read_mask(&self, _mask: MutexMask) {}

    unsafe fn unlock_read_mask(&self, _mask: MutexMask) {}

    fn lock_write_mask(&self, _mask: MutexMask) {}

    unsafe fn unlock_write_mask(&self, _mask: MutexMask) {}
}
