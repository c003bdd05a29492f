//! Scoped body locks
//!
//! Each guard locks on construction and unlocks exactly once when dropped.
//! Invalid ids lock nothing and resolve to no body.

use super::body::Body;
use super::id::BodyId;
use super::lock_interface::BodyLockInterface;
use super::mutex_array::{BodyMutex, MutexMask};
use std::ptr::NonNull;

/// Shared access to one body
pub struct BodyLockRead<'a> {
    interface: &'a dyn BodyLockInterface,
    mutex: Option<&'a BodyMutex>,
    body: Option<NonNull<Body>>,
}

impl<'a> BodyLockRead<'a> {
    pub fn new(interface: &'a dyn BodyLockInterface, id: BodyId) -> Self {
        if !id.is_valid() {
            return Self {
                interface,
                mutex: None,
                body: None,
            };
        }
        let mutex = interface.lock_read(id);
        let body = interface.try_get_body(id);
        Self {
            interface,
            mutex,
            body,
        }
    }

    /// Whether the id resolved to a live body
    pub fn succeeded(&self) -> bool {
        self.body.is_some()
    }

    pub fn succeeded_and_is_in_broad_phase(&self) -> bool {
        self.body().is_some_and(Body::is_in_broad_phase)
    }

    pub fn body(&self) -> Option<&Body> {
        // SAFETY: the stripe is held in shared mode for the lifetime of `self`
        self.body.map(|body| unsafe { body.as_ref() })
    }
}

impl Drop for BodyLockRead<'_> {
    fn drop(&mut self) {
        // SAFETY: `mutex` came from `lock_read` in `new`
        unsafe { self.interface.unlock_read(self.mutex) };
    }
}

/// Exclusive access to one body
pub struct BodyLockWrite<'a> {
    interface: &'a dyn BodyLockInterface,
    mutex: Option<&'a BodyMutex>,
    body: Option<NonNull<Body>>,
}

impl<'a> BodyLockWrite<'a> {
    pub fn new(interface: &'a dyn BodyLockInterface, id: BodyId) -> Self {
        if !id.is_valid() {
            return Self {
                interface,
                mutex: None,
                body: None,
            };
        }
        let mutex = interface.lock_write(id);
        let body = interface.try_get_body(id);
        Self {
            interface,
            mutex,
            body,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.body.is_some()
    }

    pub fn succeeded_and_is_in_broad_phase(&self) -> bool {
        self.body().is_some_and(Body::is_in_broad_phase)
    }

    pub fn body(&self) -> Option<&Body> {
        // SAFETY: the stripe is held exclusively for the lifetime of `self`
        self.body.map(|body| unsafe { body.as_ref() })
    }

    pub fn body_mut(&mut self) -> Option<&mut Body> {
        // SAFETY: the stripe is held exclusively and `&mut self` prevents a second borrow
        self.body.map(|mut body| unsafe { body.as_mut() })
    }
}

impl Drop for BodyLockWrite<'_> {
    fn drop(&mut self) {
        // SAFETY: `mutex` came from `lock_write` in `new`
        unsafe { self.interface.unlock_write(self.mutex) };
    }
}

fn resolve_all(interface: &dyn BodyLockInterface, ids: &[BodyId]) -> Vec<Option<NonNull<Body>>> {
    ids.iter()
        .map(|&id| {
            if id.is_valid() {
                interface.try_get_body(id)
            } else {
                None
            }
        })
        .collect()
}

/// Shared access to a batch of bodies
pub struct BodyLockMultiRead<'a> {
    interface: &'a dyn BodyLockInterface,
    mask: MutexMask,
    bodies: Vec<Option<NonNull<Body>>>,
}

impl<'a> BodyLockMultiRead<'a> {
    pub fn new(interface: &'a dyn BodyLockInterface, ids: &[BodyId]) -> Self {
        let mask = interface.mutex_mask(ids);
        interface.lock_read_mask(mask);
        Self {
            interface,
            mask,
            bodies: resolve_all(interface, ids),
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Body for the `index`-th id passed to [`BodyLockMultiRead::new`]
    pub fn body(&self, index: usize) -> Option<&Body> {
        // SAFETY: every stripe of the batch is held for the lifetime of `self`
        self.bodies[index].map(|body| unsafe { body.as_ref() })
    }
}

impl Drop for BodyLockMultiRead<'_> {
    fn drop(&mut self) {
        // SAFETY: `mask` was locked in shared mode in `new`
        unsafe { self.interface.unlock_read_mask(self.mask) };
    }
}

/// Exclusive access to a batch of bodies
pub struct BodyLockMultiWrite<'a> {
    interface: &'a dyn BodyLockInterface,
    mask: MutexMask,
    bodies: Vec<Option<NonNull<Body>>>,
}

impl<'a> BodyLockMultiWrite<'a> {
    pub fn new(interface: &'a dyn BodyLockInterface, ids: &[BodyId]) -> Self {
        let mask = interface.mutex_mask(ids);
        interface.lock_write_mask(mask);
        Self {
            interface,
            mask,
            bodies: resolve_all(interface, ids),
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn body(&self, index: usize) -> Option<&Body> {
        // SAFETY: every stripe of the batch is held exclusively for the lifetime of `self`
        self.bodies[index].map(|body| unsafe { body.as_ref() })
    }

    pub fn body_mut(&mut self, index: usize) -> Option<&mut Body> {
        // SAFETY: as above; `&mut self` keeps this the only live borrow
        self.bodies[index].map(|mut body| unsafe { body.as_mut() })
    }
}

impl Drop for BodyLockMultiWrite<'_> {
    fn drop(&mut self) {
        // SAFETY: `mask` was locked exclusively in `new`
        unsafe { self.interface.unlock_write_mask(self.mask) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::create_info::BodyCreateInfo;
    use crate::physics::body::lock_interface::BodyLockInterfaceLocking;
    use crate::physics::body::manager::BodyManager;
    use crate::physics::body::motion::MotionType;
    use crate::physics::collision::layers::{TwoLayerSetup, MOVING};
    use crate::physics::collision::shapes::Shape;
    use glam::{Quat, Vec3};
    use std::sync::Arc;

    fn setup() -> (Arc<BodyManager>, BodyLockInterfaceLocking, BodyId) {
        let manager = Arc::new(BodyManager::new(16, 4, Arc::new(TwoLayerSetup)));
        let info = BodyCreateInfo::new(
            Shape::sphere(0.5),
            Vec3::ZERO,
            Quat::IDENTITY,
            MotionType::Dynamic,
            MOVING,
        );
        let id = manager
            .add_body(manager.allocate_body(&info))
            .expect("capacity");
        (manager.clone(), BodyLockInterfaceLocking::new(manager), id)
    }

    #[test]
    fn test_invalid_id_locks_nothing() {
        let (manager, locks, _) = setup();
        {
            let lock = BodyLockWrite::new(&locks, BodyId::INVALID);
            assert!(!lock.succeeded());
        }
        // Every stripe must still be free
        let mask = manager.body_mutexes().full_mask();
        manager.body_mutexes().lock_exclusive(mask);
        // SAFETY: locked just above
        unsafe { manager.body_mutexes().unlock_exclusive(mask) };
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let (manager, locks, id) = setup();
        manager.destroy_bodies(&[id]);

        let lock = BodyLockRead::new(&locks, id);
        assert!(!lock.succeeded());
        assert!(lock.body().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let (_manager, locks, id) = setup();
        {
            let mut lock = BodyLockWrite::new(&locks, id);
            assert!(lock.succeeded());
            assert!(!lock.succeeded_and_is_in_broad_phase());
            if let Some(body) = lock.body_mut() {
                body.set_user_data(42);
            }
        }
        let lock = BodyLockRead::new(&locks, id);
        assert_eq!(lock.body().map(Body::user_data), Some(42));
    }

    #[test]
    fn test_multi_lock_keeps_input_order() {
        let (manager, locks, first) = setup();
        let info = BodyCreateInfo::default();
        let second = manager
            .add_body(manager.allocate_body(&info))
            .expect("capacity");

        let ids = [second, BodyId::INVALID, first];
        let lock = BodyLockMultiRead::new(&locks, &ids);
        assert_eq!(lock.len(), 3);
        assert_eq!(lock.body(0).map(Body::id), Some(second));
        assert!(lock.body(1).is_none());
        assert_eq!(lock.body(2).map(Body::id), Some(first));
    }
}
