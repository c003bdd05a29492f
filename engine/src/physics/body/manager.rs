//! Body registry
//!
//! The [`BodyManager`] owns every registered body. It hands out [`BodyId`]s
//! backed by a fixed-capacity slot array with an embedded free list, tracks the
//! set of active (simulating) bodies and owns the striped locks that guard
//! individual bodies.
//!
//! Three lock domains are kept apart:
//! - the slot table mutex guards slot assignment and the free list,
//! - the active-body mutex guards the active array (its length is additionally
//!   published through an atomic so readers can skip the mutex),
//! - the body stripes guard the bodies themselves.
//!
//! Lock order is body stripes (ascending) before the slot table mutex, and
//! body stripes before the active-body mutex.

use super::activation::{ActivationPermit, BodyActivationListener};
use super::body::Body;
use super::create_info::BodyCreateInfo;
use super::id::BodyId;
use super::lock::BodyLockMultiWrite;
use super::lock_interface::BodyLockInterface;
use super::motion::MotionType;
use super::mutex_array::{BodyMutex, MutexArray, MutexMask};
use crate::physics::collision::layers::{BroadPhaseLayer, BroadPhaseLayerInterface, CollisionLayer};
use glam::Vec3;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Errors returned when registering bodies
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    #[error("body capacity of {max_bodies} exhausted")]
    CapacityExhausted { max_bodies: u32 },

    #[error("body already registered as {0}")]
    AlreadyRegistered(BodyId),

    #[error("body id {0} is out of range")]
    InvalidBodyId(BodyId),

    #[error("body id {0} is already in use")]
    BodyIdInUse(BodyId),
}

/// Terminates the free list
const FREE_LIST_END: u32 = u32::MAX;

/// Marker in the active index table for bodies outside the active set
pub const INACTIVE_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotEntry {
    Occupied,
    Free { next: u32 },
}

/// Slot bookkeeping guarded by the slot table mutex
struct SlotTable {
    /// Logical size of the slot array; never exceeds `max_bodies`
    entries: Vec<SlotEntry>,
    /// Sequence number last handed out per slot
    sequence_numbers: Box<[u8]>,
    free_list_head: u32,
    num_bodies: u32,
}

impl SlotTable {
    fn push_free(&mut self, index: u32) {
        self.entries[index as usize] = SlotEntry::Free {
            next: self.free_list_head,
        };
        self.free_list_head = index;
    }

    fn next_free(&self, index: u32) -> u32 {
        match self.entries[index as usize] {
            SlotEntry::Free { next } => next,
            SlotEntry::Occupied => FREE_LIST_END,
        }
    }

    /// Splice `index` out of the singly linked free list; O(free list length)
    fn unlink_free(&mut self, index: u32) -> bool {
        let next = self.next_free(index);
        if self.free_list_head == index {
            self.free_list_head = next;
            return true;
        }

        let mut current = self.free_list_head;
        while current != FREE_LIST_END {
            let following = self.next_free(current);
            if following == index {
                self.entries[current as usize] = SlotEntry::Free { next };
                return true;
            }
            current = following;
        }
        false
    }

    fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut current = self.free_list_head;
        while current != FREE_LIST_END && len <= self.entries.len() {
            len += 1;
            current = self.next_free(current);
        }
        len
    }
}

/// Snapshot of slot usage, used to check the free list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub num_bodies: u32,
    pub free_list_len: u32,
    pub slot_array_size: u32,
}

/// Body counts by motion type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyStats {
    pub num_bodies: u32,
    pub max_bodies: u32,
    pub num_bodies_static: u32,
    pub num_bodies_dynamic: u32,
    pub num_active_bodies_dynamic: u32,
    pub num_bodies_kinematic: u32,
    pub num_active_bodies_kinematic: u32,
}

/// Registry of all bodies in a scene
pub struct BodyManager {
    /// Body per slot; null when the slot is free
    bodies: Box<[AtomicPtr<Body>]>,
    slots: Mutex<SlotTable>,
    body_mutexes: MutexArray,
    /// Active body ids; entries below `num_active` are valid
    active_ids: Box<[AtomicU32]>,
    /// Position of each slot's body in `active_ids`, or [`INACTIVE_INDEX`]
    active_index: Box<[AtomicU32]>,
    num_active: AtomicU32,
    active_mutex: Mutex<()>,
    active_bodies_frozen: AtomicBool,
    activation_listener: RwLock<Option<Arc<dyn BodyActivationListener>>>,
    broad_phase_layer_interface: Arc<dyn BroadPhaseLayerInterface>,
}

// SAFETY: bodies are only reached through the raw pointers in `bodies` while the
// matching body stripe is held (or under the documented no-lock contract); all
// other state is atomics or behind locks.
unsafe impl Send for BodyManager {}
// SAFETY: see above
unsafe impl Sync for BodyManager {}

impl BodyManager {
    /// Create a manager for up to `max_bodies` bodies.
    ///
    /// `num_body_mutexes == 0` picks a stripe count from the available parallelism.
    pub fn new(
        max_bodies: u32,
        num_body_mutexes: u32,
        broad_phase_layer_interface: Arc<dyn BroadPhaseLayerInterface>,
    ) -> Self {
        let max_bodies = max_bodies.min(BodyId::MAX_BODY_INDEX + 1);
        let num_mutexes = if num_body_mutexes == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() * 4)
                .unwrap_or(16)
        } else {
            num_body_mutexes as usize
        };
        let body_mutexes = MutexArray::new(num_mutexes);

        info!(
            max_bodies,
            num_body_mutexes = body_mutexes.num_mutexes(),
            "Initializing body manager"
        );

        let capacity = max_bodies as usize;
        Self {
            bodies: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            slots: Mutex::new(SlotTable {
                entries: Vec::with_capacity(capacity),
                sequence_numbers: vec![0; capacity].into_boxed_slice(),
                free_list_head: FREE_LIST_END,
                num_bodies: 0,
            }),
            body_mutexes,
            active_ids: (0..capacity)
                .map(|_| AtomicU32::new(BodyId::INVALID.to_raw()))
                .collect(),
            active_index: (0..capacity).map(|_| AtomicU32::new(INACTIVE_INDEX)).collect(),
            num_active: AtomicU32::new(0),
            active_mutex: Mutex::new(()),
            active_bodies_frozen: AtomicBool::new(false),
            activation_listener: RwLock::new(None),
            broad_phase_layer_interface,
        }
    }

    pub fn max_bodies(&self) -> u32 {
        self.bodies.len() as u32
    }

    pub fn num_bodies(&self) -> u32 {
        self.slots.lock().num_bodies
    }

    pub fn broad_phase_layer_interface(&self) -> &dyn BroadPhaseLayerInterface {
        self.broad_phase_layer_interface.as_ref()
    }

    pub fn broad_phase_layer(&self, layer: CollisionLayer) -> BroadPhaseLayer {
        self.broad_phase_layer_interface.broad_phase_layer(layer)
    }

    /// Build a body that is not yet registered; its id is invalid
    pub fn allocate_body(&self, info: &BodyCreateInfo) -> Box<Body> {
        let broad_phase_layer = self.broad_phase_layer(info.collision_layer);
        Box::new(Body::from_create_info(info, broad_phase_layer))
    }

    /// Register a body in the first free slot.
    ///
    /// On failure the body is dropped and the manager is left untouched.
    pub fn add_body(&self, body: Box<Body>) -> Result<BodyId, BodyError> {
        self.try_add_body(body).map_err(|(error, _)| error)
    }

    /// Like [`BodyManager::add_body`] but hands the body back on failure
    pub fn try_add_body(&self, mut body: Box<Body>) -> Result<BodyId, (BodyError, Box<Body>)> {
        if body.id().is_valid() {
            warn!(id = %body.id(), "Body already has an id");
            let id = body.id();
            return Err((BodyError::AlreadyRegistered(id), body));
        }

        let mut slots = self.slots.lock();
        let index = if slots.free_list_head != FREE_LIST_END {
            let index = slots.free_list_head;
            slots.free_list_head = slots.next_free(index);
            slots.entries[index as usize] = SlotEntry::Occupied;
            index
        } else if slots.entries.len() < self.bodies.len() {
            slots.entries.push(SlotEntry::Occupied);
            (slots.entries.len() - 1) as u32
        } else {
            warn!(max_bodies = self.max_bodies(), "Body capacity exhausted");
            let error = BodyError::CapacityExhausted {
                max_bodies: self.max_bodies(),
            };
            return Err((error, body));
        };

        let sequence = slots.sequence_numbers[index as usize].wrapping_add(1);
        slots.sequence_numbers[index as usize] = sequence;
        slots.num_bodies += 1;

        let id = BodyId::new(index, sequence);
        body.id = id;
        self.bodies[index as usize].store(Box::into_raw(body), Ordering::Release);

        trace!(%id, "Added body");
        Ok(id)
    }

    /// Register a body under a caller chosen id.
    ///
    /// The slot must be free. Slots between the current end of the array and
    /// the requested index are added to the free list.
    pub fn add_body_with_custom_id(&self, body: Box<Body>, id: BodyId) -> Result<BodyId, BodyError> {
        self.try_add_body_with_custom_id(body, id)
            .map_err(|(error, _)| error)
    }

    /// Like [`BodyManager::add_body_with_custom_id`] but hands the body back on failure
    pub fn try_add_body_with_custom_id(
        &self,
        mut body: Box<Body>,
        id: BodyId,
    ) -> Result<BodyId, (BodyError, Box<Body>)> {
        if body.id().is_valid() {
            warn!(id = %body.id(), "Body already has an id");
            let existing = body.id();
            return Err((BodyError::AlreadyRegistered(existing), body));
        }
        if !id.is_valid() || id.index() >= self.max_bodies() {
            return Err((BodyError::InvalidBodyId(id), body));
        }

        let index = id.index();
        let mut slots = self.slots.lock();
        if (index as usize) < slots.entries.len() {
            if slots.entries[index as usize] == SlotEntry::Occupied {
                return Err((BodyError::BodyIdInUse(id), body));
            }
            let unlinked = slots.unlink_free(index);
            debug_assert!(unlinked, "slot {index} is free but not on the free list");
            slots.entries[index as usize] = SlotEntry::Occupied;
        } else {
            while (slots.entries.len() as u32) < index {
                let free_index = slots.entries.len() as u32;
                slots.entries.push(SlotEntry::Occupied);
                slots.push_free(free_index);
            }
            slots.entries.push(SlotEntry::Occupied);
        }

        slots.sequence_numbers[index as usize] = id.sequence();
        slots.num_bodies += 1;

        body.id = id;
        self.bodies[index as usize].store(Box::into_raw(body), Ordering::Release);

        trace!(%id, "Added body with custom id");
        Ok(id)
    }

    /// Unlink bodies from their slots and hand them back to the caller.
    ///
    /// Bodies must already be deactivated and out of the broad phase. Ids that
    /// do not resolve are skipped. The caller must not hold a lock on any of
    /// the bodies.
    pub fn remove_bodies(&self, ids: &[BodyId]) -> Vec<Box<Body>> {
        let mask = self.mutex_mask(ids);
        self.body_mutexes.lock_exclusive(mask);

        let mut removed = Vec::with_capacity(ids.len());
        {
            let mut slots = self.slots.lock();
            for &id in ids {
                let Some(body_ptr) = self.try_get_body_ptr(id) else {
                    trace!(%id, "Skipping removal of unknown body");
                    continue;
                };

                let index = id.index();
                debug_assert!(
                    self.active_index[index as usize].load(Ordering::Relaxed) == INACTIVE_INDEX,
                    "body {id} must be deactivated before removal"
                );

                self.bodies[index as usize].store(ptr::null_mut(), Ordering::Release);
                slots.push_free(index);
                slots.num_bodies -= 1;

                // SAFETY: the pointer came from `Box::into_raw` in `add_body*`, has just
                // been unpublished and its stripe is held exclusively, so nobody else
                // can reach it.
                let mut body = unsafe { Box::from_raw(body_ptr.as_ptr()) };
                debug_assert!(
                    !body.is_in_broad_phase(),
                    "body {id} must be removed from the broad phase before removal"
                );
                body.id = BodyId::INVALID;
                removed.push(body);
            }
        }

        // SAFETY: locked at the top of this function
        unsafe { self.body_mutexes.unlock_exclusive(mask) };

        debug!(requested = ids.len(), removed = removed.len(), "Removed bodies");
        removed
    }

    /// Unlink and drop bodies
    pub fn destroy_bodies(&self, ids: &[BodyId]) {
        drop(self.remove_bodies(ids));
    }

    pub fn set_body_activation_listener(&self, listener: Option<Arc<dyn BodyActivationListener>>) {
        *self.activation_listener.write() = listener;
    }

    pub fn body_activation_listener(&self) -> Option<Arc<dyn BodyActivationListener>> {
        self.activation_listener.read().clone()
    }

    /// Activate bodies, locking them through `locks`
    pub fn activate_bodies(&self, ids: &[BodyId], locks: &dyn BodyLockInterface) {
        let mut lock = BodyLockMultiWrite::new(locks, ids);
        self.activate_locked(&mut lock, None);
    }

    /// Deactivate bodies, locking them through `locks`
    pub fn deactivate_bodies(&self, ids: &[BodyId], locks: &dyn BodyLockInterface) {
        let mut lock = BodyLockMultiWrite::new(locks, ids);
        self.deactivate_locked(&mut lock, None);
    }

    /// Activate the locked bodies.
    ///
    /// The sleep timer is restarted for every non-static body. Bodies not yet
    /// in the active set are appended and reported to the activation listener.
    pub(crate) fn activate_locked(
        &self,
        lock: &mut BodyLockMultiWrite<'_>,
        permit: Option<&ActivationPermit>,
    ) {
        debug_assert!(
            permit.is_some() || !self.active_bodies_frozen.load(Ordering::Relaxed),
            "activating bodies while the active set is frozen"
        );

        let _active = self.active_mutex.lock();
        let listener = self.activation_listener.read().clone();
        for i in 0..lock.len() {
            if let Some(body) = lock.body_mut(i) {
                self.activate_body_internal(body, listener.as_deref());
            }
        }
    }

    pub(crate) fn deactivate_locked(
        &self,
        lock: &mut BodyLockMultiWrite<'_>,
        permit: Option<&ActivationPermit>,
    ) {
        debug_assert!(
            permit.is_some() || !self.active_bodies_frozen.load(Ordering::Relaxed),
            "deactivating bodies while the active set is frozen"
        );

        let _active = self.active_mutex.lock();
        let listener = self.activation_listener.read().clone();
        for i in 0..lock.len() {
            if let Some(body) = lock.body_mut(i) {
                self.deactivate_body_internal(body, listener.as_deref());
            }
        }
    }

    /// Activate a single body the caller has locked for writing
    pub(crate) fn activate_body_locked(&self, body: &mut Body, permit: Option<&ActivationPermit>) {
        debug_assert!(
            permit.is_some() || !self.active_bodies_frozen.load(Ordering::Relaxed),
            "activating bodies while the active set is frozen"
        );

        let _active = self.active_mutex.lock();
        let listener = self.activation_listener.read().clone();
        self.activate_body_internal(body, listener.as_deref());
    }

    /// Deactivate a single body the caller has locked for writing
    pub(crate) fn deactivate_body_locked(&self, body: &mut Body, permit: Option<&ActivationPermit>) {
        debug_assert!(
            permit.is_some() || !self.active_bodies_frozen.load(Ordering::Relaxed),
            "deactivating bodies while the active set is frozen"
        );

        let _active = self.active_mutex.lock();
        let listener = self.activation_listener.read().clone();
        self.deactivate_body_internal(body, listener.as_deref());
    }

    fn activate_body_internal(&self, body: &mut Body, listener: Option<&dyn BodyActivationListener>) {
        if body.is_static() || body.motion_properties().is_none() {
            return;
        }

        body.reset_sleep_timer();

        let id = body.id();
        let slot = &self.active_index[id.index() as usize];
        if slot.load(Ordering::Relaxed) != INACTIVE_INDEX {
            return;
        }

        // Publish the entry before the new count
        let count = self.num_active.load(Ordering::Relaxed);
        self.active_ids[count as usize].store(id.to_raw(), Ordering::Relaxed);
        slot.store(count, Ordering::Relaxed);
        self.num_active.store(count + 1, Ordering::Release);

        trace!(%id, "Activated body");
        if let Some(listener) = listener {
            listener.on_body_activated(id, body.user_data());
        }
    }

    fn deactivate_body_internal(
        &self,
        body: &mut Body,
        listener: Option<&dyn BodyActivationListener>,
    ) {
        if body.is_static() || body.motion_properties().is_none() {
            return;
        }

        let id = body.id();
        let slot = &self.active_index[id.index() as usize];
        let index = slot.load(Ordering::Relaxed);
        if index == INACTIVE_INDEX {
            return;
        }

        // Swap the last active body into the freed entry and fix its back index
        let last = self.num_active.load(Ordering::Relaxed) - 1;
        if index != last {
            let moved = self.active_ids[last as usize].load(Ordering::Relaxed);
            self.active_ids[index as usize].store(moved, Ordering::Relaxed);
            self.active_index[BodyId::from_raw(moved).index() as usize]
                .store(index, Ordering::Relaxed);
        }
        self.active_ids[last as usize].store(BodyId::INVALID.to_raw(), Ordering::Relaxed);
        slot.store(INACTIVE_INDEX, Ordering::Relaxed);
        self.num_active.store(last, Ordering::Release);

        body.set_linear_velocity(Vec3::ZERO);
        body.set_angular_velocity(Vec3::ZERO);

        trace!(%id, "Deactivated body");
        if let Some(listener) = listener {
            listener.on_body_deactivated(id, body.user_data());
        }
    }

    /// Whether `id` names a registered body in the active set
    pub fn is_active(&self, id: BodyId) -> bool {
        self.active_index_of(id).is_some()
    }

    /// Position of the body in the active array
    pub fn active_index_of(&self, id: BodyId) -> Option<u32> {
        if !id.is_valid() || id.index() >= self.max_bodies() {
            return None;
        }
        let index = self.active_index[id.index() as usize].load(Ordering::Relaxed);
        if index == INACTIVE_INDEX {
            return None;
        }
        let stored = self.active_ids[index as usize].load(Ordering::Relaxed);
        (stored == id.to_raw()).then_some(index)
    }

    /// Number of active bodies, readable without taking the active-body mutex
    pub fn num_active_bodies(&self) -> u32 {
        self.num_active.load(Ordering::Acquire)
    }

    /// Copy of the active set, taken under the active-body mutex
    pub fn active_bodies(&self) -> Vec<BodyId> {
        let _active = self.active_mutex.lock();
        self.active_bodies_unlocked()
    }

    /// Copy of the active set without taking the mutex.
    ///
    /// The count is read with acquire ordering, pairing with the release store
    /// made after an entry is written, so every entry below it is complete.
    /// Only valid while nobody deactivates bodies concurrently.
    pub(crate) fn active_bodies_unlocked(&self) -> Vec<BodyId> {
        let count = self.num_active.load(Ordering::Acquire) as usize;
        self.active_ids[..count]
            .iter()
            .map(|raw| BodyId::from_raw(raw.load(Ordering::Relaxed)))
            .collect()
    }

    /// Active body at `index`, read without the active-body mutex.
    ///
    /// Entries below a count obtained from [`BodyManager::num_active_bodies`]
    /// are fully written. Concurrent deactivation may move or clear entries, in
    /// which case the result is a different active body or [`BodyId::INVALID`].
    pub fn active_body_at(&self, index: u32) -> BodyId {
        BodyId::from_raw(self.active_ids[index as usize].load(Ordering::Relaxed))
    }

    /// Mark the active set as frozen until the guard drops. While frozen,
    /// (de)activation needs an [`ActivationPermit`].
    pub(crate) fn freeze_active_bodies(&self) -> ActiveBodiesFrozen<'_> {
        self.active_bodies_frozen.store(true, Ordering::Relaxed);
        ActiveBodiesFrozen { manager: self }
    }

    /// Ids of all registered bodies
    pub fn body_ids(&self) -> Vec<BodyId> {
        let slots = self.slots.lock();
        slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| **entry == SlotEntry::Occupied)
            .map(|(index, _)| BodyId::new(index as u32, slots.sequence_numbers[index]))
            .collect()
    }

    pub fn body_mutexes(&self) -> &MutexArray {
        &self.body_mutexes
    }

    pub fn mutex_for_body(&self, id: BodyId) -> &BodyMutex {
        self.body_mutexes.mutex_for(id.index())
    }

    /// Stripes covering the valid ids in `ids`
    pub fn mutex_mask(&self, ids: &[BodyId]) -> MutexMask {
        if ids.len() >= self.body_mutexes.num_mutexes() {
            return self.body_mutexes.full_mask();
        }
        ids.iter()
            .filter(|id| id.is_valid())
            .fold(MutexMask::NONE, |mask, id| {
                mask.with_stripe(self.body_mutexes.mutex_index(id.index()))
            })
    }

    /// Resolve an id to its body.
    ///
    /// The caller must hold the body's stripe, or otherwise guarantee that the
    /// body is neither removed nor mutated while the pointer is used.
    pub(crate) fn try_get_body_ptr(&self, id: BodyId) -> Option<NonNull<Body>> {
        if !id.is_valid() || id.index() >= self.max_bodies() {
            return None;
        }
        let body = NonNull::new(self.bodies[id.index() as usize].load(Ordering::Acquire))?;
        // SAFETY: per this function's contract the body cannot be freed or written
        // while we look at its id.
        let stored = unsafe { body.as_ref().id };
        (stored == id).then_some(body)
    }

    /// Lock every body stripe and the slot table, in that order
    pub fn lock_all_bodies(&self) -> AllBodiesLock<'_> {
        self.body_mutexes.lock_all();
        let slots = self.slots.lock();
        AllBodiesLock {
            manager: self,
            _slots: slots,
        }
    }

    pub fn body_stats(&self) -> BodyStats {
        let all = self.lock_all_bodies();
        let mut stats = BodyStats {
            max_bodies: self.max_bodies(),
            ..Default::default()
        };

        for body in all.bodies() {
            stats.num_bodies += 1;
            let active = self.is_active(body.id());
            match body.motion_type() {
                MotionType::Static => stats.num_bodies_static += 1,
                MotionType::Dynamic => {
                    stats.num_bodies_dynamic += 1;
                    stats.num_active_bodies_dynamic += u32::from(active);
                }
                MotionType::Kinematic => {
                    stats.num_bodies_kinematic += 1;
                    stats.num_active_bodies_kinematic += u32::from(active);
                }
            }
        }
        stats
    }

    /// Live bodies, free list length and slot array size
    pub fn slot_stats(&self) -> SlotStats {
        let slots = self.slots.lock();
        SlotStats {
            num_bodies: slots.num_bodies,
            free_list_len: slots.free_list_len() as u32,
            slot_array_size: slots.entries.len() as u32,
        }
    }

    /// Debug check that every slot is either live or reachable from the free list
    pub fn validate_free_list(&self) {
        let stats = self.slot_stats();
        debug_assert_eq!(
            stats.num_bodies + stats.free_list_len,
            stats.slot_array_size,
            "free list is corrupt: {stats:?}"
        );
    }

    /// Ids of bodies whose cached bounds disagree with their shape and transform
    pub fn validate_body_bounds(&self) -> Vec<BodyId> {
        let all = self.lock_all_bodies();
        let mismatched: Vec<BodyId> = all
            .bodies()
            .filter(|body| !body.bounds().abs_diff_eq(&body.calculate_world_bounds(), 1.0e-4))
            .map(Body::id)
            .collect();
        if !mismatched.is_empty() {
            warn!(count = mismatched.len(), "Bodies with stale bounds");
        }
        mismatched
    }
}

impl Drop for BodyManager {
    fn drop(&mut self) {
        for slot in self.bodies.iter() {
            let body = slot.swap(ptr::null_mut(), Ordering::Acquire);
            if !body.is_null() {
                // SAFETY: every non-null pointer came from `Box::into_raw` and we
                // have exclusive access during drop.
                drop(unsafe { Box::from_raw(body) });
            }
        }
    }
}

/// All body stripes and the slot table held at once, for operations that
/// need a stable view of every body
pub struct AllBodiesLock<'a> {
    manager: &'a BodyManager,
    _slots: MutexGuard<'a, SlotTable>,
}

impl AllBodiesLock<'_> {
    pub fn bodies(&self) -> impl Iterator<Item = &Body> + '_ {
        self.manager.bodies.iter().filter_map(|slot| {
            let body = slot.load(Ordering::Acquire);
            // SAFETY: every stripe is held exclusively by this guard
            unsafe { body.as_ref() }
        })
    }
}

impl Drop for AllBodiesLock<'_> {
    fn drop(&mut self) {
        // SAFETY: `lock_all_bodies` locked every stripe
        unsafe { self.manager.body_mutexes.unlock_all() };
    }
}

/// Keeps the active set frozen; see [`BodyManager::freeze_active_bodies`]
pub(crate) struct ActiveBodiesFrozen<'a> {
    manager: &'a BodyManager,
}

impl Drop for ActiveBodiesFrozen<'_> {
    fn drop(&mut self) {
        self.manager
            .active_bodies_frozen
            .store(false, Ordering::Relaxed);
    }
}
