//! The physics scene
//!
//! [`PhysicsScene`] owns the body manager, the broad phase, user constraints
//! and the contact cache, and advances the simulation. Every collision step
//! runs the same ordered stages:
//!
//! 1. step listeners
//! 2. active constraints (their sleeping bodies are woken)
//! 3. gravity, forces and damping
//! 4. velocity setup of the active constraints
//! 5. islands from constraints
//! 6. collision finding, in parallel, waking sleeping bodies that are hit
//! 7. contact callbacks and contact constraints
//! 8. island velocity solve and integration
//! 9. kinematic integration
//! 10. continuous collision for `LinearCast` bodies
//! 11. contact removed callbacks
//! 12. island position solve, write back, broad phase update
//! 13. sleeping
//!
//! The active set is frozen from stage 2 on; only the scene, holding an
//! [`ActivationPermit`], changes it until the step ends.

use crate::config::{ConfigError, LayerFilters, PhysicsSettings, SceneConfig};
use crate::physics::body::{
    ActivationPermit, Body, BodyActivationListener, BodyId, BodyInterface, BodyLockInterface,
    BodyLockInterfaceLocking, BodyLockInterfaceNoLock, BodyLockMultiRead, BodyLockMultiWrite,
    BodyLockRead, BodyLockWrite, BodyManager, MotionQuality, MotionType, SleepState,
};
use crate::physics::collision::broad_phase::{BroadPhase, BroadPhaseBody, SweepAndPruneBroadPhase};
use crate::physics::collision::contact_listener::{
    BodyPair, CachedContact, ContactCache, ContactListener, ContactSettings,
};
use crate::physics::collision::layers::{CollisionGroup, CollisionLayer};
use crate::physics::collision::narrow_phase::{self, CollideInput};
use crate::physics::collision::shapes::ShapeRef;
use crate::physics::collision::{Contact, AABB};
use crate::physics::constraints::{
    integrate_rotation, pair_mut, Constraint, ConstraintId, ConstraintManager, ContactConstraint,
    SolverBody,
};
use crate::physics::island::{Island, IslandBuilder};
use crate::physics::step_listener::{PhysicsStepListener, StepContext};
use bitflags::bitflags;
use glam::{Quat, Vec3};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

bitflags! {
    /// Capacity problems hit during [`PhysicsScene::update`]. The step still
    /// completes; the affected contacts are dropped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateErrors: u8 {
        /// More touching pairs than `max_body_pairs`
        const BODY_PAIR_CACHE_FULL = 1 << 0;
        /// More contacts than `max_contact_constraints`
        const CONTACT_CONSTRAINTS_FULL = 1 << 1;
    }
}

/// A rigid body simulation
pub struct PhysicsScene {
    config: SceneConfig,
    filters: LayerFilters,
    body_manager: Arc<BodyManager>,
    broad_phase: Arc<dyn BroadPhase>,
    body_interface: BodyInterface,
    body_interface_no_lock: BodyInterface,
    constraints: ConstraintManager,
    contact_cache: ContactCache,
    contact_listener: Option<Arc<dyn ContactListener>>,
    step_listeners: Vec<Arc<dyn PhysicsStepListener>>,
}

impl PhysicsScene {
    /// Create a scene with the built-in sweep and prune broad phase
    pub fn new(config: &SceneConfig, filters: LayerFilters) -> Result<Self, ConfigError> {
        let num_layers = filters.broad_phase_layer_interface.num_broad_phase_layers();
        Self::with_broad_phase(config, filters, Arc::new(SweepAndPruneBroadPhase::new(num_layers)))
    }

    pub fn with_broad_phase(
        config: &SceneConfig,
        filters: LayerFilters,
        broad_phase: Arc<dyn BroadPhase>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let body_manager = Arc::new(BodyManager::new(
            config.max_bodies,
            config.num_body_mutexes,
            filters.broad_phase_layer_interface.clone(),
        ));
        let body_interface = BodyInterface::new(
            Box::new(BodyLockInterfaceLocking::new(body_manager.clone())),
            body_manager.clone(),
            broad_phase.clone(),
        );
        // SAFETY: only reachable through `body_interface_no_lock`, which passes
        // the same contract on to its caller
        let no_lock = unsafe { BodyLockInterfaceNoLock::new(body_manager.clone()) };
        let body_interface_no_lock =
            BodyInterface::new(Box::new(no_lock), body_manager.clone(), broad_phase.clone());

        info!(
            max_bodies = config.max_bodies,
            body_mutexes = body_manager.body_mutexes().num_mutexes(),
            max_body_pairs = config.max_body_pairs,
            max_contact_constraints = config.max_contact_constraints,
            "Created physics scene"
        );

        Ok(Self {
            contact_cache: ContactCache::new(config.max_body_pairs as usize),
            config: config.clone(),
            filters,
            body_manager,
            broad_phase,
            body_interface,
            body_interface_no_lock,
            constraints: ConstraintManager::new(),
            contact_listener: None,
            step_listeners: Vec::new(),
        })
    }

    /// Body interface that locks every body it touches
    pub fn body_interface(&self) -> &BodyInterface {
        &self.body_interface
    }

    /// Body interface that takes no locks.
    ///
    /// # Safety
    ///
    /// While the returned interface is in use no other thread may access any
    /// body of this scene, through any interface, and the scene must not be
    /// updated.
    pub unsafe fn body_interface_no_lock(&self) -> &BodyInterface {
        &self.body_interface_no_lock
    }

    pub fn body_manager(&self) -> &Arc<BodyManager> {
        &self.body_manager
    }

    pub fn broad_phase(&self) -> &Arc<dyn BroadPhase> {
        &self.broad_phase
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn settings(&self) -> &PhysicsSettings {
        &self.config.physics
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.config.physics.gravity = gravity;
        debug!(?gravity, "Physics gravity set");
    }

    pub fn gravity(&self) -> Vec3 {
        self.config.physics.gravity
    }

    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) -> ConstraintId {
        let [a, b] = constraint.body_ids();
        let id = self.constraints.add(constraint);
        debug!(?id, body_a = %a, body_b = %b, "Added constraint");
        id
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Option<Box<dyn Constraint>> {
        self.constraints.remove(id)
    }

    pub fn constraints(&self) -> &ConstraintManager {
        &self.constraints
    }

    pub fn set_contact_listener(&mut self, listener: Option<Arc<dyn ContactListener>>) {
        self.contact_listener = listener;
    }

    pub fn set_body_activation_listener(&self, listener: Option<Arc<dyn BodyActivationListener>>) {
        self.body_manager.set_body_activation_listener(listener);
    }

    pub fn add_step_listener(&mut self, listener: Arc<dyn PhysicsStepListener>) {
        self.step_listeners.push(listener);
    }

    /// Returns whether the listener was registered
    pub fn remove_step_listener(&mut self, listener: &Arc<dyn PhysicsStepListener>) -> bool {
        let before = self.step_listeners.len();
        self.step_listeners
            .retain(|registered| !Arc::ptr_eq(registered, listener));
        self.step_listeners.len() != before
    }

    /// Rebuild the broad phase for faster queries. Holds every body lock.
    pub fn optimize_broad_phase(&self) {
        let _all = self.body_manager.lock_all_bodies();
        self.broad_phase.optimize();
        debug!(bodies = self.broad_phase.num_bodies(), "Optimized broad phase");
    }

    /// Touching pairs found by the last step, including pairs kept while asleep
    pub fn num_contact_pairs(&self) -> usize {
        self.contact_cache.num_pairs()
    }

    /// Advance the simulation by `delta_time`, split into `collision_steps`
    /// equal steps. Does nothing for zero steps or a non-positive time.
    pub fn update(&mut self, delta_time: f32, collision_steps: u32) -> UpdateErrors {
        let mut errors = UpdateErrors::empty();
        if collision_steps == 0 || delta_time.is_nan() || delta_time <= 0.0 {
            return errors;
        }

        let step_delta = delta_time / collision_steps as f32;
        for step in 0..collision_steps {
            let context = StepContext {
                delta_time: step_delta,
                is_first_step: step == 0,
                is_last_step: step + 1 == collision_steps,
                body_interface: &self.body_interface,
            };
            for listener in &self.step_listeners {
                listener.on_step(&context);
            }
            errors |= self.step(step_delta);
        }

        if !errors.is_empty() {
            warn!(?errors, "Physics update ran out of capacity");
        }
        errors
    }

    fn step(&mut self, delta_time: f32) -> UpdateErrors {
        let Self {
            config,
            filters,
            body_manager,
            broad_phase,
            body_interface,
            constraints,
            contact_cache,
            contact_listener,
            ..
        } = self;
        let settings = &config.physics;
        let locks = body_interface.lock_interface();
        let body_manager: &BodyManager = body_manager;
        let mut errors = UpdateErrors::empty();

        let _frozen = body_manager.freeze_active_bodies();
        let permit = ActivationPermit::new();

        // Constraints touching an active body wake the other side
        let mut active_constraints = constraints.active_constraints_mut(|id| body_manager.is_active(id));
        let constraint_bodies: Vec<[BodyId; 2]> = active_constraints
            .iter()
            .map(|constraint| constraint.body_ids())
            .collect();
        let mut sleeping: Vec<BodyId> = constraint_bodies
            .iter()
            .flatten()
            .copied()
            .filter(|id| id.is_valid() && !body_manager.is_active(*id))
            .collect();
        if !sleeping.is_empty() {
            sleeping.sort();
            sleeping.dedup();
            let mut lock = BodyLockMultiWrite::new(locks, &sleeping);
            body_manager.activate_locked(&mut lock, Some(&permit));
        }

        let active = body_manager.active_bodies();

        let gravity = settings.gravity;
        let dynamic: Vec<BodyId> = active
            .par_iter()
            .filter_map(|&id| {
                let mut lock = BodyLockWrite::new(locks, id);
                let body = lock.body_mut()?;
                if !body.is_dynamic() {
                    return None;
                }
                body.apply_force_torque_and_drag(gravity, delta_time);
                Some(id)
            })
            .collect();

        active_constraints.par_iter_mut().for_each(|constraint| {
            let [a, b] = constraint.body_ids();
            constraint.setup_velocity(&solver_body(locks, a), &solver_body(locks, b), delta_time);
        });

        let mut builder = IslandBuilder::new(&dynamic);
        for [a, b] in &constraint_bodies {
            builder.link(*a, *b);
        }

        contact_cache.begin_step();
        let collision = CollisionContext {
            locks,
            broad_phase: &**broad_phase,
            filters,
            body_manager,
            margin: settings.speculative_contact_distance,
        };
        let mut found = find_collisions(&collision, settings, &mut builder, &permit);

        // Deduplicate, report and turn into constraints
        found.sort_by_key(|contact| BodyPair::new(contact.body_a, contact.body_b));
        let mut seen: HashSet<BodyPair> = HashSet::with_capacity(found.len());
        let mut contact_constraints: Vec<ContactConstraint> = Vec::new();
        let max_contact_constraints = config.max_contact_constraints as usize;
        for contact in &found {
            let pair = BodyPair::new(contact.body_a, contact.body_b);
            if !seen.insert(pair) {
                continue;
            }
            let previous = contact_cache.previous(&pair).copied();

            let contact_settings = {
                let lock = BodyLockMultiRead::new(locks, &[contact.body_a, contact.body_b]);
                let (Some(a), Some(b)) = (lock.body(0), lock.body(1)) else {
                    continue;
                };
                if !contact_cache.insert(pair, CachedContact::new(contact.normal)) {
                    errors |= UpdateErrors::BODY_PAIR_CACHE_FULL;
                    continue;
                }
                let mut contact_settings = ContactSettings::combine(a, b);
                if let Some(listener) = contact_listener.as_deref() {
                    if previous.is_some() {
                        listener.on_contact_persisted(a, b, contact, &mut contact_settings);
                    } else {
                        listener.on_contact_added(a, b, contact, &mut contact_settings);
                    }
                }
                contact_settings
            };

            if contact_settings.is_sensor {
                continue;
            }
            builder.link(contact.body_a, contact.body_b);
            if contact_constraints.len() >= max_contact_constraints {
                errors |= UpdateErrors::CONTACT_CONSTRAINTS_FULL;
                continue;
            }
            let mut constraint =
                ContactConstraint::new(contact, &contact_settings, settings.min_velocity_for_restitution);
            if let Some(cached) = previous {
                constraint = constraint.with_cached_impulses(&cached);
            }
            contact_constraints.push(constraint);
        }

        // Pairs of sleeping bodies are not searched; keep them so they are not reported as removed
        for pair in contact_cache.removed_pairs() {
            let asleep = [pair.a, pair.b].iter().all(|id| {
                !body_manager.is_active(*id)
                    && BodyLockRead::new(locks, *id).succeeded_and_is_in_broad_phase()
            });
            if asleep && !contact_cache.carry_over(&pair) {
                errors |= UpdateErrors::BODY_PAIR_CACHE_FULL;
            }
        }
        let removed = contact_cache.removed_pairs();

        let islands = builder.finalize();
        let num_contacts = contact_constraints.len();

        // User constraints were set up before collision finding
        let mut solver_constraints: Vec<(&mut (dyn Constraint + 'static), bool)> =
            Vec::with_capacity(active_constraints.len() + contact_constraints.len());
        solver_constraints.extend(
            active_constraints
                .iter_mut()
                .map(|constraint| (&mut ***constraint, true)),
        );
        for constraint in contact_constraints.iter_mut() {
            solver_constraints.push((constraint, false));
        }

        let mut works: Vec<IslandWork<'_>> = islands.iter().map(IslandWork::new).collect();
        for (constraint, prepared) in solver_constraints {
            let [a, b] = constraint.body_ids();
            let Some(island) = islands.island_of(a).or_else(|| islands.island_of(b)) else {
                continue;
            };
            works[island].add_constraint(a, b, constraint, prepared);
        }

        works
            .par_iter_mut()
            .for_each(|work| work.gather(locks, settings));
        works
            .par_iter_mut()
            .for_each(|work| work.solve_velocity(delta_time));

        let kinematic_moved: Vec<BroadPhaseBody> = active
            .par_iter()
            .filter_map(|&id| {
                let mut lock = BodyLockWrite::new(locks, id);
                let body = lock.body_mut()?;
                if !body.is_kinematic() {
                    return None;
                }
                let linear = body.linear_velocity();
                let angular = body.angular_velocity();
                if linear == Vec3::ZERO && angular == Vec3::ZERO {
                    return None;
                }
                let position = body.position() + linear * delta_time;
                let rotation = integrate_rotation(body.rotation(), angular * delta_time);
                body.set_position_and_rotation_internal(position, rotation);
                body.is_in_broad_phase().then(|| body.broad_phase_proxy())
            })
            .collect();

        works
            .par_iter_mut()
            .for_each(|work| work.resolve_ccd(&collision, settings.linear_cast_threshold));

        if let Some(listener) = contact_listener.as_deref() {
            for pair in &removed {
                listener.on_contact_removed(*pair);
            }
        }

        let (baumgarte, slop) = (settings.baumgarte, settings.penetration_slop);
        works
            .par_iter_mut()
            .for_each(|work| work.solve_position(baumgarte, slop));

        let mut moved: Vec<BroadPhaseBody> = works
            .par_iter()
            .flat_map_iter(|work| work.scatter(locks))
            .collect();
        drop(works);
        moved.extend(kinematic_moved);

        for constraint in &contact_constraints {
            let (normal, tangent, bitangent) = constraint.impulses();
            contact_cache.store_impulses(&constraint.pair(), normal, tangent, bitangent);
        }
        if !moved.is_empty() {
            broad_phase.notify_bodies_aabb_changed(&moved);
        }

        let mut num_sleeping = 0;
        if settings.allow_sleeping {
            let max_movement = settings.point_velocity_sleep_threshold * settings.time_before_sleep;
            let time_before_sleep = settings.time_before_sleep;
            let update_sleep = |id: BodyId| {
                let mut lock = BodyLockWrite::new(locks, id);
                lock.body_mut().map_or(SleepState::Awake, |body| {
                    body.update_sleep_state(delta_time, max_movement, time_before_sleep)
                })
            };

            let mut sleepy: Vec<BodyId> = islands
                .as_slice()
                .par_iter()
                .flat_map_iter(|island: &Island| {
                    // Every member is updated; the island sleeps only as a whole
                    let can_sleep = island
                        .bodies
                        .iter()
                        .fold(true, |all, id| (update_sleep(*id) == SleepState::CanSleep) && all);
                    if can_sleep {
                        island.bodies.clone()
                    } else {
                        Vec::new()
                    }
                })
                .collect();
            for id in &active {
                if islands.island_of(*id).is_some() {
                    continue;
                }
                let is_kinematic = BodyLockRead::new(locks, *id)
                    .body()
                    .is_some_and(Body::is_kinematic);
                if is_kinematic && update_sleep(*id) == SleepState::CanSleep {
                    sleepy.push(*id);
                }
            }

            if !sleepy.is_empty() {
                num_sleeping = sleepy.len();
                let mut lock = BodyLockMultiWrite::new(locks, &sleepy);
                body_manager.deactivate_locked(&mut lock, Some(&permit));
            }
        }

        debug!(
            active = active.len(),
            islands = islands.len(),
            contacts = num_contacts,
            removed = removed.len(),
            moved = moved.len(),
            sleeping = num_sleeping,
            "Physics step"
        );
        errors
    }
}

/// Shared read-only state of the collision and CCD stages
struct CollisionContext<'a> {
    locks: &'a dyn BodyLockInterface,
    broad_phase: &'a dyn BroadPhase,
    filters: &'a LayerFilters,
    body_manager: &'a BodyManager,
    margin: f32,
}

/// What collision testing needs from a body, copied under its read lock
struct BodySnapshot {
    id: BodyId,
    shape: ShapeRef,
    position: Vec3,
    rotation: Quat,
    bounds: AABB,
    motion_type: MotionType,
    collision_layer: CollisionLayer,
    collision_group: CollisionGroup,
    is_sensor: bool,
}

impl BodySnapshot {
    fn new(body: &Body) -> Self {
        Self {
            id: body.id(),
            shape: body.shape().clone(),
            position: body.position(),
            rotation: body.rotation(),
            bounds: *body.bounds(),
            motion_type: body.motion_type(),
            collision_layer: body.collision_layer(),
            collision_group: body.collision_group(),
            is_sensor: body.is_sensor(),
        }
    }

    fn collide_input(&self) -> CollideInput<'_> {
        CollideInput {
            id: self.id,
            shape: &self.shape,
            position: self.position,
            rotation: self.rotation,
        }
    }
}

/// A narrow phase hit and the sleeping body it should wake
struct FoundContact {
    contact: Contact,
    wake: Option<BodyId>,
}

impl CollisionContext<'_> {
    fn snapshot(&self, id: BodyId) -> Option<BodySnapshot> {
        let lock = BodyLockRead::new(self.locks, id);
        lock.body()
            .filter(|body| body.is_in_broad_phase())
            .map(BodySnapshot::new)
    }

    /// Bodies overlapping `bounds` that `layer` may collide with. The broad
    /// phase lock is held while collecting, so no body is locked here.
    fn candidates(&self, layer: CollisionLayer, bounds: &AABB, exclude: BodyId) -> Vec<BodyId> {
        let layer_filter = &*self.filters.object_vs_broad_phase_layer_filter;
        let pair_filter = &*self.filters.object_layer_pair_filter;
        let mut candidates = Vec::new();
        self.broad_phase.collide_aabox(
            bounds,
            &|broad_phase_layer| layer_filter.should_collide(layer, broad_phase_layer),
            &mut |proxy| {
                if proxy.id != exclude && pair_filter.should_collide(layer, proxy.collision_layer) {
                    candidates.push(proxy.id);
                }
            },
        );
        candidates
    }

    /// Collide one moving body against everything near it.
    ///
    /// Bodies handled in an earlier pass are skipped, as is the higher id of a
    /// pair where both bodies move in this pass.
    fn collide_body(
        &self,
        id: BodyId,
        earlier: &HashSet<BodyId>,
        current: &HashSet<BodyId>,
        found: &mut Vec<FoundContact>,
    ) {
        let Some(a) = self.snapshot(id) else {
            return;
        };
        let query = a.bounds.expanded(self.margin);
        for other in self.candidates(a.collision_layer, &query, a.id) {
            if earlier.contains(&other) || (current.contains(&other) && other < a.id) {
                continue;
            }
            let Some(b) = self.snapshot(other) else {
                continue;
            };
            if a.motion_type != MotionType::Dynamic && b.motion_type != MotionType::Dynamic {
                continue;
            }
            if !a.collision_group.can_collide(&b.collision_group) {
                continue;
            }
            let Some(contact) = narrow_phase::collide(&a.collide_input(), &b.collide_input(), self.margin)
            else {
                continue;
            };

            let wake = (b.motion_type == MotionType::Dynamic
                && !a.is_sensor
                && !b.is_sensor
                && !self.body_manager.is_active(b.id))
            .then_some(b.id);
            trace!(body_a = %a.id, body_b = %b.id, penetration = contact.penetration, "Contact");
            found.push(FoundContact { contact, wake });
        }
    }
}

/// Solver view of a body outside any island; the world when `id` does not resolve
fn solver_body(locks: &dyn BodyLockInterface, id: BodyId) -> SolverBody {
    BodyLockRead::new(locks, id)
        .body()
        .map_or_else(SolverBody::fixed, SolverBody::from_body)
}

fn collision_workers(max_collision_workers: u32) -> usize {
    let threads = rayon::current_num_threads();
    match max_collision_workers {
        0 => threads,
        max => threads.min(max as usize),
    }
    .max(1)
}

/// Find contacts for the active bodies. Sleeping bodies that get hit are
/// activated and searched in a further pass, until nothing new wakes up.
fn find_collisions(
    context: &CollisionContext<'_>,
    settings: &PhysicsSettings,
    builder: &mut IslandBuilder,
    permit: &ActivationPermit,
) -> Vec<Contact> {
    let workers = collision_workers(settings.max_collision_workers);
    let mut earlier: HashSet<BodyId> = HashSet::new();

    // The set is frozen, so the published count and its entries are read
    // without the active-body mutex
    let manager = context.body_manager;
    let mut movers: Vec<BodyId> = (0..manager.num_active_bodies())
        .into_par_iter()
        .map(|index| manager.active_body_at(index))
        .collect();
    let mut contacts = Vec::new();
    let mut passes = 0;

    while !movers.is_empty() {
        passes += 1;
        let current: HashSet<BodyId> = movers.iter().copied().collect();
        let chunk_size = movers.len().div_ceil(workers).max(1);
        let found: Vec<FoundContact> = movers
            .par_chunks(chunk_size)
            .flat_map_iter(|chunk| {
                let mut found = Vec::new();
                for id in chunk {
                    context.collide_body(*id, &earlier, &current, &mut found);
                }
                found
            })
            .collect();

        let mut woken: Vec<BodyId> = found
            .iter()
            .filter_map(|contact| contact.wake)
            .filter(|id| !current.contains(id) && !earlier.contains(id))
            .collect();
        woken.sort();
        woken.dedup();

        earlier.extend(current);
        contacts.extend(found.into_iter().map(|found| found.contact));

        if !woken.is_empty() {
            let mut lock = BodyLockMultiWrite::new(context.locks, &woken);
            context.body_manager.activate_locked(&mut lock, Some(permit));
            drop(lock);
            for id in &woken {
                builder.add_body(*id);
            }
            debug!(count = woken.len(), "Woke bodies hit by active bodies");
        }
        movers = woken;
    }

    trace!(passes, contacts = contacts.len(), "Collision finding done");
    contacts
}

/// A `LinearCast` body and where it started the step
struct CcdBody {
    local: usize,
    start_position: Vec3,
    start_bounds: AABB,
    inner_radius: f32,
    shape: ShapeRef,
    collision_layer: CollisionLayer,
    collision_group: CollisionGroup,
}

/// Solver state of one island.
///
/// `bodies[0]` is the world, `bodies[1..=num_members]` are the island's
/// dynamic bodies and anything after them is a non-dynamic participant.
struct IslandWork<'c> {
    ids: Vec<BodyId>,
    index_of: HashMap<BodyId, usize>,
    num_members: usize,
    bodies: Vec<SolverBody>,
    /// Local body indices, the constraint, and whether its velocity setup already ran
    constraints: Vec<(usize, usize, &'c mut (dyn Constraint + 'static), bool)>,
    ccd: Vec<CcdBody>,
    velocity_steps: u32,
    position_steps: u32,
}

impl<'c> IslandWork<'c> {
    fn new(island: &Island) -> Self {
        let mut ids = Vec::with_capacity(island.bodies.len() + 1);
        ids.push(BodyId::INVALID);
        ids.extend_from_slice(&island.bodies);
        let index_of = island
            .bodies
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index + 1))
            .collect();
        Self {
            ids,
            index_of,
            num_members: island.bodies.len(),
            bodies: Vec::new(),
            constraints: Vec::new(),
            ccd: Vec::new(),
            velocity_steps: 0,
            position_steps: 0,
        }
    }

    fn local_index(&mut self, id: BodyId) -> usize {
        if !id.is_valid() {
            return 0;
        }
        if let Some(index) = self.index_of.get(&id) {
            return *index;
        }
        self.ids.push(id);
        let index = self.ids.len() - 1;
        self.index_of.insert(id, index);
        index
    }

    fn add_constraint(
        &mut self,
        a: BodyId,
        b: BodyId,
        constraint: &'c mut (dyn Constraint + 'static),
        prepared: bool,
    ) {
        let local_a = self.local_index(a);
        let local_b = self.local_index(b);
        if local_a != local_b {
            self.constraints.push((local_a, local_b, constraint, prepared));
        }
    }

    /// Copy the participating bodies into solver bodies
    fn gather(&mut self, locks: &dyn BodyLockInterface, settings: &PhysicsSettings) {
        let mut bodies = Vec::with_capacity(self.ids.len());
        bodies.push(SolverBody::fixed());
        let mut velocity_steps = 0;
        let mut position_steps = 0;

        for (index, id) in self.ids.iter().enumerate().skip(1) {
            let lock = BodyLockRead::new(locks, *id);
            let Some(body) = lock.body() else {
                bodies.push(SolverBody::fixed());
                continue;
            };
            let mut solver = SolverBody::from_body(body);

            if index <= self.num_members {
                if let Some(motion) = body.motion_properties() {
                    velocity_steps = velocity_steps.max(motion.num_velocity_steps(settings.num_velocity_steps));
                    position_steps = position_steps.max(motion.num_position_steps(settings.num_position_steps));
                }
                if body.motion_quality() == MotionQuality::LinearCast && !body.is_sensor() {
                    self.ccd.push(CcdBody {
                        local: index,
                        start_position: body.position(),
                        start_bounds: *body.bounds(),
                        inner_radius: body.shape().inner_radius(),
                        shape: body.shape().clone(),
                        collision_layer: body.collision_layer(),
                        collision_group: body.collision_group(),
                    });
                }
            } else {
                // Owned by another island or not simulated; read only
                solver.is_dynamic = false;
            }
            bodies.push(solver);
        }

        self.bodies = bodies;
        self.velocity_steps = if velocity_steps == 0 { settings.num_velocity_steps } else { velocity_steps };
        self.position_steps = if position_steps == 0 { settings.num_position_steps } else { position_steps };
    }

    fn solve_velocity(&mut self, delta_time: f32) {
        let bodies = &mut self.bodies;
        for (a, b, constraint, _) in self.constraints.iter_mut().filter(|entry| !entry.3) {
            let (body_a, body_b) = pair_mut(bodies, *a, *b);
            constraint.setup_velocity(body_a, body_b, delta_time);
        }
        for (a, b, constraint, _) in self.constraints.iter_mut() {
            let (body_a, body_b) = pair_mut(bodies, *a, *b);
            constraint.warm_start(body_a, body_b);
        }
        for _ in 0..self.velocity_steps {
            let mut applied = false;
            for (a, b, constraint, _) in self.constraints.iter_mut() {
                let (body_a, body_b) = pair_mut(bodies, *a, *b);
                applied |= constraint.solve_velocity(body_a, body_b);
            }
            if !applied {
                break;
            }
        }

        for body in &mut bodies[1..=self.num_members] {
            body.integrate(delta_time);
        }
    }

    /// Pull fast bodies back to the first static or kinematic body their
    /// swept bounds hit and cancel the velocity into it
    fn resolve_ccd(&mut self, context: &CollisionContext<'_>, linear_cast_threshold: f32) {
        for ccd in &self.ccd {
            let id = self.bodies[ccd.local].id;
            let displacement = self.bodies[ccd.local].position - ccd.start_position;
            let distance = displacement.length();
            if distance <= linear_cast_threshold * ccd.inner_radius {
                continue;
            }

            let layer_filter = &*context.filters.object_vs_broad_phase_layer_filter;
            let pair_filter = &*context.filters.object_layer_pair_filter;
            let mut hits: Vec<(BodyId, f32)> = Vec::new();
            context.broad_phase.cast_aabox(
                &ccd.start_bounds,
                displacement,
                &|broad_phase_layer| layer_filter.should_collide(ccd.collision_layer, broad_phase_layer),
                &mut |proxy, fraction| {
                    if proxy.id != id
                        && fraction > 0.0
                        && pair_filter.should_collide(ccd.collision_layer, proxy.collision_layer)
                    {
                        hits.push((proxy.id, fraction));
                    }
                },
            );
            hits.sort_by(|a, b| a.1.total_cmp(&b.1));

            let first = hits.into_iter().find_map(|(other, fraction)| {
                let other = context.snapshot(other)?;
                (other.motion_type != MotionType::Dynamic
                    && !other.is_sensor
                    && ccd.collision_group.can_collide(&other.collision_group))
                .then_some((other, fraction))
            });
            let Some((other, fraction)) = first else {
                continue;
            };

            let body = &mut self.bodies[ccd.local];
            body.position = ccd.start_position + displacement * fraction;
            let input = CollideInput {
                id,
                shape: &ccd.shape,
                position: body.position,
                rotation: body.rotation,
            };
            let normal = narrow_phase::collide(&input, &other.collide_input(), distance)
                .map_or(displacement / distance, |contact| contact.normal);
            let approach = body.linear_velocity.dot(normal);
            if approach > 0.0 {
                body.linear_velocity -= normal * approach;
            }
            trace!(body = %id, hit = %other.id, fraction, "Linear cast hit");
        }
    }

    fn solve_position(&mut self, baumgarte: f32, slop: f32) {
        let bodies = &mut self.bodies;
        for _ in 0..self.position_steps {
            let mut applied = false;
            for (a, b, constraint, _) in self.constraints.iter_mut() {
                let (body_a, body_b) = pair_mut(bodies, *a, *b);
                applied |= constraint.solve_position(body_a, body_b, baumgarte, slop);
            }
            if !applied {
                break;
            }
        }
    }

    /// Write the members back; returns broad phase proxies of the moved bodies
    fn scatter(&self, locks: &dyn BodyLockInterface) -> Vec<BroadPhaseBody> {
        let mut moved = Vec::with_capacity(self.num_members);
        for solver in &self.bodies[1..=self.num_members] {
            if !solver.is_dynamic {
                continue;
            }
            let mut lock = BodyLockWrite::new(locks, solver.id);
            if let Some(body) = lock.body_mut() {
                solver.scatter(body);
                if body.is_in_broad_phase() {
                    moved.push(body.broad_phase_proxy());
                }
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{Activation, BodyCreateInfo};
    use crate::physics::collision::layers::{MOVING, NON_MOVING};
    use crate::physics::collision::shapes::Shape;
    use crate::physics::constraints::DistanceConstraint;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DT: f32 = 1.0 / 60.0;

    fn scene_with(config: SceneConfig) -> PhysicsScene {
        PhysicsScene::new(&config, LayerFilters::two_layer()).expect("valid config")
    }

    fn scene() -> PhysicsScene {
        scene_with(SceneConfig {
            max_bodies: 64,
            num_body_mutexes: 4,
            ..SceneConfig::default()
        })
    }

    fn add_floor(scene: &PhysicsScene) -> BodyId {
        let info = BodyCreateInfo::new(
            Shape::cuboid(Vec3::new(10.0, 0.5, 10.0)),
            Vec3::new(0.0, -0.5, 0.0),
            Quat::IDENTITY,
            MotionType::Static,
            NON_MOVING,
        );
        scene
            .body_interface()
            .create_and_add_body(&info, Activation::DontActivate)
            .expect("capacity")
    }

    fn add_ball(scene: &PhysicsScene, position: Vec3) -> BodyId {
        let info = BodyCreateInfo::new(Shape::sphere(0.5), position, Quat::IDENTITY, MotionType::Dynamic, MOVING);
        scene
            .body_interface()
            .create_and_add_body(&info, Activation::Activate)
            .expect("capacity")
    }

    #[derive(Default)]
    struct CountingContacts {
        added: AtomicU32,
        persisted: AtomicU32,
        removed: AtomicU32,
    }

    impl ContactListener for CountingContacts {
        fn on_contact_added(&self, _a: &Body, _b: &Body, _contact: &Contact, _settings: &mut ContactSettings) {
            self.added.fetch_add(1, Ordering::Relaxed);
        }

        fn on_contact_persisted(&self, _a: &Body, _b: &Body, _contact: &Contact, _settings: &mut ContactSettings) {
            self.persisted.fetch_add(1, Ordering::Relaxed);
        }

        fn on_contact_removed(&self, _pair: BodyPair) {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct CountingSteps {
        steps: AtomicU32,
        first: AtomicU32,
        last: AtomicU32,
    }

    impl PhysicsStepListener for CountingSteps {
        fn on_step(&self, context: &StepContext<'_>) {
            self.steps.fetch_add(1, Ordering::Relaxed);
            if context.is_first_step {
                self.first.fetch_add(1, Ordering::Relaxed);
            }
            if context.is_last_step {
                self.last.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn test_update_without_steps_does_nothing() {
        let mut scene = scene();
        let ball = add_ball(&scene, Vec3::new(0.0, 5.0, 0.0));

        assert!(scene.update(DT, 0).is_empty());
        assert!(scene.update(0.0, 1).is_empty());
        assert!(scene.update(-DT, 1).is_empty());
        assert_eq!(scene.body_interface().get_position(ball), Vec3::new(0.0, 5.0, 0.0));
    }

    #[test]
    fn test_body_falls_under_gravity() {
        let mut scene = scene();
        let ball = add_ball(&scene, Vec3::new(0.0, 10.0, 0.0));

        for _ in 0..60 {
            scene.update(DT, 1);
        }

        let position = scene.body_interface().get_position(ball);
        let velocity = scene.body_interface().get_linear_velocity(ball);
        assert!(position.y > 4.5 && position.y < 5.5, "y = {}", position.y);
        assert!(velocity.y < -9.0, "vy = {}", velocity.y);
        assert_eq!(position.x, 0.0);
    }

    #[test]
    fn test_zero_gravity_keeps_body_in_place() {
        let mut scene = scene();
        scene.set_gravity(Vec3::ZERO);
        let ball = add_ball(&scene, Vec3::new(0.0, 3.0, 0.0));

        scene.update(DT, 1);
        assert_eq!(scene.body_interface().get_position(ball), Vec3::new(0.0, 3.0, 0.0));
    }

    #[test]
    fn test_body_comes_to_rest_and_sleeps() {
        let mut scene = scene();
        add_floor(&scene);
        let ball = add_ball(&scene, Vec3::new(0.0, 1.0, 0.0));

        for _ in 0..180 {
            scene.update(DT, 1);
        }

        let position = scene.body_interface().get_position(ball);
        assert!((position.y - 0.5).abs() < 0.05, "y = {}", position.y);
        assert!(!scene.body_interface().is_active(ball));
        assert_eq!(scene.body_interface().get_linear_velocity(ball), Vec3::ZERO);
        // The pair stays cached while asleep
        assert_eq!(scene.num_contact_pairs(), 1);
    }

    #[test]
    fn test_sleeping_disabled() {
        let mut config = SceneConfig {
            max_bodies: 16,
            ..SceneConfig::default()
        };
        config.physics.allow_sleeping = false;
        let mut scene = scene_with(config);
        add_floor(&scene);
        let ball = add_ball(&scene, Vec3::new(0.0, 0.5, 0.0));

        for _ in 0..120 {
            scene.update(DT, 1);
        }
        assert!(scene.body_interface().is_active(ball));
    }

    #[test]
    fn test_contact_listener_events() {
        let mut scene = scene();
        let listener = Arc::new(CountingContacts::default());
        let registered: Arc<dyn ContactListener> = listener.clone();
        scene.set_contact_listener(Some(registered));
        add_floor(&scene);
        let ball = add_ball(&scene, Vec3::new(0.0, 1.0, 0.0));

        for _ in 0..30 {
            scene.update(DT, 1);
        }
        assert_eq!(listener.added.load(Ordering::Relaxed), 1);
        assert!(listener.persisted.load(Ordering::Relaxed) >= 1);
        assert_eq!(listener.removed.load(Ordering::Relaxed), 0);

        scene.body_interface().remove_body(ball);
        scene.update(DT, 1);
        assert_eq!(listener.removed.load(Ordering::Relaxed), 1);
        assert_eq!(scene.num_contact_pairs(), 0);
    }

    #[test]
    fn test_sleeping_body_is_woken_by_contact() {
        let mut scene = scene();
        add_floor(&scene);
        let lower = add_ball(&scene, Vec3::new(0.0, 0.5, 0.0));
        scene.body_interface().deactivate_body(lower);
        add_ball(&scene, Vec3::new(0.0, 2.0, 0.0));
        assert!(!scene.body_interface().is_active(lower));

        let mut woken = false;
        for _ in 0..60 {
            scene.update(DT, 1);
            woken |= scene.body_interface().is_active(lower);
        }
        assert!(woken);
    }

    #[test]
    fn test_body_pair_cache_full() {
        let mut scene = scene_with(SceneConfig {
            max_bodies: 16,
            max_body_pairs: 1,
            ..SceneConfig::default()
        });
        add_floor(&scene);
        add_ball(&scene, Vec3::new(-2.0, 0.5, 0.0));
        add_ball(&scene, Vec3::new(2.0, 0.5, 0.0));

        let errors = scene.update(DT, 1);
        assert!(errors.contains(UpdateErrors::BODY_PAIR_CACHE_FULL));
        assert_eq!(scene.num_contact_pairs(), 1);
    }

    #[test]
    fn test_contact_constraints_full() {
        let mut scene = scene_with(SceneConfig {
            max_bodies: 16,
            max_contact_constraints: 1,
            ..SceneConfig::default()
        });
        add_floor(&scene);
        add_ball(&scene, Vec3::new(-2.0, 0.5, 0.0));
        add_ball(&scene, Vec3::new(2.0, 0.5, 0.0));

        let errors = scene.update(DT, 1);
        assert!(errors.contains(UpdateErrors::CONTACT_CONSTRAINTS_FULL));
        assert!(!errors.contains(UpdateErrors::BODY_PAIR_CACHE_FULL));
    }

    #[test]
    fn test_distance_constraint_holds_pendulum() {
        let mut scene = scene();
        let bob = add_ball(&scene, Vec3::new(2.0, 5.0, 0.0));
        let anchor = Vec3::new(0.0, 5.0, 0.0);
        scene.add_constraint(Box::new(DistanceConstraint::new(
            BodyId::INVALID,
            bob,
            anchor,
            Vec3::ZERO,
            2.0,
            2.0,
        )));

        for _ in 0..60 {
            scene.update(DT, 1);
        }

        let position = scene.body_interface().get_position(bob);
        assert!(((position - anchor).length() - 2.0).abs() < 0.05);
        assert!(position.y < 5.0);
    }

    /// Records which stage touched it, in order
    #[derive(Debug, Default)]
    struct StageLog(parking_lot::Mutex<Vec<&'static str>>);

    impl StageLog {
        fn push(&self, stage: &'static str) {
            self.0.lock().push(stage);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().clone()
        }
    }

    #[derive(Debug)]
    struct LoggingConstraint {
        bodies: [BodyId; 2],
        log: Arc<StageLog>,
    }

    impl Constraint for LoggingConstraint {
        fn body_ids(&self) -> [BodyId; 2] {
            self.bodies
        }

        fn setup_velocity(&mut self, _a: &SolverBody, _b: &SolverBody, _delta_time: f32) {
            self.log.push("setup");
        }

        fn solve_velocity(&mut self, _a: &mut SolverBody, _b: &mut SolverBody) -> bool {
            false
        }

        fn solve_position(&mut self, _a: &mut SolverBody, _b: &mut SolverBody, _baumgarte: f32, _slop: f32) -> bool {
            false
        }
    }

    struct LoggingContacts(Arc<StageLog>);

    impl ContactListener for LoggingContacts {
        fn on_contact_added(&self, _a: &Body, _b: &Body, _contact: &Contact, _settings: &mut ContactSettings) {
            self.0.push("contact");
        }

        fn on_contact_persisted(&self, _a: &Body, _b: &Body, _contact: &Contact, _settings: &mut ContactSettings) {
            self.0.push("contact");
        }
    }

    #[test]
    fn test_constraint_setup_runs_once_before_collision_finding() {
        let mut scene = scene();
        let log = Arc::new(StageLog::default());
        let listener: Arc<dyn ContactListener> = Arc::new(LoggingContacts(log.clone()));
        scene.set_contact_listener(Some(listener));
        add_floor(&scene);
        let ball = add_ball(&scene, Vec3::new(0.0, 0.5, 0.0));
        scene.add_constraint(Box::new(LoggingConstraint {
            bodies: [BodyId::INVALID, ball],
            log: log.clone(),
        }));

        scene.update(DT, 1);
        assert_eq!(log.entries(), vec!["setup", "contact"]);

        scene.update(DT, 1);
        assert_eq!(log.entries(), vec!["setup", "contact", "setup", "contact"]);
    }

    #[test]
    fn test_step_listeners_run_every_collision_step() {
        let mut scene = scene();
        let listener = Arc::new(CountingSteps::default());
        let registered: Arc<dyn PhysicsStepListener> = listener.clone();
        scene.add_step_listener(registered.clone());

        scene.update(DT, 3);
        assert_eq!(listener.steps.load(Ordering::Relaxed), 3);
        assert_eq!(listener.first.load(Ordering::Relaxed), 1);
        assert_eq!(listener.last.load(Ordering::Relaxed), 1);

        assert!(scene.remove_step_listener(&registered));
        scene.update(DT, 1);
        assert_eq!(listener.steps.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_linear_cast_stops_at_floor() {
        let mut scene = scene();
        scene.set_gravity(Vec3::ZERO);
        let floor = BodyCreateInfo::new(
            Shape::cuboid(Vec3::new(10.0, 0.05, 10.0)),
            Vec3::ZERO,
            Quat::IDENTITY,
            MotionType::Static,
            NON_MOVING,
        );
        scene
            .body_interface()
            .create_and_add_body(&floor, Activation::DontActivate)
            .expect("capacity");
        let mut bullet = BodyCreateInfo::new(
            Shape::sphere(0.1),
            Vec3::new(0.0, 1.0, 0.0),
            Quat::IDENTITY,
            MotionType::Dynamic,
            MOVING,
        );
        bullet.motion_quality = MotionQuality::LinearCast;
        bullet.linear_velocity = Vec3::new(0.0, -120.0, 0.0);
        bullet.linear_damping = 0.0;
        let bullet = scene
            .body_interface()
            .create_and_add_body(&bullet, Activation::Activate)
            .expect("capacity");

        scene.update(DT, 1);

        let position = scene.body_interface().get_position(bullet);
        assert!(position.y > 0.1, "y = {}", position.y);
        assert!(scene.body_interface().get_linear_velocity(bullet).y > -1.0);
    }

    #[test]
    fn test_kinematic_body_moves_with_its_velocity() {
        let mut scene = scene();
        let info = BodyCreateInfo::new(
            Shape::cuboid(Vec3::splat(0.5)),
            Vec3::ZERO,
            Quat::IDENTITY,
            MotionType::Kinematic,
            MOVING,
        );
        let platform = scene
            .body_interface()
            .create_and_add_body(&info, Activation::Activate)
            .expect("capacity");
        scene
            .body_interface()
            .move_kinematic(platform, Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY, DT);

        scene.update(DT, 1);

        let position = scene.body_interface().get_position(platform);
        assert!((position.x - 1.0).abs() < 1e-4);
        assert_eq!(position.y, 0.0);
    }

    #[test]
    fn test_optimize_broad_phase_keeps_bodies() {
        let scene = scene();
        add_floor(&scene);
        add_ball(&scene, Vec3::new(0.0, 3.0, 0.0));
        scene.optimize_broad_phase();
        assert_eq!(scene.broad_phase().num_bodies(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SceneConfig {
            max_bodies: 0,
            ..SceneConfig::default()
        };
        assert!(matches!(
            PhysicsScene::new(&config, LayerFilters::two_layer()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
