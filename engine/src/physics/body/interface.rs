//! Public body API
//!
//! Every operation follows the same sequence: lock the body, check that the id
//! still resolves, read or mutate, tell the broad phase about moved or
//! re-layered bodies and finally activate when asked to.

use super::body::Body;
use super::create_info::BodyCreateInfo;
use super::id::BodyId;
use super::lock::{BodyLockMultiRead, BodyLockMultiWrite, BodyLockRead, BodyLockWrite};
use super::lock_interface::BodyLockInterface;
use super::manager::{BodyError, BodyManager};
use super::motion::{MotionQuality, MotionType};
use crate::physics::collision::broad_phase::{AddState, BroadPhase, BroadPhaseBody};
use crate::physics::collision::layers::{BroadPhaseLayer, CollisionLayer};
use crate::physics::collision::shapes::ShapeRef;
use crate::physics::collision::AABB;
use glam::{Mat3, Mat4, Quat, Vec3};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether an operation should wake the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Activate,
    DontActivate,
}

/// Positions and rotations closer than this are treated as unchanged
pub const TRANSFORM_TOLERANCE: f32 = 1.0e-6;

const NEAR_ZERO_SQ: f32 = 1.0e-12;

fn is_near_zero(v: Vec3) -> bool {
    v.length_squared() <= NEAR_ZERO_SQ
}

/// Facade over the body manager, a lock policy and the broad phase
pub struct BodyInterface {
    locks: Box<dyn BodyLockInterface>,
    body_manager: Arc<BodyManager>,
    broad_phase: Arc<dyn BroadPhase>,
}

impl BodyInterface {
    pub fn new(
        locks: Box<dyn BodyLockInterface>,
        body_manager: Arc<BodyManager>,
        broad_phase: Arc<dyn BroadPhase>,
    ) -> Self {
        Self {
            locks,
            body_manager,
            broad_phase,
        }
    }

    pub fn lock_interface(&self) -> &dyn BodyLockInterface {
        self.locks.as_ref()
    }

    pub fn body_manager(&self) -> &BodyManager {
        &self.body_manager
    }

    fn read<R>(&self, id: BodyId, f: impl FnOnce(&Body) -> R) -> Option<R> {
        let lock = BodyLockRead::new(self.locks.as_ref(), id);
        lock.body().map(f)
    }

    fn write<R>(&self, id: BodyId, f: impl FnOnce(&mut Body) -> R) -> Option<R> {
        let mut lock = BodyLockWrite::new(self.locks.as_ref(), id);
        lock.body_mut().map(f)
    }

    fn notify_bounds_changed(&self, body: &Body) {
        if body.is_in_broad_phase() {
            self.broad_phase
                .notify_bodies_aabb_changed(&[body.broad_phase_proxy()]);
        }
    }

    fn activate_if(&self, body: &mut Body, activation: Activation) {
        if activation == Activation::Activate && !body.is_static() {
            self.body_manager.activate_body_locked(body, None);
        }
    }

    fn wake_if_moving(&self, body: &mut Body) {
        if body.is_static() || self.body_manager.is_active(body.id()) {
            return;
        }
        if !is_near_zero(body.linear_velocity()) || !is_near_zero(body.angular_velocity()) {
            self.body_manager.activate_body_locked(body, None);
        }
    }

    // Creation and destruction

    /// Allocate and register a body. Nothing is leaked when registration fails.
    pub fn create_body(&self, info: &BodyCreateInfo) -> Result<BodyId, BodyError> {
        let body = self.body_manager.allocate_body(info);
        self.body_manager.add_body(body)
    }

    pub fn create_body_with_id(&self, id: BodyId, info: &BodyCreateInfo) -> Result<BodyId, BodyError> {
        let body = self.body_manager.allocate_body(info);
        self.body_manager.add_body_with_custom_id(body, id)
    }

    /// Allocate a body without registering it; see [`BodyInterface::assign_body_id`]
    pub fn create_body_without_id(&self, info: &BodyCreateInfo) -> Box<Body> {
        self.body_manager.allocate_body(info)
    }

    /// Drop a body that was never registered or has been unassigned
    pub fn destroy_body_without_id(&self, body: Box<Body>) {
        debug_assert!(!body.id().is_valid(), "body {} is still registered", body.id());
        drop(body);
    }

    /// Register a previously allocated or unassigned body; hands it back on failure
    pub fn assign_body_id(&self, body: Box<Body>) -> Result<BodyId, (BodyError, Box<Body>)> {
        self.body_manager.try_add_body(body)
    }

    pub fn assign_body_id_with(
        &self,
        body: Box<Body>,
        id: BodyId,
    ) -> Result<BodyId, (BodyError, Box<Body>)> {
        self.body_manager.try_add_body_with_custom_id(body, id)
    }

    /// Unlink a body from its slot and return ownership. The body must be
    /// removed from the broad phase first.
    pub fn unassign_body_id(&self, id: BodyId) -> Option<Box<Body>> {
        self.body_manager.remove_bodies(&[id]).pop()
    }

    pub fn unassign_body_ids(&self, ids: &[BodyId]) -> Vec<Box<Body>> {
        self.body_manager.remove_bodies(ids)
    }

    /// Unlink and drop a body. The body must be removed from the broad phase first.
    pub fn destroy_body(&self, id: BodyId) {
        self.body_manager.destroy_bodies(&[id]);
    }

    pub fn destroy_bodies(&self, ids: &[BodyId]) {
        self.body_manager.destroy_bodies(ids);
    }

    // Broad phase membership

    /// Insert a body into the broad phase and optionally activate it
    pub fn add_body(&self, id: BodyId, activation: Activation) {
        let mut ids = [id];
        let state = self.add_bodies_prepare(&mut ids);
        self.add_bodies_finalize(&ids, state, activation);
    }

    pub fn create_and_add_body(
        &self,
        info: &BodyCreateInfo,
        activation: Activation,
    ) -> Result<BodyId, BodyError> {
        let id = self.create_body(info)?;
        self.add_body(id, activation);
        Ok(id)
    }

    /// First half of a batch insert. Reorders `ids`; pass the same slice to
    /// [`BodyInterface::add_bodies_finalize`] or [`BodyInterface::add_bodies_abort`].
    pub fn add_bodies_prepare(&self, ids: &mut [BodyId]) -> AddState {
        let mut proxies: Vec<BroadPhaseBody> = {
            let lock = BodyLockMultiRead::new(self.locks.as_ref(), ids);
            (0..lock.len())
                .filter_map(|i| lock.body(i))
                .filter(|body| {
                    debug_assert!(!body.is_in_broad_phase(), "body {} already added", body.id());
                    !body.is_in_broad_phase()
                })
                .map(Body::broad_phase_proxy)
                .collect()
        };

        let state = self.broad_phase.add_bodies_prepare(&mut proxies);

        // Mirror the broad phase order; ids that were skipped go last
        let skipped: Vec<BodyId> = ids
            .iter()
            .copied()
            .filter(|id| !proxies.iter().any(|proxy| proxy.id == *id))
            .collect();
        for (slot, id) in ids
            .iter_mut()
            .zip(proxies.iter().map(|proxy| proxy.id).chain(skipped))
        {
            *slot = id;
        }

        state
    }

    /// Second half of a batch insert: publish to the broad phase, then activate.
    ///
    /// Only bodies the broad phase actually inserted are marked as added (and
    /// activated); the rest stay out as if never added.
    pub fn add_bodies_finalize(&self, ids: &[BodyId], state: AddState, activation: Activation) {
        let mut lock = BodyLockMultiWrite::new(self.locks.as_ref(), ids);
        let inserted: HashSet<BodyId> = self.broad_phase.add_bodies_finalize(state).into_iter().collect();

        for i in 0..lock.len() {
            let Some(body) = lock.body_mut(i) else {
                continue;
            };
            if !inserted.contains(&body.id()) {
                continue;
            }
            body.set_in_broad_phase(true);
            if activation == Activation::Activate {
                self.body_manager.activate_body_locked(body, None);
            }
        }

        if inserted.len() < ids.len() {
            warn!(
                requested = ids.len(),
                inserted = inserted.len(),
                "Broad phase rejected some bodies"
            );
        }
        debug!(count = inserted.len(), "Added bodies to broad phase");
    }

    /// Discard a prepared batch; the bodies stay out of the broad phase
    pub fn add_bodies_abort(&self, ids: &[BodyId], state: AddState) {
        self.broad_phase.add_bodies_abort(state);
        debug!(count = ids.len(), "Aborted adding bodies");
    }

    /// Take a body out of the broad phase and deactivate it
    pub fn remove_body(&self, id: BodyId) {
        self.remove_bodies(&[id]);
    }

    pub fn remove_bodies(&self, ids: &[BodyId]) {
        let mut lock = BodyLockMultiWrite::new(self.locks.as_ref(), ids);
        let mut removed = Vec::with_capacity(ids.len());
        for i in 0..lock.len() {
            if let Some(body) = lock.body_mut(i) {
                if body.is_in_broad_phase() {
                    body.set_in_broad_phase(false);
                    removed.push(body.id());
                }
            }
        }
        self.broad_phase.remove_bodies(&removed);
        self.body_manager.deactivate_locked(&mut lock, None);
        debug!(count = removed.len(), "Removed bodies from broad phase");
    }

    pub fn is_added(&self, id: BodyId) -> bool {
        BodyLockRead::new(self.locks.as_ref(), id).succeeded_and_is_in_broad_phase()
    }

    // Activation

    pub fn activate_body(&self, id: BodyId) {
        self.activate_bodies(&[id]);
    }

    pub fn activate_bodies(&self, ids: &[BodyId]) {
        self.body_manager.activate_bodies(ids, self.locks.as_ref());
    }

    /// Activate every body whose bounds overlap `bounds`
    pub fn activate_bodies_in_aabox(
        &self,
        bounds: &AABB,
        broad_phase_filter: &dyn Fn(BroadPhaseLayer) -> bool,
        layer_filter: &dyn Fn(CollisionLayer) -> bool,
    ) {
        let mut ids = Vec::new();
        self.broad_phase
            .collide_aabox(bounds, broad_phase_filter, &mut |proxy| {
                if layer_filter(proxy.collision_layer) {
                    ids.push(proxy.id);
                }
            });
        self.activate_bodies(&ids);
    }

    pub fn deactivate_body(&self, id: BodyId) {
        self.deactivate_bodies(&[id]);
    }

    pub fn deactivate_bodies(&self, ids: &[BodyId]) {
        self.body_manager.deactivate_bodies(ids, self.locks.as_ref());
    }

    pub fn is_active(&self, id: BodyId) -> bool {
        self.read(id, |body| self.body_manager.is_active(body.id()))
            .unwrap_or(false)
    }

    // Shape and layers

    pub fn get_shape(&self, id: BodyId) -> Option<ShapeRef> {
        self.read(id, |body| body.shape().clone())
    }

    /// Replace the shape. Passing the body's current shape does nothing; use
    /// [`BodyInterface::notify_shape_changed`] after mutating a shared shape.
    pub fn set_shape(
        &self,
        id: BodyId,
        shape: ShapeRef,
        update_mass_properties: bool,
        activation: Activation,
    ) {
        self.write(id, |body| {
            if Arc::ptr_eq(body.shape(), &shape) {
                return;
            }
            body.set_shape_internal(shape);
            if update_mass_properties {
                body.recalculate_mass_properties();
            }
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    /// Refresh bounds (and optionally mass) after the body's shape was changed in place
    pub fn notify_shape_changed(&self, id: BodyId, update_mass_properties: bool, activation: Activation) {
        self.write(id, |body| {
            body.update_bounds();
            if update_mass_properties {
                body.recalculate_mass_properties();
            }
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    pub fn set_collision_layer(&self, id: BodyId, layer: CollisionLayer) {
        self.write(id, |body| {
            if body.collision_layer() == layer {
                return;
            }
            let broad_phase_layer = self.body_manager.broad_phase_layer(layer);
            body.set_collision_layer_internal(layer, broad_phase_layer);
            if body.is_in_broad_phase() {
                self.broad_phase
                    .notify_bodies_layer_changed(&[body.broad_phase_proxy()]);
            }
        });
    }

    pub fn get_collision_layer(&self, id: BodyId) -> CollisionLayer {
        self.read(id, Body::collision_layer).unwrap_or_default()
    }

    // Transform

    pub fn set_position_and_rotation(
        &self,
        id: BodyId,
        position: Vec3,
        rotation: Quat,
        activation: Activation,
    ) {
        self.write(id, |body| {
            body.set_position_and_rotation_internal(position, rotation);
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    /// Like [`BodyInterface::set_position_and_rotation`] but does nothing when
    /// both differ by at most [`TRANSFORM_TOLERANCE`] per component (`q` and
    /// `-q` are the same rotation)
    pub fn set_position_and_rotation_when_changed(
        &self,
        id: BodyId,
        position: Vec3,
        rotation: Quat,
        activation: Activation,
    ) {
        let rotation = rotation.normalize();
        self.write(id, |body| {
            let same_position = body.position().abs_diff_eq(position, TRANSFORM_TOLERANCE);
            let same_rotation = body.rotation().abs_diff_eq(rotation, TRANSFORM_TOLERANCE)
                || body.rotation().abs_diff_eq(-rotation, TRANSFORM_TOLERANCE);
            if same_position && same_rotation {
                return;
            }
            body.set_position_and_rotation_internal(position, rotation);
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    pub fn get_position_and_rotation(&self, id: BodyId) -> (Vec3, Quat) {
        self.read(id, |body| (body.position(), body.rotation()))
            .unwrap_or((Vec3::ZERO, Quat::IDENTITY))
    }

    pub fn set_position(&self, id: BodyId, position: Vec3, activation: Activation) {
        self.write(id, |body| {
            let rotation = body.rotation();
            body.set_position_and_rotation_internal(position, rotation);
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    pub fn get_position(&self, id: BodyId) -> Vec3 {
        self.read(id, Body::position).unwrap_or(Vec3::ZERO)
    }

    pub fn get_center_of_mass_position(&self, id: BodyId) -> Vec3 {
        self.read(id, Body::center_of_mass_position)
            .unwrap_or(Vec3::ZERO)
    }

    pub fn set_rotation(&self, id: BodyId, rotation: Quat, activation: Activation) {
        self.write(id, |body| {
            let position = body.position();
            body.set_position_and_rotation_internal(position, rotation);
            self.notify_bounds_changed(body);
            self.activate_if(body, activation);
        });
    }

    pub fn get_rotation(&self, id: BodyId) -> Quat {
        self.read(id, Body::rotation).unwrap_or(Quat::IDENTITY)
    }

    pub fn get_world_transform(&self, id: BodyId) -> Mat4 {
        self.read(id, Body::world_transform)
            .unwrap_or(Mat4::IDENTITY)
    }

    /// Move a kinematic body to a target transform over `delta_time` by setting its velocities
    pub fn move_kinematic(&self, id: BodyId, target_position: Vec3, target_rotation: Quat, delta_time: f32) {
        self.write(id, |body| {
            body.move_kinematic(target_position, target_rotation, delta_time);
            self.wake_if_moving(body);
        });
    }

    // Velocity

    pub fn set_linear_and_angular_velocity(&self, id: BodyId, linear: Vec3, angular: Vec3) {
        self.write(id, |body| {
            body.set_linear_velocity_clamped(linear);
            body.set_angular_velocity_clamped(angular);
            self.wake_if_moving(body);
        });
    }

    pub fn get_linear_and_angular_velocity(&self, id: BodyId) -> (Vec3, Vec3) {
        self.read(id, |body| (body.linear_velocity(), body.angular_velocity()))
            .unwrap_or((Vec3::ZERO, Vec3::ZERO))
    }

    pub fn set_linear_velocity(&self, id: BodyId, velocity: Vec3) {
        self.write(id, |body| {
            body.set_linear_velocity_clamped(velocity);
            self.wake_if_moving(body);
        });
    }

    pub fn get_linear_velocity(&self, id: BodyId) -> Vec3 {
        self.read(id, Body::linear_velocity).unwrap_or(Vec3::ZERO)
    }

    pub fn add_linear_velocity(&self, id: BodyId, velocity: Vec3) {
        self.write(id, |body| {
            body.set_linear_velocity_clamped(body.linear_velocity() + velocity);
            self.wake_if_moving(body);
        });
    }

    pub fn add_linear_and_angular_velocity(&self, id: BodyId, linear: Vec3, angular: Vec3) {
        self.write(id, |body| {
            body.set_linear_velocity_clamped(body.linear_velocity() + linear);
            body.set_angular_velocity_clamped(body.angular_velocity() + angular);
            self.wake_if_moving(body);
        });
    }

    pub fn set_angular_velocity(&self, id: BodyId, velocity: Vec3) {
        self.write(id, |body| {
            body.set_angular_velocity_clamped(velocity);
            self.wake_if_moving(body);
        });
    }

    pub fn get_angular_velocity(&self, id: BodyId) -> Vec3 {
        self.read(id, Body::angular_velocity).unwrap_or(Vec3::ZERO)
    }

    /// Velocity of a world space point attached to the body
    pub fn get_point_velocity(&self, id: BodyId, point: Vec3) -> Vec3 {
        self.read(id, |body| body.point_velocity(point))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn set_position_rotation_and_velocity(
        &self,
        id: BodyId,
        position: Vec3,
        rotation: Quat,
        linear: Vec3,
        angular: Vec3,
    ) {
        self.write(id, |body| {
            body.set_position_and_rotation_internal(position, rotation);
            self.notify_bounds_changed(body);
            body.set_linear_velocity_clamped(linear);
            body.set_angular_velocity_clamped(angular);
            self.wake_if_moving(body);
        });
    }

    // Forces and impulses. All of these only affect dynamic bodies.

    fn apply_to_dynamic(&self, id: BodyId, wake: bool, f: impl FnOnce(&mut Body)) {
        self.write(id, |body| {
            if !body.is_dynamic() {
                return;
            }
            f(body);
            if wake && !self.body_manager.is_active(body.id()) {
                self.body_manager.activate_body_locked(body, None);
            }
        });
    }

    pub fn add_force(&self, id: BodyId, force: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(force), |body| body.add_force(force));
    }

    pub fn add_force_at(&self, id: BodyId, force: Vec3, point: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(force), |body| {
            body.add_force_at(force, point)
        });
    }

    pub fn add_torque(&self, id: BodyId, torque: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(torque), |body| body.add_torque(torque));
    }

    pub fn add_force_and_torque(&self, id: BodyId, force: Vec3, torque: Vec3) {
        let wake = !is_near_zero(force) || !is_near_zero(torque);
        self.apply_to_dynamic(id, wake, |body| {
            body.add_force(force);
            body.add_torque(torque);
        });
    }

    pub fn add_impulse(&self, id: BodyId, impulse: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(impulse), |body| {
            body.add_impulse(impulse)
        });
    }

    pub fn add_impulse_at(&self, id: BodyId, impulse: Vec3, point: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(impulse), |body| {
            body.add_impulse_at(impulse, point)
        });
    }

    pub fn add_angular_impulse(&self, id: BodyId, impulse: Vec3) {
        self.apply_to_dynamic(id, !is_near_zero(impulse), |body| {
            body.add_angular_impulse(impulse)
        });
    }

    // Motion type and quality

    /// Switch motion type. Bodies created static without
    /// `allow_dynamic_or_kinematic` cannot become kinematic or dynamic.
    pub fn set_motion_type(&self, id: BodyId, motion_type: MotionType, activation: Activation) {
        self.write(id, |body| {
            if body.motion_type() == motion_type {
                return;
            }
            if motion_type != MotionType::Static && !body.can_be_kinematic_or_dynamic() {
                warn!(%id, "Body was created static without motion properties");
                return;
            }
            if motion_type == MotionType::Static {
                self.body_manager.deactivate_body_locked(body, None);
            }
            body.set_motion_type_internal(motion_type);
            self.activate_if(body, activation);
        });
    }

    pub fn get_motion_type(&self, id: BodyId) -> MotionType {
        self.read(id, Body::motion_type).unwrap_or_default()
    }

    pub fn set_motion_quality(&self, id: BodyId, quality: MotionQuality) {
        self.write(id, |body| body.set_motion_quality_internal(quality));
    }

    pub fn get_motion_quality(&self, id: BodyId) -> MotionQuality {
        self.read(id, Body::motion_quality).unwrap_or_default()
    }

    /// World space inverse inertia; zero for non-dynamic bodies
    pub fn get_inverse_inertia(&self, id: BodyId) -> Mat3 {
        self.read(id, Body::inverse_inertia_world)
            .unwrap_or(Mat3::ZERO)
    }

    // Material and user data

    pub fn set_friction(&self, id: BodyId, friction: f32) {
        self.write(id, |body| body.set_friction(friction));
    }

    pub fn get_friction(&self, id: BodyId) -> f32 {
        self.read(id, Body::friction).unwrap_or(0.0)
    }

    pub fn set_restitution(&self, id: BodyId, restitution: f32) {
        self.write(id, |body| body.set_restitution(restitution));
    }

    pub fn get_restitution(&self, id: BodyId) -> f32 {
        self.read(id, Body::restitution).unwrap_or(0.0)
    }

    pub fn set_gravity_factor(&self, id: BodyId, gravity_factor: f32) {
        self.write(id, |body| {
            if let Some(motion) = body.motion_properties_mut() {
                motion.gravity_factor = gravity_factor;
            }
        });
    }

    pub fn get_gravity_factor(&self, id: BodyId) -> f32 {
        self.read(id, |body| {
            body.motion_properties()
                .map_or(1.0, |motion| motion.gravity_factor())
        })
        .unwrap_or(1.0)
    }

    pub fn set_user_data(&self, id: BodyId, user_data: u64) {
        self.write(id, |body| body.set_user_data(user_data));
    }

    pub fn get_user_data(&self, id: BodyId) -> u64 {
        self.read(id, Body::user_data).unwrap_or(0)
    }
}
