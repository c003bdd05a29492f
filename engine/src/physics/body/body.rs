//! Rigid bodies

use super::create_info::BodyCreateInfo;
use super::id::BodyId;
use super::motion::{MotionProperties, MotionQuality, MotionType, SleepState};
use crate::physics::collision::layers::{BroadPhaseLayer, CollisionGroup, CollisionLayer};
use crate::physics::collision::shapes::{MassProperties, ShapeRef};
use crate::physics::collision::broad_phase::BroadPhaseBody;
use crate::physics::collision::AABB;
use bitflags::bitflags;
use glam::{Mat3, Mat4, Quat, Vec3};

bitflags! {
    /// Boolean state of a body
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BodyFlags: u8 {
        const IN_BROAD_PHASE = 1 << 0;
        const IS_SENSOR = 1 << 1;
        const USE_MANIFOLD_REDUCTION = 1 << 2;
        const APPLY_GYROSCOPIC_FORCE = 1 << 3;
        const ENHANCED_INTERNAL_EDGE_REMOVAL = 1 << 4;
    }
}

/// A simulated rigid entity.
///
/// Static bodies carry no [`MotionProperties`] unless they were created with
/// `allow_dynamic_or_kinematic`, which keeps the (common) static case small.
#[derive(Debug)]
pub struct Body {
    pub(crate) id: BodyId,
    position: Vec3,
    rotation: Quat,
    bounds: AABB,
    shape: ShapeRef,
    collision_layer: CollisionLayer,
    broad_phase_layer: BroadPhaseLayer,
    collision_group: CollisionGroup,
    motion_type: MotionType,
    motion: Option<Box<MotionProperties>>,
    friction: f32,
    restitution: f32,
    density: f32,
    user_data: u64,
    flags: BodyFlags,
}

impl Body {
    /// Build an unregistered body; its id stays invalid until a manager adds it
    pub(crate) fn from_create_info(info: &BodyCreateInfo, broad_phase_layer: BroadPhaseLayer) -> Self {
        let motion = info.has_mass_properties().then(|| {
            let mut motion = MotionProperties::new();
            motion.linear_damping = info.linear_damping;
            motion.angular_damping = info.angular_damping;
            motion.max_linear_velocity = info.max_linear_velocity;
            motion.max_angular_velocity = info.max_angular_velocity;
            motion.gravity_factor = info.gravity_factor;
            motion.motion_quality = info.motion_quality;
            motion.allowed_dofs = info.allowed_dofs;
            motion.num_velocity_steps_override = info.num_velocity_steps_override;
            motion.num_position_steps_override = info.num_position_steps_override;
            motion.allow_sleeping = info.allow_sleeping;
            Box::new(motion)
        });

        let mut flags = BodyFlags::empty();
        flags.set(BodyFlags::IS_SENSOR, info.is_sensor);
        flags.set(BodyFlags::USE_MANIFOLD_REDUCTION, info.use_manifold_reduction);
        flags.set(BodyFlags::APPLY_GYROSCOPIC_FORCE, info.apply_gyroscopic_force);
        flags.set(
            BodyFlags::ENHANCED_INTERNAL_EDGE_REMOVAL,
            info.enhanced_internal_edge_removal,
        );

        let rotation = info.rotation.normalize();
        let mut body = Self {
            id: BodyId::INVALID,
            position: info.position,
            rotation,
            bounds: info.shape.world_bounds(info.position, rotation),
            shape: info.shape.clone(),
            collision_layer: info.collision_layer,
            broad_phase_layer,
            collision_group: info.collision_group,
            motion_type: info.motion_type,
            motion,
            friction: info.friction,
            restitution: info.restitution,
            density: info.density,
            user_data: info.user_data,
            flags,
        };

        if body.motion.is_some() {
            body.set_mass_properties(&info.resolved_mass_properties());
            let points = body.sleep_test_points();
            if let Some(motion) = body.motion.as_deref_mut() {
                motion.reset_sleep_test_spheres(&points);
            }
            if body.motion_type != MotionType::Static {
                body.set_linear_velocity_clamped(info.linear_velocity);
                body.set_angular_velocity_clamped(info.angular_velocity);
            }
        }

        body
    }

    pub fn id(&self) -> BodyId {
        self.id
    }

    pub fn is_static(&self) -> bool {
        self.motion_type == MotionType::Static
    }

    pub fn is_kinematic(&self) -> bool {
        self.motion_type == MotionType::Kinematic
    }

    pub fn is_dynamic(&self) -> bool {
        self.motion_type == MotionType::Dynamic
    }

    pub fn motion_type(&self) -> MotionType {
        self.motion_type
    }

    /// Whether the body could switch to kinematic or dynamic
    pub fn can_be_kinematic_or_dynamic(&self) -> bool {
        self.motion.is_some()
    }

    pub fn is_in_broad_phase(&self) -> bool {
        self.flags.contains(BodyFlags::IN_BROAD_PHASE)
    }

    pub(crate) fn set_in_broad_phase(&mut self, in_broad_phase: bool) {
        self.flags.set(BodyFlags::IN_BROAD_PHASE, in_broad_phase);
    }

    pub fn is_sensor(&self) -> bool {
        self.flags.contains(BodyFlags::IS_SENSOR)
    }

    pub fn flags(&self) -> BodyFlags {
        self.flags
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    /// Shapes are centered on their center of mass, so this equals [`Body::position`]
    pub fn center_of_mass_position(&self) -> Vec3 {
        self.position
    }

    pub fn world_transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn bounds(&self) -> &AABB {
        &self.bounds
    }

    pub fn shape(&self) -> &ShapeRef {
        &self.shape
    }

    pub fn collision_layer(&self) -> CollisionLayer {
        self.collision_layer
    }

    pub fn broad_phase_layer(&self) -> BroadPhaseLayer {
        self.broad_phase_layer
    }

    pub fn collision_group(&self) -> CollisionGroup {
        self.collision_group
    }

    pub fn set_collision_group(&mut self, group: CollisionGroup) {
        self.collision_group = group;
    }

    pub fn friction(&self) -> f32 {
        self.friction
    }

    pub fn set_friction(&mut self, friction: f32) {
        self.friction = friction;
    }

    pub fn restitution(&self) -> f32 {
        self.restitution
    }

    pub fn set_restitution(&mut self, restitution: f32) {
        self.restitution = restitution;
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    pub fn motion_properties(&self) -> Option<&MotionProperties> {
        self.motion.as_deref()
    }

    pub fn motion_properties_mut(&mut self) -> Option<&mut MotionProperties> {
        self.motion.as_deref_mut()
    }

    pub fn motion_quality(&self) -> MotionQuality {
        self.motion
            .as_deref()
            .map_or(MotionQuality::Discrete, MotionProperties::motion_quality)
    }

    pub fn linear_velocity(&self) -> Vec3 {
        match (&self.motion, self.motion_type) {
            (Some(motion), MotionType::Kinematic | MotionType::Dynamic) => motion.linear_velocity,
            _ => Vec3::ZERO,
        }
    }

    pub fn angular_velocity(&self) -> Vec3 {
        match (&self.motion, self.motion_type) {
            (Some(motion), MotionType::Kinematic | MotionType::Dynamic) => motion.angular_velocity,
            _ => Vec3::ZERO,
        }
    }

    /// Velocity of a world space point attached to the body
    pub fn point_velocity(&self, point: Vec3) -> Vec3 {
        self.linear_velocity() + self.angular_velocity().cross(point - self.position)
    }

    /// Set linear velocity; ignored for static bodies
    pub fn set_linear_velocity(&mut self, velocity: Vec3) {
        if let Some(motion) = self.moving_motion_mut() {
            motion.linear_velocity = velocity;
        }
    }

    pub fn set_linear_velocity_clamped(&mut self, velocity: Vec3) {
        if let Some(motion) = self.moving_motion_mut() {
            motion.set_linear_velocity_clamped(velocity);
        }
    }

    /// Set angular velocity; ignored for static bodies
    pub fn set_angular_velocity(&mut self, velocity: Vec3) {
        if let Some(motion) = self.moving_motion_mut() {
            motion.angular_velocity = velocity;
        }
    }

    pub fn set_angular_velocity_clamped(&mut self, velocity: Vec3) {
        if let Some(motion) = self.moving_motion_mut() {
            motion.set_angular_velocity_clamped(velocity);
        }
    }

    /// Accumulate a force through the center of mass; dynamic bodies only
    pub fn add_force(&mut self, force: Vec3) {
        if let Some(motion) = self.dynamic_motion_mut() {
            motion.add_force(force);
        }
    }

    /// Accumulate a force applied at a world space point; dynamic bodies only
    pub fn add_force_at(&mut self, force: Vec3, point: Vec3) {
        let torque = (point - self.position).cross(force);
        if let Some(motion) = self.dynamic_motion_mut() {
            motion.add_force(force);
            motion.add_torque(torque);
        }
    }

    pub fn add_torque(&mut self, torque: Vec3) {
        if let Some(motion) = self.dynamic_motion_mut() {
            motion.add_torque(torque);
        }
    }

    /// Instantly change the velocity through the center of mass; dynamic bodies only
    pub fn add_impulse(&mut self, impulse: Vec3) {
        if let Some(motion) = self.dynamic_motion_mut() {
            let velocity = motion.linear_velocity + impulse * motion.inv_mass;
            motion.set_linear_velocity_clamped(velocity);
        }
    }

    pub fn add_impulse_at(&mut self, impulse: Vec3, point: Vec3) {
        let arm = point - self.position;
        let rotation = self.rotation;
        if let Some(motion) = self.dynamic_motion_mut() {
            let linear = motion.linear_velocity + impulse * motion.inv_mass;
            let angular =
                motion.angular_velocity + motion.inverse_inertia_world(rotation) * arm.cross(impulse);
            motion.set_linear_velocity_clamped(linear);
            motion.set_angular_velocity_clamped(angular);
        }
    }

    pub fn add_angular_impulse(&mut self, impulse: Vec3) {
        let rotation = self.rotation;
        if let Some(motion) = self.dynamic_motion_mut() {
            let angular = motion.angular_velocity + motion.inverse_inertia_world(rotation) * impulse;
            motion.set_angular_velocity_clamped(angular);
        }
    }

    /// Inverse mass; zero for anything that is not dynamic
    pub fn inverse_mass(&self) -> f32 {
        match (&self.motion, self.motion_type) {
            (Some(motion), MotionType::Dynamic) => motion.inv_mass,
            _ => 0.0,
        }
    }

    /// World space inverse inertia; zero for anything that is not dynamic
    pub fn inverse_inertia_world(&self) -> Mat3 {
        match (&self.motion, self.motion_type) {
            (Some(motion), MotionType::Dynamic) => motion.inverse_inertia_world(self.rotation),
            _ => Mat3::ZERO,
        }
    }

    pub(crate) fn set_mass_properties(&mut self, props: &MassProperties) {
        if let Some(motion) = self.motion.as_deref_mut() {
            motion.inv_mass = if props.mass > 0.0 { 1.0 / props.mass } else { 0.0 };
            motion.inv_inertia_local = if props.inertia.determinant().abs() > f32::EPSILON {
                props.inertia.inverse()
            } else {
                Mat3::ZERO
            };
        }
    }

    /// Recompute mass and inertia from the current shape at the creation density
    pub(crate) fn recalculate_mass_properties(&mut self) {
        let props = self.shape.mass_properties(self.density);
        self.set_mass_properties(&props);
    }

    pub(crate) fn set_motion_type_internal(&mut self, motion_type: MotionType) {
        debug_assert!(
            motion_type == MotionType::Static || self.motion.is_some(),
            "body {} has no motion properties and must stay static",
            self.id
        );
        if motion_type != MotionType::Static && self.motion.is_none() {
            return;
        }
        self.motion_type = motion_type;
        if motion_type == MotionType::Static {
            if let Some(motion) = self.motion.as_deref_mut() {
                motion.linear_velocity = Vec3::ZERO;
                motion.angular_velocity = Vec3::ZERO;
            }
        }
    }

    pub(crate) fn set_motion_quality_internal(&mut self, quality: MotionQuality) {
        if let Some(motion) = self.motion.as_deref_mut() {
            motion.motion_quality = quality;
        }
    }

    pub(crate) fn set_shape_internal(&mut self, shape: ShapeRef) {
        self.shape = shape;
        self.update_bounds();
    }

    pub(crate) fn set_collision_layer_internal(
        &mut self,
        layer: CollisionLayer,
        broad_phase_layer: BroadPhaseLayer,
    ) {
        self.collision_layer = layer;
        self.broad_phase_layer = broad_phase_layer;
    }

    /// Move the body and refresh its cached bounds
    pub(crate) fn set_position_and_rotation_internal(&mut self, position: Vec3, rotation: Quat) {
        self.position = position;
        self.rotation = rotation.normalize();
        self.update_bounds();
    }

    pub(crate) fn update_bounds(&mut self) {
        self.bounds = self.calculate_world_bounds();
    }

    /// Proxy handed to the broad phase
    pub fn broad_phase_proxy(&self) -> BroadPhaseBody {
        BroadPhaseBody {
            id: self.id,
            bounds: self.bounds,
            collision_layer: self.collision_layer,
            broad_phase_layer: self.broad_phase_layer,
        }
    }

    /// Set velocities so the body reaches the target transform after `delta_time`
    pub fn move_kinematic(&mut self, target_position: Vec3, target_rotation: Quat, delta_time: f32) {
        if self.is_static() || delta_time <= 0.0 {
            return;
        }
        let linear = (target_position - self.position) / delta_time;
        let mut delta_rotation = target_rotation.normalize() * self.rotation.conjugate();
        if delta_rotation.w < 0.0 {
            delta_rotation = -delta_rotation;
        }
        let (axis, angle) = delta_rotation.to_axis_angle();
        let angular = if angle.abs() > f32::EPSILON {
            axis * (angle / delta_time)
        } else {
            Vec3::ZERO
        };
        self.set_linear_velocity_clamped(linear);
        self.set_angular_velocity_clamped(angular);
    }

    /// Bounds as they should be for the current shape and transform
    pub fn calculate_world_bounds(&self) -> AABB {
        self.shape.world_bounds(self.position, self.rotation)
    }

    /// Center of mass plus two points on the body used to detect rest
    pub(crate) fn sleep_test_points(&self) -> [Vec3; 3] {
        let extents = self.shape.local_bounds().half_extents();
        [
            self.position,
            self.position + self.rotation * Vec3::new(extents.x, 0.0, 0.0),
            self.position + self.rotation * Vec3::new(0.0, extents.y, 0.0),
        ]
    }

    /// Restart sleep detection, keeping the body awake for at least `time_before_sleep`
    pub fn reset_sleep_timer(&mut self) {
        let points = self.sleep_test_points();
        if let Some(motion) = self.motion.as_deref_mut() {
            motion.reset_sleep_test_spheres(&points);
        }
    }

    /// Integrate gravity and the accumulated force and torque; dynamic bodies only
    pub(crate) fn apply_force_torque_and_drag(&mut self, gravity: Vec3, delta_time: f32) {
        let rotation = self.rotation;
        if let Some(motion) = self.dynamic_motion_mut() {
            motion.apply_force_torque_and_drag(rotation, gravity, delta_time);
        }
    }

    /// Feed the current transform to sleep detection
    pub(crate) fn update_sleep_state(
        &mut self,
        delta_time: f32,
        max_movement: f32,
        time_before_sleep: f32,
    ) -> SleepState {
        let points = self.sleep_test_points();
        match self.motion.as_deref_mut() {
            Some(motion) => {
                motion.accumulate_sleep_time(&points, delta_time, max_movement, time_before_sleep)
            }
            None => SleepState::Awake,
        }
    }

    fn moving_motion_mut(&mut self) -> Option<&mut MotionProperties> {
        match self.motion_type {
            MotionType::Static => None,
            _ => self.motion.as_deref_mut(),
        }
    }

    fn dynamic_motion_mut(&mut self) -> Option<&mut MotionProperties> {
        match self.motion_type {
            MotionType::Dynamic => self.motion.as_deref_mut(),
            _ => None,
        }
    }
}
