//! Motion state of non-static bodies

use bitflags::bitflags;
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// How a body moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MotionType {
    /// Never moves; no velocity, no motion properties unless opted in
    #[default]
    Static,
    /// Moved by velocity only, unaffected by forces and contacts
    Kinematic,
    /// Fully simulated
    Dynamic,
}

/// How collision detection treats a moving body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MotionQuality {
    /// Position is updated without checking for tunneling
    #[default]
    Discrete,
    /// Fast moving bodies are swept along their motion to prevent tunneling
    LinearCast,
}

bitflags! {
    /// Degrees of freedom a body may move in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AllowedDofs: u8 {
        const TRANSLATION_X = 0b000001;
        const TRANSLATION_Y = 0b000010;
        const TRANSLATION_Z = 0b000100;
        const ROTATION_X = 0b001000;
        const ROTATION_Y = 0b010000;
        const ROTATION_Z = 0b100000;
        const ALL = 0b111111;
        /// Movement in the XY plane only, rotation about Z
        const PLANE_2D = Self::TRANSLATION_X.bits() | Self::TRANSLATION_Y.bits() | Self::ROTATION_Z.bits();
    }
}

impl Default for AllowedDofs {
    fn default() -> Self {
        AllowedDofs::ALL
    }
}

impl AllowedDofs {
    /// Per-axis 1/0 mask for translation
    pub fn translation_mask(self) -> Vec3 {
        Vec3::new(
            self.contains(Self::TRANSLATION_X) as u8 as f32,
            self.contains(Self::TRANSLATION_Y) as u8 as f32,
            self.contains(Self::TRANSLATION_Z) as u8 as f32,
        )
    }

    /// Per-axis 1/0 mask for rotation
    pub fn rotation_mask(self) -> Vec3 {
        Vec3::new(
            self.contains(Self::ROTATION_X) as u8 as f32,
            self.contains(Self::ROTATION_Y) as u8 as f32,
            self.contains(Self::ROTATION_Z) as u8 as f32,
        )
    }
}

/// Sphere tracking how far a sleep test point drifted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SleepTestSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl SleepTestSphere {
    fn at(point: Vec3) -> Self {
        Self {
            center: point,
            radius: 0.0,
        }
    }

    /// Grow the sphere minimally so it contains `point`
    fn encapsulate(&mut self, point: Vec3) {
        let offset = point - self.center;
        let distance = offset.length();
        if distance > self.radius {
            let new_radius = 0.5 * (self.radius + distance);
            self.center += offset * ((new_radius - self.radius) / distance);
            self.radius = new_radius;
        }
    }
}

/// Outcome of accumulating sleep time for a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    Awake,
    CanSleep,
}

/// Velocity, mass and sleep bookkeeping of a kinematic or dynamic body
#[derive(Debug, Clone)]
pub struct MotionProperties {
    pub(crate) linear_velocity: Vec3,
    pub(crate) angular_velocity: Vec3,
    pub(crate) force: Vec3,
    pub(crate) torque: Vec3,
    pub(crate) inv_mass: f32,
    pub(crate) inv_inertia_local: Mat3,
    pub(crate) linear_damping: f32,
    pub(crate) angular_damping: f32,
    pub(crate) max_linear_velocity: f32,
    pub(crate) max_angular_velocity: f32,
    pub(crate) gravity_factor: f32,
    pub(crate) motion_quality: MotionQuality,
    pub(crate) allowed_dofs: AllowedDofs,
    pub(crate) num_velocity_steps_override: u8,
    pub(crate) num_position_steps_override: u8,
    pub(crate) allow_sleeping: bool,
    pub(crate) sleep_test_spheres: [SleepTestSphere; 3],
    pub(crate) sleep_test_timer: f32,
}

impl MotionProperties {
    pub fn new() -> Self {
        Self {
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            inv_mass: 1.0,
            inv_inertia_local: Mat3::IDENTITY,
            linear_damping: 0.05,
            angular_damping: 0.05,
            max_linear_velocity: 500.0,
            max_angular_velocity: 0.25 * std::f32::consts::PI * 60.0,
            gravity_factor: 1.0,
            motion_quality: MotionQuality::Discrete,
            allowed_dofs: AllowedDofs::ALL,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            allow_sleeping: true,
            sleep_test_spheres: [SleepTestSphere::at(Vec3::ZERO); 3],
            sleep_test_timer: 0.0,
        }
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.linear_velocity
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.angular_velocity
    }

    /// Set the linear velocity, clamped to the maximum and masked by the allowed DOFs
    pub fn set_linear_velocity_clamped(&mut self, velocity: Vec3) {
        self.linear_velocity =
            clamp_length(velocity * self.allowed_dofs.translation_mask(), self.max_linear_velocity);
    }

    /// Set the angular velocity, clamped to the maximum and masked by the allowed DOFs
    pub fn set_angular_velocity_clamped(&mut self, velocity: Vec3) {
        self.angular_velocity =
            clamp_length(velocity * self.allowed_dofs.rotation_mask(), self.max_angular_velocity);
    }

    pub fn clamp_velocities(&mut self) {
        self.set_linear_velocity_clamped(self.linear_velocity);
        self.set_angular_velocity_clamped(self.angular_velocity);
    }

    pub fn inverse_mass(&self) -> f32 {
        self.inv_mass
    }

    pub fn inverse_inertia_local(&self) -> Mat3 {
        self.inv_inertia_local
    }

    /// World space inverse inertia for a body with the given orientation
    pub fn inverse_inertia_world(&self, rotation: Quat) -> Mat3 {
        let rot = Mat3::from_quat(rotation);
        let dof_mask = Mat3::from_diagonal(self.allowed_dofs.rotation_mask());
        dof_mask * rot * self.inv_inertia_local * rot.transpose() * dof_mask
    }

    pub fn gravity_factor(&self) -> f32 {
        self.gravity_factor
    }

    pub fn motion_quality(&self) -> MotionQuality {
        self.motion_quality
    }

    pub fn allowed_dofs(&self) -> AllowedDofs {
        self.allowed_dofs
    }

    pub fn accumulated_force(&self) -> Vec3 {
        self.force
    }

    pub fn accumulated_torque(&self) -> Vec3 {
        self.torque
    }

    pub fn add_force(&mut self, force: Vec3) {
        self.force += force;
    }

    pub fn add_torque(&mut self, torque: Vec3) {
        self.torque += torque;
    }

    pub fn reset_force_and_torque(&mut self) {
        self.force = Vec3::ZERO;
        self.torque = Vec3::ZERO;
    }

    /// Number of velocity iterations, falling back to `default` when not overridden
    pub fn num_velocity_steps(&self, default: u32) -> u32 {
        match self.num_velocity_steps_override {
            0 => default,
            n => u32::from(n),
        }
    }

    pub fn num_position_steps(&self, default: u32) -> u32 {
        match self.num_position_steps_override {
            0 => default,
            n => u32::from(n),
        }
    }

    /// Integrate gravity and the accumulated force/torque into the velocities,
    /// apply damping and clear the accumulators.
    pub(crate) fn apply_force_torque_and_drag(&mut self, rotation: Quat, gravity: Vec3, dt: f32) {
        let linear = self.linear_velocity
            + (gravity * self.gravity_factor + self.force * self.inv_mass) * dt;
        let angular =
            self.angular_velocity + self.inverse_inertia_world(rotation) * self.torque * dt;

        self.linear_velocity = linear * (1.0 - self.linear_damping * dt).max(0.0);
        self.angular_velocity = angular * (1.0 - self.angular_damping * dt).max(0.0);
        self.clamp_velocities();
        self.reset_force_and_torque();
    }

    /// Restart sleep detection from the given test points
    pub(crate) fn reset_sleep_test_spheres(&mut self, points: &[Vec3; 3]) {
        for (sphere, point) in self.sleep_test_spheres.iter_mut().zip(points) {
            *sphere = SleepTestSphere::at(*point);
        }
        self.sleep_test_timer = 0.0;
    }

    pub fn sleep_test_timer(&self) -> f32 {
        self.sleep_test_timer
    }

    /// Track the test points and report whether the body stayed put long enough to sleep
    pub(crate) fn accumulate_sleep_time(
        &mut self,
        points: &[Vec3; 3],
        dt: f32,
        max_movement: f32,
        time_before_sleep: f32,
    ) -> SleepState {
        if !self.allow_sleeping {
            return SleepState::Awake;
        }

        for (sphere, point) in self.sleep_test_spheres.iter_mut().zip(points) {
            sphere.encapsulate(*point);
        }
        if self
            .sleep_test_spheres
            .iter()
            .any(|sphere| sphere.radius > max_movement)
        {
            self.reset_sleep_test_spheres(points);
            return SleepState::Awake;
        }

        self.sleep_test_timer += dt;
        if self.sleep_test_timer >= time_before_sleep {
            SleepState::CanSleep
        } else {
            SleepState::Awake
        }
    }
}

impl Default for MotionProperties {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_length(v: Vec3, max: f32) -> Vec3 {
    let length_sq = v.length_squared();
    if length_sq > max * max {
        v * (max / length_sq.sqrt())
    } else {
        v
    }
}
