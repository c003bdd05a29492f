//! Body creation settings

use super::motion::{AllowedDofs, MotionQuality, MotionType};
use crate::physics::collision::layers::{CollisionGroup, CollisionLayer};
use crate::physics::collision::shapes::{MassProperties, ShapeRef};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Where the mass and inertia of a new body come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MassPropertiesOverride {
    /// Both computed from the shape and density
    #[default]
    CalculateMassAndInertia,
    /// Mass taken from `mass_properties`, inertia computed from the shape and scaled to it
    CalculateInertia,
    /// Both taken from `mass_properties`
    MassAndInertiaProvided,
}

/// Everything needed to allocate a body
#[derive(Debug, Clone)]
pub struct BodyCreateInfo {
    pub shape: ShapeRef,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub user_data: u64,
    pub collision_layer: CollisionLayer,
    pub collision_group: CollisionGroup,
    pub motion_type: MotionType,
    pub motion_quality: MotionQuality,
    pub allowed_dofs: AllowedDofs,
    /// Allocate motion properties for a static body so it can later become kinematic or dynamic
    pub allow_dynamic_or_kinematic: bool,
    pub is_sensor: bool,
    pub use_manifold_reduction: bool,
    pub apply_gyroscopic_force: bool,
    pub enhanced_internal_edge_removal: bool,
    pub allow_sleeping: bool,
    pub friction: f32,
    pub restitution: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub max_linear_velocity: f32,
    pub max_angular_velocity: f32,
    pub gravity_factor: f32,
    /// 0 uses the scene's setting
    pub num_velocity_steps_override: u8,
    /// 0 uses the scene's setting
    pub num_position_steps_override: u8,
    pub mass_override: MassPropertiesOverride,
    pub mass_properties: MassProperties,
    /// Density in kg/m^3 used when mass is calculated from the shape
    pub density: f32,
}

impl Default for BodyCreateInfo {
    fn default() -> Self {
        Self {
            shape: ShapeRef::default(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            user_data: 0,
            collision_layer: CollisionLayer::default(),
            collision_group: CollisionGroup::default(),
            motion_type: MotionType::Dynamic,
            motion_quality: MotionQuality::Discrete,
            allowed_dofs: AllowedDofs::ALL,
            allow_dynamic_or_kinematic: false,
            is_sensor: false,
            use_manifold_reduction: true,
            apply_gyroscopic_force: false,
            enhanced_internal_edge_removal: false,
            allow_sleeping: true,
            friction: 0.2,
            restitution: 0.0,
            linear_damping: 0.05,
            angular_damping: 0.05,
            max_linear_velocity: 500.0,
            max_angular_velocity: 0.25 * std::f32::consts::PI * 60.0,
            gravity_factor: 1.0,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            mass_override: MassPropertiesOverride::CalculateMassAndInertia,
            mass_properties: MassProperties::default(),
            density: 1000.0,
        }
    }
}

impl BodyCreateInfo {
    pub fn new(
        shape: ShapeRef,
        position: Vec3,
        rotation: Quat,
        motion_type: MotionType,
        collision_layer: CollisionLayer,
    ) -> Self {
        Self {
            shape,
            position,
            rotation,
            motion_type,
            collision_layer,
            ..Default::default()
        }
    }

    /// Whether the body needs a motion properties block
    pub fn has_mass_properties(&self) -> bool {
        self.allow_dynamic_or_kinematic || self.motion_type != MotionType::Static
    }

    /// Resolve the mass and inertia according to `mass_override`
    pub fn resolved_mass_properties(&self) -> MassProperties {
        match self.mass_override {
            MassPropertiesOverride::CalculateMassAndInertia => {
                self.shape.mass_properties(self.density)
            }
            MassPropertiesOverride::CalculateInertia => {
                let mut props = self.shape.mass_properties(self.density);
                props.scale_to_mass(self.mass_properties.mass);
                props
            }
            MassPropertiesOverride::MassAndInertiaProvided => self.mass_properties,
        }
    }
}
