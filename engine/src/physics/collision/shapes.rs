//! Collision shapes
//!
//! Shapes are immutable and shared between bodies through [`ShapeRef`]. Two
//! bodies use "the same" shape only when they hold the same allocation.

use super::AABB;
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared, immutable shape handle
pub type ShapeRef = Arc<Shape>;

/// Collision shape types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Shape {
    /// Sphere with radius
    Sphere { radius: f32 },
    /// Box with half-extents (width/2, height/2, depth/2)
    Box { half_extents: Vec3 },
    /// Capsule with radius and half-height (height is along Y axis)
    Capsule { radius: f32, half_height: f32 },
}

/// Mass and inertia of a shape or body, about its center of mass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MassProperties {
    pub mass: f32,
    pub inertia: Mat3,
}

impl MassProperties {
    /// Rescale to a new total mass, keeping the mass distribution
    pub fn scale_to_mass(&mut self, mass: f32) {
        if self.mass > 0.0 {
            self.inertia *= mass / self.mass;
        }
        self.mass = mass;
    }
}

impl Default for MassProperties {
    fn default() -> Self {
        Self {
            mass: 1.0,
            inertia: Mat3::IDENTITY,
        }
    }
}

impl Default for Shape {
    fn default() -> Self {
        Shape::Box {
            half_extents: Vec3::splat(0.5),
        }
    }
}

impl Shape {
    pub fn sphere(radius: f32) -> ShapeRef {
        Arc::new(Shape::Sphere { radius })
    }

    pub fn cuboid(half_extents: Vec3) -> ShapeRef {
        Arc::new(Shape::Box { half_extents })
    }

    pub fn capsule(radius: f32, half_height: f32) -> ShapeRef {
        Arc::new(Shape::Capsule {
            radius,
            half_height,
        })
    }

    /// Bounds in the shape's local space, centered on the center of mass
    pub fn local_bounds(&self) -> AABB {
        let half_extents = match self {
            Shape::Sphere { radius } => Vec3::splat(*radius),
            Shape::Box { half_extents } => *half_extents,
            Shape::Capsule {
                radius,
                half_height,
            } => Vec3::new(*radius, half_height + radius, *radius),
        };
        AABB::from_center_half_extents(Vec3::ZERO, half_extents)
    }

    /// World space bounds for a body at `position` with `rotation`
    pub fn world_bounds(&self, position: Vec3, rotation: Quat) -> AABB {
        match self {
            Shape::Sphere { radius } => {
                AABB::from_center_half_extents(position, Vec3::splat(*radius))
            }
            Shape::Capsule {
                radius,
                half_height,
            } => {
                let axis = rotation * Vec3::new(0.0, *half_height, 0.0);
                let mut bounds = AABB::from_center_half_extents(position + axis, Vec3::splat(*radius));
                bounds = bounds.merge(&AABB::from_center_half_extents(
                    position - axis,
                    Vec3::splat(*radius),
                ));
                bounds
            }
            Shape::Box { half_extents } => {
                // Extent of a rotated box along each world axis
                let rot = Mat3::from_quat(rotation);
                let abs = Mat3::from_cols(rot.x_axis.abs(), rot.y_axis.abs(), rot.z_axis.abs());
                AABB::from_center_half_extents(position, abs * *half_extents)
            }
        }
    }

    /// Radius of the largest sphere around the center of mass that fits in the shape
    pub fn inner_radius(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => *radius,
            Shape::Box { half_extents } => half_extents.min_element(),
            Shape::Capsule { radius, .. } => *radius,
        }
    }

    /// Get the bounding sphere radius
    pub fn bounding_radius(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => *radius,
            Shape::Box { half_extents } => half_extents.length(),
            Shape::Capsule {
                radius,
                half_height,
            } => radius + half_height,
        }
    }

    pub fn volume(&self) -> f32 {
        use std::f32::consts::PI;
        match self {
            Shape::Sphere { radius } => 4.0 / 3.0 * PI * radius.powi(3),
            Shape::Box { half_extents } => 8.0 * half_extents.x * half_extents.y * half_extents.z,
            Shape::Capsule {
                radius,
                half_height,
            } => PI * radius * radius * (2.0 * half_height) + 4.0 / 3.0 * PI * radius.powi(3),
        }
    }

    /// Mass properties for a uniform density
    pub fn mass_properties(&self, density: f32) -> MassProperties {
        let mass = self.volume() * density;
        MassProperties {
            mass,
            inertia: self.calculate_inertia(mass),
        }
    }

    /// Calculate the inertia tensor for this shape with the given mass
    pub fn calculate_inertia(&self, mass: f32) -> Mat3 {
        match self {
            Shape::Sphere { radius } => {
                let inertia = 0.4 * mass * radius * radius;
                Mat3::from_diagonal(Vec3::splat(inertia))
            }
            Shape::Box { half_extents } => {
                let size = *half_extents * 2.0;
                let factor = mass / 12.0;

                Mat3::from_diagonal(Vec3::new(
                    factor * (size.y * size.y + size.z * size.z),
                    factor * (size.x * size.x + size.z * size.z),
                    factor * (size.x * size.x + size.y * size.y),
                ))
            }
            Shape::Capsule {
                radius,
                half_height,
            } => {
                // Cylinder plus two hemispheres, mass split by volume
                use std::f32::consts::PI;
                let height = half_height * 2.0;
                let cylinder_volume = PI * radius * radius * height;
                let sphere_volume = 4.0 / 3.0 * PI * radius.powi(3);
                let total = cylinder_volume + sphere_volume;
                let cylinder_mass = mass * cylinder_volume / total;
                let sphere_mass = mass * sphere_volume / total;

                let cylinder_inertia_x =
                    cylinder_mass * (3.0 * radius * radius + height * height) / 12.0;
                let cylinder_inertia_y = cylinder_mass * radius * radius / 2.0;

                let sphere_inertia = 0.4 * sphere_mass * radius * radius;
                let cap_offset = half_height + 0.375 * radius;
                let sphere_inertia_x = sphere_inertia + sphere_mass * cap_offset * cap_offset;

                Mat3::from_diagonal(Vec3::new(
                    cylinder_inertia_x + sphere_inertia_x,
                    cylinder_inertia_y + sphere_inertia,
                    cylinder_inertia_x + sphere_inertia_x,
                ))
            }
        }
    }
}
