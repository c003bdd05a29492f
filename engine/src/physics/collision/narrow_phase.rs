//! Narrow phase collision detection for generating contact points
//!
//! Every test returns at most one contact: the deepest point, with the normal
//! pointing from A to B. Pairs closer than `margin` but not yet touching are
//! reported with a negative penetration so the solver can treat them as
//! speculative contacts.

use super::shapes::Shape;
use super::{Contact, AABB};
use crate::physics::body::BodyId;
use glam::{Quat, Vec3};

/// One side of a shape pair
#[derive(Debug, Clone, Copy)]
pub struct CollideInput<'a> {
    pub id: BodyId,
    pub shape: &'a Shape,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Test for collision between two shapes and generate contact information
pub fn collide(a: &CollideInput<'_>, b: &CollideInput<'_>, margin: f32) -> Option<Contact> {
    match (a.shape, b.shape) {
        (Shape::Sphere { radius: radius_a }, Shape::Sphere { radius: radius_b }) => {
            sphere_sphere(a.position, *radius_a, b.position, *radius_b, margin)
                .map(|hit| hit.into_contact(a.id, b.id))
        }
        (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
            sphere_box(a.position, *radius, b.position, b.rotation, *half_extents, margin)
                .map(|hit| hit.into_contact(a.id, b.id))
        }
        (Shape::Box { half_extents }, Shape::Sphere { radius }) => {
            sphere_box(b.position, *radius, a.position, a.rotation, *half_extents, margin)
                .map(|hit| hit.into_contact(b.id, a.id).flipped())
        }
        (Shape::Box { half_extents: extents_a }, Shape::Box { half_extents: extents_b }) => {
            box_box(
                (a.position, a.rotation, *extents_a),
                (b.position, b.rotation, *extents_b),
                margin,
            )
            .map(|hit| hit.into_contact(a.id, b.id))
        }
        (
            Shape::Capsule {
                radius,
                half_height,
            },
            other,
        ) => {
            let segment = capsule_segment(a.position, a.rotation, *half_height);
            capsule_vs(segment, *radius, b, other, margin).map(|hit| hit.into_contact(a.id, b.id))
        }
        (
            other,
            Shape::Capsule {
                radius,
                half_height,
            },
        ) => {
            let segment = capsule_segment(b.position, b.rotation, *half_height);
            capsule_vs(segment, *radius, a, other, margin)
                .map(|hit| hit.into_contact(b.id, a.id).flipped())
        }
    }
}

/// Contact geometry before the bodies are attached
#[derive(Debug, Clone, Copy)]
struct Hit {
    position: Vec3,
    normal: Vec3,
    penetration: f32,
}

impl Hit {
    fn into_contact(self, a: BodyId, b: BodyId) -> Contact {
        Contact::new(a, b, self.position, self.normal, self.penetration)
    }
}

fn sphere_sphere(pos_a: Vec3, radius_a: f32, pos_b: Vec3, radius_b: f32, margin: f32) -> Option<Hit> {
    let delta = pos_b - pos_a;
    let distance_sq = delta.length_squared();
    let radius_sum = radius_a + radius_b;
    let reach = radius_sum + margin;

    if distance_sq > reach * reach {
        return None;
    }

    let distance = distance_sq.sqrt();
    let normal = if distance > 0.0 {
        delta / distance
    } else {
        // Coincident centers, any direction separates them
        Vec3::Y
    };

    let penetration = radius_sum - distance;
    Some(Hit {
        position: pos_a + normal * (radius_a - penetration * 0.5),
        normal,
        penetration,
    })
}

/// Sphere A against box B
fn sphere_box(
    sphere_pos: Vec3,
    sphere_radius: f32,
    box_pos: Vec3,
    box_rot: Quat,
    half_extents: Vec3,
    margin: f32,
) -> Option<Hit> {
    let local = box_rot.conjugate() * (sphere_pos - box_pos);
    let closest = local.clamp(-half_extents, half_extents);

    let delta = local - closest;
    let distance_sq = delta.length_squared();
    let reach = sphere_radius + margin;
    if distance_sq > reach * reach {
        return None;
    }

    let distance = distance_sq.sqrt();
    let (local_normal, depth) = if distance > 0.0 {
        // Normal from the sphere towards the box
        (-delta / distance, sphere_radius - distance)
    } else {
        // Center inside the box: push out through the nearest face
        let faces = [
            (half_extents.x - local.x.abs(), Vec3::X * local.x.signum()),
            (half_extents.y - local.y.abs(), Vec3::Y * local.y.signum()),
            (half_extents.z - local.z.abs(), Vec3::Z * local.z.signum()),
        ];
        let (face_distance, outward) = faces
            .into_iter()
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .unwrap_or((0.0, Vec3::Y));
        (-outward, sphere_radius + face_distance)
    };

    let normal = box_rot * local_normal;
    Some(Hit {
        position: sphere_pos + normal * sphere_radius,
        normal,
        penetration: depth,
    })
}

type BoxPose = (Vec3, Quat, Vec3);

/// Separating axis test between two oriented boxes
fn box_box(a: BoxPose, b: BoxPose, margin: f32) -> Option<Hit> {
    let (pos_a, rot_a, extents_a) = a;
    let (pos_b, rot_b, extents_b) = b;
    let axes_a = [rot_a * Vec3::X, rot_a * Vec3::Y, rot_a * Vec3::Z];
    let axes_b = [rot_b * Vec3::X, rot_b * Vec3::Y, rot_b * Vec3::Z];
    let center_delta = pos_b - pos_a;

    let mut min_penetration = f32::MAX;
    let mut best_axis = Vec3::Y;

    let mut candidates: Vec<Vec3> = axes_a.iter().chain(axes_b.iter()).copied().collect();
    for edge_a in axes_a {
        for edge_b in axes_b {
            let axis = edge_a.cross(edge_b);
            if axis.length_squared() > 1e-6 {
                candidates.push(axis.normalize());
            }
        }
    }

    for axis in candidates {
        let separation = center_delta.dot(axis);
        let radius_a = project_box(extents_a, &axes_a, axis);
        let radius_b = project_box(extents_b, &axes_b, axis);
        let penetration = radius_a + radius_b - separation.abs();
        if penetration < -margin {
            return None;
        }
        if penetration < min_penetration {
            min_penetration = penetration;
            best_axis = if separation < 0.0 { -axis } else { axis };
        }
    }

    // Center of the overlap of the world bounds for face contacts, otherwise
    // halfway between the deepest points of each box along the axis
    let bounds_a = Shape::Box { half_extents: extents_a }.world_bounds(pos_a, rot_a);
    let bounds_b = Shape::Box { half_extents: extents_b }.world_bounds(pos_b, rot_b);
    let overlap = AABB::new(bounds_a.min.max(bounds_b.min), bounds_a.max.min(bounds_b.max));
    let position = if overlap.is_valid() {
        overlap.center()
    } else {
        let support_a = box_support(pos_a, &axes_a, extents_a, best_axis);
        let support_b = box_support(pos_b, &axes_b, extents_b, -best_axis);
        (support_a + support_b) * 0.5
    };

    Some(Hit {
        position,
        normal: best_axis,
        penetration: min_penetration,
    })
}

fn project_box(extents: Vec3, axes: &[Vec3; 3], axis: Vec3) -> f32 {
    extents.x * axes[0].dot(axis).abs()
        + extents.y * axes[1].dot(axis).abs()
        + extents.z * axes[2].dot(axis).abs()
}

fn box_support(center: Vec3, axes: &[Vec3; 3], extents: Vec3, direction: Vec3) -> Vec3 {
    let mut support = center;
    for (axis, extent) in axes.iter().zip(extents.to_array()) {
        if axis.dot(direction) > 0.0 {
            support += *axis * extent;
        } else {
            support -= *axis * extent;
        }
    }
    support
}

fn capsule_segment(position: Vec3, rotation: Quat, half_height: f32) -> (Vec3, Vec3) {
    let axis = rotation * Vec3::new(0.0, half_height, 0.0);
    (position - axis, position + axis)
}

/// Point on segment `(p, q)` closest to `point`
fn closest_on_segment(segment: (Vec3, Vec3), point: Vec3) -> Vec3 {
    let (p, q) = segment;
    let d = q - p;
    let length_sq = d.length_squared();
    if length_sq <= f32::EPSILON {
        return p;
    }
    let t = ((point - p).dot(d) / length_sq).clamp(0.0, 1.0);
    p + d * t
}

/// Closest points between two segments
fn closest_between_segments(s1: (Vec3, Vec3), s2: (Vec3, Vec3)) -> (Vec3, Vec3) {
    let (p1, q1) = s1;
    let (p2, q2) = s2;
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    if a <= f32::EPSILON && e <= f32::EPSILON {
        return (p1, p2);
    }
    let (s, t) = if a <= f32::EPSILON {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d1.dot(r);
        if e <= f32::EPSILON {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let mut s = if denom > f32::EPSILON {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };
    (p1 + d1 * s, p2 + d2 * t)
}

/// Capsule A (as a swept sphere) against any shape B
fn capsule_vs(
    segment: (Vec3, Vec3),
    radius: f32,
    other: &CollideInput<'_>,
    other_shape: &Shape,
    margin: f32,
) -> Option<Hit> {
    match other_shape {
        Shape::Sphere { radius: other_radius } => {
            let closest = closest_on_segment(segment, other.position);
            sphere_sphere(closest, radius, other.position, *other_radius, margin)
        }
        Shape::Capsule {
            radius: other_radius,
            half_height,
        } => {
            let other_segment = capsule_segment(other.position, other.rotation, *half_height);
            let (on_a, on_b) = closest_between_segments(segment, other_segment);
            sphere_sphere(on_a, radius, on_b, *other_radius, margin)
        }
        Shape::Box { half_extents } => {
            // Test the segment point nearest to the box's surface
            let to_local = |p: Vec3| other.rotation.conjugate() * (p - other.position);
            let (p, q) = (to_local(segment.0), to_local(segment.1));
            let mut best = p;
            let mut best_distance = f32::MAX;
            const SAMPLES: usize = 8;
            for i in 0..=SAMPLES {
                let point = p.lerp(q, i as f32 / SAMPLES as f32);
                let distance = (point - point.clamp(-*half_extents, *half_extents)).length_squared();
                if distance < best_distance {
                    best_distance = distance;
                    best = point;
                }
            }
            let world = other.position + other.rotation * best;
            sphere_box(world, radius, other.position, other.rotation, *half_extents, margin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(index: u32, shape: &Shape, position: Vec3) -> CollideInput<'_> {
        CollideInput {
            id: BodyId::new(index, 1),
            shape,
            position,
            rotation: Quat::IDENTITY,
        }
    }

    #[test]
    fn test_sphere_sphere_collision() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let contact = collide(
            &input(0, &sphere, Vec3::ZERO),
            &input(1, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            0.0,
        )
        .expect("spheres overlap");

        assert!((contact.penetration - 0.5).abs() < 1e-6);
        assert!((contact.normal - Vec3::X).length() < 1e-6);
        assert_eq!(contact.body_a, BodyId::new(0, 1));
    }

    #[test]
    fn test_sphere_box_normal_points_from_a_to_b() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let cuboid = Shape::Box {
            half_extents: Vec3::ONE,
        };

        let contact = collide(
            &input(0, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            &input(1, &cuboid, Vec3::ZERO),
            0.0,
        )
        .expect("sphere touches box");
        assert!((contact.penetration - 0.5).abs() < 1e-5);
        assert!((contact.normal + Vec3::X).length() < 1e-5);

        let flipped = collide(
            &input(1, &cuboid, Vec3::ZERO),
            &input(0, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            0.0,
        )
        .expect("box touches sphere");
        assert_eq!(flipped.body_a, BodyId::new(1, 1));
        assert!((flipped.normal - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn test_box_resting_on_box() {
        let cuboid = Shape::Box {
            half_extents: Vec3::splat(0.5),
        };
        let floor = Shape::Box {
            half_extents: Vec3::new(10.0, 0.5, 10.0),
        };
        let contact = collide(
            &input(0, &floor, Vec3::ZERO),
            &input(1, &cuboid, Vec3::new(0.0, 0.95, 0.0)),
            0.0,
        )
        .expect("boxes overlap");
        assert!((contact.normal - Vec3::Y).length() < 1e-5);
        assert!((contact.penetration - 0.05).abs() < 1e-5);
    }

    #[test]
    fn test_capsule_pairs() {
        let capsule = Shape::Capsule {
            radius: 0.5,
            half_height: 1.0,
        };
        let sphere = Shape::Sphere { radius: 0.5 };

        let contact = collide(
            &input(0, &capsule, Vec3::ZERO),
            &input(1, &sphere, Vec3::new(0.9, 0.8, 0.0)),
            0.0,
        )
        .expect("capsule side touches sphere");
        assert!((contact.normal - Vec3::X).length() < 1e-5);
        assert!((contact.penetration - 0.1).abs() < 1e-5);

        let other = collide(
            &input(0, &capsule, Vec3::ZERO),
            &input(1, &capsule, Vec3::new(0.0, 2.9, 0.0)),
            0.0,
        )
        .expect("capsule ends touch");
        assert!((other.normal - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_speculative_margin() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let a = input(0, &sphere, Vec3::ZERO);
        let b = input(1, &sphere, Vec3::new(2.05, 0.0, 0.0));

        assert!(collide(&a, &b, 0.0).is_none());
        let contact = collide(&a, &b, 0.1).expect("within margin");
        assert!(contact.penetration < 0.0);
        assert!((contact.penetration + 0.05).abs() < 1e-5);
    }

    #[test]
    fn test_no_collision() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let contact = collide(
            &input(0, &sphere, Vec3::ZERO),
            &input(1, &sphere, Vec3::new(10.0, 0.0, 0.0)),
            0.0,
        );
        assert!(contact.is_none());
    }
}
