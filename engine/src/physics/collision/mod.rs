//! Collision detection subsystem

pub mod broad_phase;
pub mod contact_listener;
pub mod layers;
pub mod narrow_phase;
pub mod shapes;

use crate::physics::body::BodyId;
use glam::Vec3;

/// Deepest point of contact between two bodies, produced by the narrow phase
#[derive(Debug, Clone)]
pub struct Contact {
    pub body_a: BodyId,
    pub body_b: BodyId,
    /// World space point halfway between the two surfaces
    pub position: Vec3,
    /// Unit normal from A to B
    pub normal: Vec3,
    /// Overlap along the normal; negative while the bodies are still apart
    pub penetration: f32,
    /// Friction directions, orthogonal to the normal and each other
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl Contact {
    pub fn new(
        body_a: BodyId,
        body_b: BodyId,
        position: Vec3,
        normal: Vec3,
        penetration: f32,
    ) -> Self {
        let (tangent, bitangent) = create_tangent_basis(normal);

        Self {
            body_a,
            body_b,
            position,
            normal,
            penetration,
            tangent,
            bitangent,
        }
    }

    /// Same contact seen from B
    pub fn flipped(self) -> Self {
        Self {
            body_a: self.body_b,
            body_b: self.body_a,
            position: self.position,
            normal: -self.normal,
            penetration: self.penetration,
            tangent: self.tangent,
            bitangent: self.bitangent,
        }
    }
}

fn create_tangent_basis(normal: Vec3) -> (Vec3, Vec3) {
    let up = if normal.y.abs() < 0.9 { Vec3::Y } else { Vec3::X };

    let tangent = up.cross(normal).normalize_or_zero();
    let bitangent = normal.cross(tangent);

    (tangent, bitangent)
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AABB {
    pub min: Vec3,
    pub max: Vec3,
}

impl AABB {
    /// Create a new AABB from min and max points
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from a center point and half-extents
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// False for boxes with a min corner above the max corner
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    /// Check if this AABB overlaps with another
    pub fn overlaps(&self, other: &AABB) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Expand this AABB to include a point
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Grow the box by `margin` in every direction
    pub fn expanded(&self, margin: f32) -> AABB {
        AABB {
            min: self.min - Vec3::splat(margin),
            max: self.max + Vec3::splat(margin),
        }
    }

    /// Get the center of the AABB
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the half-extents of the AABB
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Merge two AABBs
    pub fn merge(&self, other: &AABB) -> AABB {
        AABB {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Component-wise comparison of both corners
    pub fn abs_diff_eq(&self, other: &AABB, tolerance: f32) -> bool {
        self.min.abs_diff_eq(other.min, tolerance) && self.max.abs_diff_eq(other.max, tolerance)
    }

    /// Slab test of the segment `origin + t * displacement`, `t` in `[0, 1]`.
    ///
    /// Returns the entry fraction, or `None` when the segment misses the box.
    /// A segment starting inside the box hits at `0.0`.
    pub fn segment_hit_fraction(&self, origin: Vec3, displacement: Vec3) -> Option<f32> {
        let mut t_enter = 0.0_f32;
        let mut t_exit = 1.0_f32;

        for axis in 0..3 {
            let o = origin[axis];
            let d = displacement[axis];
            if d.abs() < f32::EPSILON {
                if o < self.min[axis] || o > self.max[axis] {
                    return None;
                }
                continue;
            }

            let inv = 1.0 / d;
            let mut t0 = (self.min[axis] - o) * inv;
            let mut t1 = (self.max[axis] - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_enter = t_enter.max(t0);
            t_exit = t_exit.min(t1);
            if t_enter > t_exit {
                return None;
            }
        }

        Some(t_enter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_overlap() {
        let aabb1 = AABB::new(Vec3::ZERO, Vec3::ONE);
        let aabb2 = AABB::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let aabb3 = AABB::new(Vec3::splat(2.0), Vec3::splat(3.0));

        assert!(aabb1.overlaps(&aabb2));
        assert!(aabb2.overlaps(&aabb1));
        assert!(!aabb1.overlaps(&aabb3));
        assert!(!aabb3.overlaps(&aabb1));
    }

    #[test]
    fn test_merge_and_validity() {
        let a = AABB::new(Vec3::splat(-1.0), Vec3::ZERO);
        let b = AABB::new(Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        assert_eq!(a.merge(&b), AABB::new(Vec3::splat(-1.0), Vec3::new(2.0, 1.0, 1.0)));
        assert!(a.is_valid());
        assert!(!AABB::new(Vec3::ONE, Vec3::ZERO).is_valid());
    }

    #[test]
    fn test_segment_hit_fraction() {
        let aabb = AABB::new(Vec3::new(4.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0));

        let hit = aabb.segment_hit_fraction(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0));
        assert!((hit.unwrap() - 0.4).abs() < 1e-6);

        assert!(aabb
            .segment_hit_fraction(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0))
            .is_none());
        assert!(aabb
            .segment_hit_fraction(Vec3::new(0.0, 5.0, 0.0), Vec3::new(10.0, 0.0, 0.0))
            .is_none());
        assert_eq!(
            aabb.segment_hit_fraction(Vec3::new(5.0, 0.0, 0.0), Vec3::X),
            Some(0.0)
        );
    }

    #[test]
    fn test_tangent_basis() {
        let normal = Vec3::Y;
        let (tangent, bitangent) = create_tangent_basis(normal);

        // Check orthonormality
        assert!((normal.dot(tangent)).abs() < 1e-6);
        assert!((normal.dot(bitangent)).abs() < 1e-6);
        assert!((tangent.dot(bitangent)).abs() < 1e-6);

        // Check unit length
        assert!((tangent.length() - 1.0).abs() < 1e-6);
        assert!((bitangent.length() - 1.0).abs() < 1e-6);
    }
}
