//! Keeps two anchor points within a distance range

use super::{Constraint, SolverBody};
use crate::physics::body::BodyId;
use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Free,
    Rigid,
    AtMin,
    AtMax,
}

/// Rope (`min < max`) or rod (`min == max`) between two anchors.
///
/// Anchors are in body local space. When one side is [`BodyId::INVALID`] its
/// anchor is a fixed world space point.
#[derive(Debug, Clone)]
pub struct DistanceConstraint {
    body_a: BodyId,
    body_b: BodyId,
    local_anchor_a: Vec3,
    local_anchor_b: Vec3,
    min_distance: f32,
    max_distance: f32,
    enabled: bool,

    limit: Limit,
    axis: Vec3,
    r_a: Vec3,
    r_b: Vec3,
    effective_mass: f32,
    total_impulse: f32,
}

impl DistanceConstraint {
    pub fn new(
        body_a: BodyId,
        body_b: BodyId,
        local_anchor_a: Vec3,
        local_anchor_b: Vec3,
        min_distance: f32,
        max_distance: f32,
    ) -> Self {
        let (min_distance, max_distance) = if min_distance <= max_distance {
            (min_distance.max(0.0), max_distance)
        } else {
            (max_distance.max(0.0), min_distance)
        };
        Self {
            body_a,
            body_b,
            local_anchor_a,
            local_anchor_b,
            min_distance,
            max_distance,
            enabled: true,
            limit: Limit::Free,
            axis: Vec3::Y,
            r_a: Vec3::ZERO,
            r_b: Vec3::ZERO,
            effective_mass: 0.0,
            total_impulse: 0.0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn min_distance(&self) -> f32 {
        self.min_distance
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    pub fn total_impulse(&self) -> f32 {
        self.total_impulse
    }

    fn anchors(&self, a: &SolverBody, b: &SolverBody) -> (Vec3, Vec3) {
        (a.rotation * self.local_anchor_a, b.rotation * self.local_anchor_b)
    }

    /// Axis from anchor A to anchor B and its length
    fn axis_and_length(a: &SolverBody, b: &SolverBody, r_a: Vec3, r_b: Vec3) -> (Vec3, f32) {
        let delta = (b.position + r_b) - (a.position + r_a);
        let length = delta.length();
        if length > 1.0e-6 {
            (delta / length, length)
        } else {
            (Vec3::Y, 0.0)
        }
    }

    fn apply(&self, a: &mut SolverBody, b: &mut SolverBody, impulse: Vec3) {
        a.apply_impulse(-impulse, self.r_a);
        b.apply_impulse(impulse, self.r_b);
    }
}

impl Constraint for DistanceConstraint {
    fn body_ids(&self) -> [BodyId; 2] {
        [self.body_a, self.body_b]
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn setup_velocity(&mut self, a: &SolverBody, b: &SolverBody, _delta_time: f32) {
        let (r_a, r_b) = self.anchors(a, b);
        let (axis, length) = Self::axis_and_length(a, b, r_a, r_b);
        self.r_a = r_a;
        self.r_b = r_b;
        self.axis = axis;

        let limit = if self.min_distance == self.max_distance {
            Limit::Rigid
        } else if length <= self.min_distance {
            Limit::AtMin
        } else if length >= self.max_distance {
            Limit::AtMax
        } else {
            Limit::Free
        };
        if limit != self.limit {
            self.total_impulse = 0.0;
        }
        self.limit = limit;

        let inverse_mass = a.inverse_effective_mass(r_a, axis) + b.inverse_effective_mass(r_b, axis);
        self.effective_mass = if inverse_mass > f32::EPSILON {
            1.0 / inverse_mass
        } else {
            0.0
        };
    }

    fn warm_start(&mut self, a: &mut SolverBody, b: &mut SolverBody) {
        if self.limit != Limit::Free && self.total_impulse != 0.0 {
            self.apply(a, b, self.axis * self.total_impulse);
        }
    }

    fn solve_velocity(&mut self, a: &mut SolverBody, b: &mut SolverBody) -> bool {
        if self.limit == Limit::Free || self.effective_mass == 0.0 {
            return false;
        }
        let velocity = (b.velocity_at(self.r_b) - a.velocity_at(self.r_a)).dot(self.axis);
        let unclamped = self.total_impulse - velocity * self.effective_mass;
        let total = match self.limit {
            Limit::AtMin => unclamped.max(0.0),
            Limit::AtMax => unclamped.min(0.0),
            _ => unclamped,
        };
        let delta = total - self.total_impulse;
        self.total_impulse = total;
        if delta == 0.0 {
            return false;
        }
        self.apply(a, b, self.axis * delta);
        true
    }

    fn solve_position(&mut self, a: &mut SolverBody, b: &mut SolverBody, baumgarte: f32, _slop: f32) -> bool {
        let (r_a, r_b) = self.anchors(a, b);
        let (axis, length) = Self::axis_and_length(a, b, r_a, r_b);
        let error = length - length.clamp(self.min_distance, self.max_distance);
        if error == 0.0 {
            return false;
        }

        let inverse_mass = a.inverse_effective_mass(r_a, axis) + b.inverse_effective_mass(r_b, axis);
        if inverse_mass <= f32::EPSILON {
            return false;
        }
        let impulse = axis * (-baumgarte * error / inverse_mass);
        a.apply_position_impulse(-impulse, r_a);
        b.apply_position_impulse(impulse, r_b);
        true
    }
}
