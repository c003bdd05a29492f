//! Non-penetration constraint built from a narrow phase contact

use super::{Constraint, SolverBody};
use crate::physics::body::BodyId;
use crate::physics::collision::contact_listener::{BodyPair, CachedContact, ContactSettings};
use crate::physics::collision::Contact;
use glam::Vec3;

/// Cached impulses are reused only when the normal barely changed
const WARM_START_NORMAL_COS: f32 = 0.99;

/// One contact point with friction along two tangents.
///
/// The contact is anchored on both surfaces at setup; the position solve
/// tracks how far those anchors still overlap along the normal.
#[derive(Debug, Clone)]
pub struct ContactConstraint {
    body_a: BodyId,
    body_b: BodyId,
    position: Vec3,
    normal: Vec3,
    tangent: Vec3,
    bitangent: Vec3,
    penetration: f32,
    friction: f32,
    restitution: f32,
    min_velocity_for_restitution: f32,

    local_a: Vec3,
    local_b: Vec3,
    r_a: Vec3,
    r_b: Vec3,
    normal_mass: f32,
    tangent_mass: f32,
    bitangent_mass: f32,
    target_velocity: f32,

    normal_impulse: f32,
    tangent_impulse: f32,
    bitangent_impulse: f32,
}

impl ContactConstraint {
    pub fn new(contact: &Contact, settings: &ContactSettings, min_velocity_for_restitution: f32) -> Self {
        Self {
            body_a: contact.body_a,
            body_b: contact.body_b,
            position: contact.position,
            normal: contact.normal,
            tangent: contact.tangent,
            bitangent: contact.bitangent,
            penetration: contact.penetration,
            friction: settings.combined_friction,
            restitution: settings.combined_restitution,
            min_velocity_for_restitution,
            local_a: Vec3::ZERO,
            local_b: Vec3::ZERO,
            r_a: Vec3::ZERO,
            r_b: Vec3::ZERO,
            normal_mass: 0.0,
            tangent_mass: 0.0,
            bitangent_mass: 0.0,
            target_velocity: 0.0,
            normal_impulse: 0.0,
            tangent_impulse: 0.0,
            bitangent_impulse: 0.0,
        }
    }

    /// Start from the impulses of the previous step if the contact did not turn
    pub fn with_cached_impulses(mut self, cached: &CachedContact) -> Self {
        if cached.normal.dot(self.normal) >= WARM_START_NORMAL_COS {
            self.normal_impulse = cached.normal_impulse;
            self.tangent_impulse = cached.tangent_impulse;
            self.bitangent_impulse = cached.bitangent_impulse;
        }
        self
    }

    pub fn pair(&self) -> BodyPair {
        BodyPair::new(self.body_a, self.body_b)
    }

    pub fn normal(&self) -> Vec3 {
        self.normal
    }

    pub fn penetration(&self) -> f32 {
        self.penetration
    }

    /// Accumulated normal, tangent and bitangent impulses
    pub fn impulses(&self) -> (f32, f32, f32) {
        (self.normal_impulse, self.tangent_impulse, self.bitangent_impulse)
    }

    /// Cache entry carrying this contact's impulses into the next step
    pub fn to_cached(&self) -> CachedContact {
        CachedContact {
            normal: self.normal,
            normal_impulse: self.normal_impulse,
            tangent_impulse: self.tangent_impulse,
            bitangent_impulse: self.bitangent_impulse,
        }
    }

    fn relative_velocity(&self, a: &SolverBody, b: &SolverBody) -> Vec3 {
        b.velocity_at(self.r_b) - a.velocity_at(self.r_a)
    }

    fn apply(&self, a: &mut SolverBody, b: &mut SolverBody, impulse: Vec3) {
        a.apply_impulse(-impulse, self.r_a);
        b.apply_impulse(impulse, self.r_b);
    }

    fn solve_friction_axis(
        &self,
        a: &mut SolverBody,
        b: &mut SolverBody,
        axis: Vec3,
        mass: f32,
        accumulated: f32,
        max_impulse: f32,
    ) -> f32 {
        let velocity = self.relative_velocity(a, b).dot(axis);
        let total = (accumulated - velocity * mass).clamp(-max_impulse, max_impulse);
        let delta = total - accumulated;
        if delta != 0.0 {
            self.apply(a, b, axis * delta);
        }
        total
    }
}

fn inverse_or_zero(value: f32) -> f32 {
    if value > f32::EPSILON {
        1.0 / value
    } else {
        0.0
    }
}

impl Constraint for ContactConstraint {
    fn body_ids(&self) -> [BodyId; 2] {
        [self.body_a, self.body_b]
    }

    fn setup_velocity(&mut self, a: &SolverBody, b: &SolverBody, delta_time: f32) {
        let half = self.normal * (self.penetration * 0.5);
        let point_a = self.position + half;
        let point_b = self.position - half;
        self.r_a = point_a - a.position;
        self.r_b = point_b - b.position;
        self.local_a = a.rotation.conjugate() * self.r_a;
        self.local_b = b.rotation.conjugate() * self.r_b;

        self.normal_mass = inverse_or_zero(
            a.inverse_effective_mass(self.r_a, self.normal) + b.inverse_effective_mass(self.r_b, self.normal),
        );
        self.tangent_mass = inverse_or_zero(
            a.inverse_effective_mass(self.r_a, self.tangent) + b.inverse_effective_mass(self.r_b, self.tangent),
        );
        self.bitangent_mass = inverse_or_zero(
            a.inverse_effective_mass(self.r_a, self.bitangent)
                + b.inverse_effective_mass(self.r_b, self.bitangent),
        );

        let approach = self.relative_velocity(a, b).dot(self.normal);
        self.target_velocity = if self.penetration < 0.0 {
            // Still apart: allow closing the gap within this step
            self.penetration / delta_time
        } else if approach < -self.min_velocity_for_restitution {
            -self.restitution * approach
        } else {
            0.0
        };
    }

    fn warm_start(&mut self, a: &mut SolverBody, b: &mut SolverBody) {
        let impulse = self.normal * self.normal_impulse
            + self.tangent * self.tangent_impulse
            + self.bitangent * self.bitangent_impulse;
        if impulse != Vec3::ZERO {
            self.apply(a, b, impulse);
        }
    }

    fn solve_velocity(&mut self, a: &mut SolverBody, b: &mut SolverBody) -> bool {
        let before = self.impulses();

        // Friction first, bounded by the normal impulse of the previous iteration
        let max_friction = self.friction * self.normal_impulse;
        self.tangent_impulse =
            self.solve_friction_axis(a, b, self.tangent, self.tangent_mass, self.tangent_impulse, max_friction);
        self.bitangent_impulse = self.solve_friction_axis(
            a,
            b,
            self.bitangent,
            self.bitangent_mass,
            self.bitangent_impulse,
            max_friction,
        );

        let velocity = self.relative_velocity(a, b).dot(self.normal);
        let total = (self.normal_impulse + (self.target_velocity - velocity) * self.normal_mass).max(0.0);
        let delta = total - self.normal_impulse;
        if delta != 0.0 {
            self.apply(a, b, self.normal * delta);
        }
        self.normal_impulse = total;

        before != self.impulses()
    }

    fn solve_position(&mut self, a: &mut SolverBody, b: &mut SolverBody, baumgarte: f32, slop: f32) -> bool {
        let r_a = a.rotation * self.local_a;
        let r_b = b.rotation * self.local_b;
        let separation = ((b.position + r_b) - (a.position + r_a)).dot(self.normal);
        let error = (separation + slop).min(0.0);
        if error >= 0.0 {
            return false;
        }

        let inverse_mass =
            a.inverse_effective_mass(r_a, self.normal) + b.inverse_effective_mass(r_b, self.normal);
        if inverse_mass <= f32::EPSILON {
            return false;
        }
        let impulse = self.normal * (-baumgarte * error / inverse_mass);
        a.apply_position_impulse(-impulse, r_a);
        b.apply_position_impulse(impulse, r_b);
        true
    }
}
