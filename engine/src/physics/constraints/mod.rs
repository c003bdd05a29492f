//! Constraints solved per island
//!
//! Before solving, the bodies of an island are gathered into a flat array of
//! [`SolverBody`] values; constraints work on those copies and the results are
//! scattered back afterwards. Non-dynamic participants are gathered too but
//! never written back.

pub mod contact;
pub mod distance;

use crate::physics::body::{Body, BodyId};
use glam::{Mat3, Quat, Vec3};
use std::fmt::Debug;
use tracing::debug;

pub use contact::ContactConstraint;
pub use distance::DistanceConstraint;

/// Island-local copy of the state a constraint needs
#[derive(Debug, Clone)]
pub struct SolverBody {
    pub id: BodyId,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: f32,
    /// World space, already masked by the allowed rotations
    pub inv_inertia: Mat3,
    pub translation_mask: Vec3,
    pub max_linear_velocity: f32,
    pub max_angular_velocity: f32,
    pub is_dynamic: bool,
}

impl SolverBody {
    pub fn from_body(body: &Body) -> Self {
        let (translation_mask, max_linear_velocity, max_angular_velocity) = body
            .motion_properties()
            .map_or((Vec3::ONE, f32::MAX, f32::MAX), |motion| {
                (
                    motion.allowed_dofs().translation_mask(),
                    motion.max_linear_velocity,
                    motion.max_angular_velocity,
                )
            });
        Self {
            id: body.id(),
            position: body.position(),
            rotation: body.rotation(),
            linear_velocity: body.linear_velocity(),
            angular_velocity: body.angular_velocity(),
            inv_mass: body.inverse_mass(),
            inv_inertia: body.inverse_inertia_world(),
            translation_mask,
            max_linear_velocity,
            max_angular_velocity,
            is_dynamic: body.is_dynamic(),
        }
    }

    /// Immovable stand-in for the world
    pub fn fixed() -> Self {
        Self {
            id: BodyId::INVALID,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            inv_mass: 0.0,
            inv_inertia: Mat3::ZERO,
            translation_mask: Vec3::ZERO,
            max_linear_velocity: f32::MAX,
            max_angular_velocity: f32::MAX,
            is_dynamic: false,
        }
    }

    pub fn velocity_at(&self, arm: Vec3) -> Vec3 {
        self.linear_velocity + self.angular_velocity.cross(arm)
    }

    /// Inverse effective mass of an impulse along `direction` applied at `arm`
    pub fn inverse_effective_mass(&self, arm: Vec3, direction: Vec3) -> f32 {
        if !self.is_dynamic {
            return 0.0;
        }
        let angular = arm.cross(direction);
        self.inv_mass * (direction * self.translation_mask).dot(direction)
            + (self.inv_inertia * angular).dot(angular)
    }

    pub fn apply_impulse(&mut self, impulse: Vec3, arm: Vec3) {
        if !self.is_dynamic {
            return;
        }
        self.linear_velocity += impulse * self.inv_mass * self.translation_mask;
        self.angular_velocity += self.inv_inertia * arm.cross(impulse);
    }

    /// Move the body directly, as if `impulse` acted over one unit of time
    pub fn apply_position_impulse(&mut self, impulse: Vec3, arm: Vec3) {
        if !self.is_dynamic {
            return;
        }
        self.position += impulse * self.inv_mass * self.translation_mask;
        let rotation = self.inv_inertia * arm.cross(impulse);
        self.rotation = integrate_rotation(self.rotation, rotation);
    }

    /// Clamp the velocities and advance the transform by `delta_time`
    pub fn integrate(&mut self, delta_time: f32) {
        if !self.is_dynamic {
            return;
        }
        self.linear_velocity = clamp_length(self.linear_velocity, self.max_linear_velocity);
        self.angular_velocity = clamp_length(self.angular_velocity, self.max_angular_velocity);
        self.position += self.linear_velocity * delta_time;
        self.rotation = integrate_rotation(self.rotation, self.angular_velocity * delta_time);
    }

    /// Write velocities and transform back; non-dynamic bodies are left alone
    pub fn scatter(&self, body: &mut Body) {
        if !self.is_dynamic {
            return;
        }
        body.set_linear_velocity_clamped(self.linear_velocity);
        body.set_angular_velocity_clamped(self.angular_velocity);
        if !body.position().abs_diff_eq(self.position, 0.0)
            || !body.rotation().abs_diff_eq(self.rotation, 0.0)
        {
            body.set_position_and_rotation_internal(self.position, self.rotation);
        }
    }
}

/// q' = q + 0.5 * ω * q, renormalized
pub(crate) fn integrate_rotation(rotation: Quat, angle: Vec3) -> Quat {
    if angle.length_squared() <= f32::EPSILON * f32::EPSILON {
        return rotation;
    }
    let omega = Quat::from_xyzw(angle.x, angle.y, angle.z, 0.0);
    let dq = (omega * rotation) * 0.5;
    (rotation + dq).normalize()
}

fn clamp_length(v: Vec3, max: f32) -> Vec3 {
    let length_sq = v.length_squared();
    if length_sq > max * max {
        v * (max / length_sq.sqrt())
    } else {
        v
    }
}

/// Two distinct elements of a slice, mutably
pub fn pair_mut(bodies: &mut [SolverBody], a: usize, b: usize) -> (&mut SolverBody, &mut SolverBody) {
    debug_assert_ne!(a, b, "a constraint cannot connect a body to itself");
    if a < b {
        let (left, right) = bodies.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = bodies.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Something that restricts the relative motion of two bodies
pub trait Constraint: Send + Sync + Debug {
    /// The two bodies; [`BodyId::INVALID`] stands for the world
    fn body_ids(&self) -> [BodyId; 2];

    fn is_enabled(&self) -> bool {
        true
    }

    /// Precompute effective masses and velocity targets for this step
    fn setup_velocity(&mut self, a: &SolverBody, b: &SolverBody, delta_time: f32);

    /// Apply the impulses remembered from the previous step
    fn warm_start(&mut self, _a: &mut SolverBody, _b: &mut SolverBody) {}

    /// One velocity iteration; returns whether an impulse was applied
    fn solve_velocity(&mut self, a: &mut SolverBody, b: &mut SolverBody) -> bool;

    /// One position iteration; returns whether a correction was applied
    fn solve_position(&mut self, a: &mut SolverBody, b: &mut SolverBody, baumgarte: f32, slop: f32) -> bool;
}

/// Handle of a constraint in a [`ConstraintManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintId(u32);

/// Storage for user constraints
#[derive(Debug, Default)]
pub struct ConstraintManager {
    constraints: Vec<Option<Box<dyn Constraint>>>,
    free: Vec<u32>,
}

impl ConstraintManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, constraint: Box<dyn Constraint>) -> ConstraintId {
        match self.free.pop() {
            Some(index) => {
                self.constraints[index as usize] = Some(constraint);
                ConstraintId(index)
            }
            None => {
                self.constraints.push(Some(constraint));
                ConstraintId((self.constraints.len() - 1) as u32)
            }
        }
    }

    pub fn remove(&mut self, id: ConstraintId) -> Option<Box<dyn Constraint>> {
        let removed = self.constraints.get_mut(id.0 as usize)?.take();
        if removed.is_some() {
            self.free.push(id.0);
        }
        removed
    }

    pub fn get(&self, id: ConstraintId) -> Option<&dyn Constraint> {
        self.constraints.get(id.0 as usize)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.constraints.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enabled constraints touching at least one body for which `is_active` holds
    pub fn active_constraints_mut(
        &mut self,
        is_active: impl Fn(BodyId) -> bool,
    ) -> Vec<&mut Box<dyn Constraint>> {
        let total = self.len();
        let active: Vec<&mut Box<dyn Constraint>> = self
            .constraints
            .iter_mut()
            .flatten()
            .filter(|constraint| {
                constraint.is_enabled()
                    && constraint
                        .body_ids()
                        .iter()
                        .any(|id| id.is_valid() && is_active(*id))
            })
            .collect();
        debug!(active = active.len(), total, "Determined active constraints");
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(index: u32, position: Vec3) -> SolverBody {
        SolverBody {
            id: BodyId::new(index, 1),
            position,
            inv_mass: 1.0,
            inv_inertia: Mat3::IDENTITY,
            translation_mask: Vec3::ONE,
            is_dynamic: true,
            ..SolverBody::fixed()
        }
    }

    #[test]
    fn test_pair_mut_either_order() {
        let mut bodies = vec![dynamic(0, Vec3::ZERO), dynamic(1, Vec3::X), dynamic(2, Vec3::Y)];
        let (a, b) = pair_mut(&mut bodies, 2, 0);
        assert_eq!(a.id, BodyId::new(2, 1));
        assert_eq!(b.id, BodyId::new(0, 1));
    }

    #[test]
    fn test_fixed_body_ignores_impulses() {
        let mut world = SolverBody::fixed();
        world.apply_impulse(Vec3::X, Vec3::Y);
        assert_eq!(world.linear_velocity, Vec3::ZERO);
        assert_eq!(world.inverse_effective_mass(Vec3::Y, Vec3::X), 0.0);
    }

    #[test]
    fn test_off_center_impulse_spins() {
        let mut body = dynamic(0, Vec3::ZERO);
        body.apply_impulse(Vec3::X, Vec3::Y);
        assert_eq!(body.linear_velocity, Vec3::X);
        assert!(body.angular_velocity.z < 0.0);
    }

    #[test]
    fn test_integrate_clamps_velocity() {
        let mut body = dynamic(0, Vec3::ZERO);
        body.max_linear_velocity = 2.0;
        body.linear_velocity = Vec3::new(10.0, 0.0, 0.0);
        body.integrate(0.5);
        assert!((body.position.x - 1.0).abs() < 1e-6);

        let mut world = SolverBody::fixed();
        world.linear_velocity = Vec3::X;
        world.integrate(1.0);
        assert_eq!(world.position, Vec3::ZERO);
    }

    #[test]
    fn test_manager_recycles_ids() {
        let mut manager = ConstraintManager::new();
        let a = BodyId::new(0, 1);
        let b = BodyId::new(1, 1);
        let first = manager.add(Box::new(DistanceConstraint::new(a, b, Vec3::ZERO, Vec3::X, 1.0, 1.0)));
        let second = manager.add(Box::new(DistanceConstraint::new(a, b, Vec3::ZERO, Vec3::X, 1.0, 1.0)));
        assert_eq!(manager.len(), 2);

        assert!(manager.remove(first).is_some());
        assert!(manager.remove(first).is_none());
        let third = manager.add(Box::new(DistanceConstraint::new(a, b, Vec3::ZERO, Vec3::X, 1.0, 1.0)));
        assert_eq!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn test_active_constraints() {
        let mut manager = ConstraintManager::new();
        let a = BodyId::new(0, 1);
        let b = BodyId::new(1, 1);
        let sleeping = BodyId::new(2, 1);
        manager.add(Box::new(DistanceConstraint::new(a, BodyId::INVALID, Vec3::ZERO, Vec3::X, 1.0, 1.0)));
        manager.add(Box::new(DistanceConstraint::new(sleeping, b, Vec3::ZERO, Vec3::X, 1.0, 1.0)));

        let active = manager.active_constraints_mut(|id| id == a);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].body_ids(), [a, BodyId::INVALID]);
    }
}
