//! Hooks run at the start of every collision step

use crate::physics::body::BodyInterface;

/// What a step listener gets to see
pub struct StepContext<'a> {
    /// Length of this collision step
    pub delta_time: f32,
    pub is_first_step: bool,
    pub is_last_step: bool,
    /// Locking body interface of the scene
    pub body_interface: &'a BodyInterface,
}

/// Called on the stepping thread before the bodies of a collision step are
/// simulated, e.g. to drive kinematic bodies or apply custom forces.
pub trait PhysicsStepListener: Send + Sync {
    fn on_step(&self, context: &StepContext<'_>);
}
