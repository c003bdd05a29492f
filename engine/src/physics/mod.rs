//! Rigid body physics
//!
//! Bodies live in a [`body::BodyManager`] and are accessed through a
//! [`body::BodyInterface`] that locks them per body. A [`PhysicsScene`] ties
//! the bodies to a broad phase, constraints and contact handling and steps
//! the simulation in parallel.

pub mod accumulator;
pub mod body;
pub mod collision;
pub mod constraints;
pub mod island;
pub mod scene;
pub mod step_listener;

// Re-export commonly used types
pub use accumulator::StepAccumulator;
pub use body::{
    Activation, Body, BodyActivationListener, BodyCreateInfo, BodyError, BodyId, BodyInterface,
    BodyManager, MotionQuality, MotionType,
};
pub use collision::contact_listener::{BodyPair, ContactListener, ContactSettings};
pub use collision::shapes::{Shape, ShapeRef};
pub use constraints::{Constraint, ConstraintId, DistanceConstraint};
pub use scene::{PhysicsScene, UpdateErrors};
pub use step_listener::{PhysicsStepListener, StepContext};
