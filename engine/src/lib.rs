//! Rigid body physics engine
//!
//! This crate provides a thread-safe body registry with striped per-body
//! locks, a body interface for creating and mutating bodies, and a physics
//! scene that steps the simulation with a parallel solver pipeline.

pub mod config;
pub mod physics;

// Re-export commonly used types
pub mod prelude {
    // Math types
    pub use glam::{Mat3, Mat4, Quat, Vec3};

    // Config types
    pub use crate::config::{ConfigError, LayerFilters, PhysicsSettings, SceneConfig};

    // Body types
    pub use crate::physics::body::{
        Activation, AllowedDofs, Body, BodyActivationListener, BodyCreateInfo, BodyError, BodyId,
        BodyInterface, BodyLockRead, BodyLockWrite, BodyManager, MotionQuality, MotionType,
    };

    // Collision types
    pub use crate::physics::collision::layers::{
        BroadPhaseLayer, CollisionGroup, CollisionLayer, TwoLayerSetup, MOVING, NON_MOVING,
    };
    pub use crate::physics::collision::shapes::{Shape, ShapeRef};
    pub use crate::physics::collision::{Contact, AABB};
    pub use crate::physics::{BodyPair, ContactListener, ContactSettings};

    // Simulation types
    pub use crate::physics::{
        Constraint, ConstraintId, DistanceConstraint, PhysicsScene, PhysicsStepListener,
        StepAccumulator, StepContext, UpdateErrors,
    };
}

/// Initialize logging for the engine
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
