//! Activation callbacks and the permit used during simulation steps

use super::id::BodyId;

/// Receives activation changes.
///
/// Called while the active-body mutex is held, possibly from worker threads.
/// Implementations must not activate, deactivate, add or remove bodies.
pub trait BodyActivationListener: Send + Sync {
    fn on_body_activated(&self, id: BodyId, user_data: u64);
    fn on_body_deactivated(&self, id: BodyId, user_data: u64);
}

/// Proof that the caller is a simulation stage allowed to change the active
/// set while it is frozen. Only the scene can create one.
#[derive(Debug)]
pub struct ActivationPermit {
    _private: (),
}

impl ActivationPermit {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}
