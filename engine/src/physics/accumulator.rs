//! Fixed timestep accumulator for driving [`super::PhysicsScene::update`]
//! from a variable frame rate

use parking_lot::Mutex;
use tracing::warn;

/// Collects frame time and hands it out as whole physics steps
#[derive(Debug)]
pub struct StepAccumulator {
    accumulated: Mutex<f32>,
    /// Length of one physics step
    pub fixed_timestep: f32,
    /// Most steps returned by one call to [`StepAccumulator::accumulate`]
    pub max_steps: u32,
}

impl StepAccumulator {
    pub fn new(fixed_timestep: f32, max_steps: u32) -> Self {
        Self {
            accumulated: Mutex::new(0.0),
            fixed_timestep,
            max_steps: max_steps.max(1),
        }
    }

    /// Add frame time; returns the number of fixed steps to run
    pub fn accumulate(&self, delta_time: f32) -> u32 {
        let mut accumulated = self.accumulated.lock();
        *accumulated += delta_time.max(0.0);

        // Drop time we cannot catch up with instead of spiralling
        let limit = self.fixed_timestep * self.max_steps as f32;
        if *accumulated > limit {
            warn!(
                accumulated = *accumulated,
                limit, "Physics is falling behind, dropping time"
            );
            *accumulated = limit;
        }

        let steps = (*accumulated / self.fixed_timestep) as u32;
        *accumulated -= steps as f32 * self.fixed_timestep;
        steps
    }

    /// How far the leftover time is into the next step, in `[0, 1)`
    pub fn interpolation_alpha(&self) -> f32 {
        *self.accumulated.lock() / self.fixed_timestep
    }

    pub fn accumulated_time(&self) -> f32 {
        *self.accumulated.lock()
    }

    pub fn reset(&self) {
        *self.accumulated.lock() = 0.0;
    }
}

impl Default for StepAccumulator {
    fn default() -> Self {
        Self::new(1.0 / 60.0, 8)
    }
}
