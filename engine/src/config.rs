//! Configuration types for the physics scene

use crate::physics::body::BodyId;
use crate::physics::collision::layers::{
    BroadPhaseLayerInterface, CollisionLayerPairFilter, CollisionVsBroadPhaseLayerFilter, TwoLayerSetup,
};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from loading, saving or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Solver and sleeping parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsSettings {
    pub gravity: Vec3,
    /// Velocity iterations per collision step, unless a body overrides it
    pub num_velocity_steps: u32,
    /// Position iterations per collision step, unless a body overrides it
    pub num_position_steps: u32,
    /// Fraction of the penetration removed per position iteration
    pub baumgarte: f32,
    /// Penetration that is tolerated without position correction
    pub penetration_slop: f32,
    /// Bodies closer than this get a contact before they touch
    pub speculative_contact_distance: f32,
    /// Approach speed below which contacts do not bounce
    pub min_velocity_for_restitution: f32,
    pub allow_sleeping: bool,
    /// Seconds a body must be at rest before it may sleep
    pub time_before_sleep: f32,
    /// A sleep test point moving less than this (m/s) counts as resting
    pub point_velocity_sleep_threshold: f32,
    /// A LinearCast body is swept once it moves more than this fraction of
    /// its inner radius in a step
    pub linear_cast_threshold: f32,
    /// Upper bound on parallel collision jobs; 0 uses every worker thread
    pub max_collision_workers: u32,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            num_velocity_steps: 10,
            num_position_steps: 2,
            baumgarte: 0.2,
            penetration_slop: 0.02,
            speculative_contact_distance: 0.02,
            min_velocity_for_restitution: 1.0,
            allow_sleeping: true,
            time_before_sleep: 0.5,
            point_velocity_sleep_threshold: 0.03,
            linear_cast_threshold: 0.75,
            max_collision_workers: 0,
        }
    }
}

/// Sizes of the scene and its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub max_bodies: u32,
    /// Body lock stripes; 0 picks a count from the available parallelism
    pub num_body_mutexes: u32,
    /// Capacity of the contact pair cache
    pub max_body_pairs: u32,
    /// Contacts solved per collision step
    pub max_contact_constraints: u32,
    pub physics: PhysicsSettings,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            max_bodies: 10_240,
            num_body_mutexes: 0,
            max_body_pairs: 65_536,
            max_contact_constraints: 10_240,
            physics: PhysicsSettings::default(),
        }
    }
}

impl SceneConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = ?path, "Loading scene config");

        let json = fs::read_to_string(path)?;
        let config: SceneConfig = serde_json::from_str(&json)?;
        config.validate()?;

        debug!(?config, "Scene config loaded");
        Ok(config)
    }

    /// Save this configuration as pretty printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        info!(path = ?path, "Saving scene config");

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_bodies_limit = BodyId::MAX_BODY_INDEX + 1;
        if self.max_bodies == 0 || self.max_bodies > max_bodies_limit {
            return Err(ConfigError::Invalid(format!(
                "max_bodies must be in 1..={max_bodies_limit}, got {}",
                self.max_bodies
            )));
        }
        if self.max_body_pairs == 0 {
            return Err(ConfigError::Invalid("max_body_pairs must be at least 1".into()));
        }
        if self.max_contact_constraints == 0 {
            return Err(ConfigError::Invalid(
                "max_contact_constraints must be at least 1".into(),
            ));
        }

        let physics = &self.physics;
        if physics.num_velocity_steps == 0 || physics.num_position_steps == 0 {
            return Err(ConfigError::Invalid(format!(
                "solver step counts must be at least 1, got {} velocity / {} position",
                physics.num_velocity_steps, physics.num_position_steps
            )));
        }
        if !(0.0..=1.0).contains(&physics.baumgarte) {
            return Err(ConfigError::Invalid(format!(
                "baumgarte must be in [0, 1], got {}",
                physics.baumgarte
            )));
        }
        if !physics.gravity.is_finite() {
            return Err(ConfigError::Invalid("gravity must be finite".into()));
        }
        let non_negative = [
            ("penetration_slop", physics.penetration_slop),
            ("speculative_contact_distance", physics.speculative_contact_distance),
            ("min_velocity_for_restitution", physics.min_velocity_for_restitution),
            ("time_before_sleep", physics.time_before_sleep),
            ("point_velocity_sleep_threshold", physics.point_velocity_sleep_threshold),
            ("linear_cast_threshold", physics.linear_cast_threshold),
        ];
        for (name, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 0, got {value}")));
            }
        }
        Ok(())
    }
}

/// Application supplied layer mapping and filters
#[derive(Clone)]
pub struct LayerFilters {
    pub broad_phase_layer_interface: Arc<dyn BroadPhaseLayerInterface>,
    pub object_vs_broad_phase_layer_filter: Arc<dyn CollisionVsBroadPhaseLayerFilter>,
    pub object_layer_pair_filter: Arc<dyn CollisionLayerPairFilter>,
}

impl LayerFilters {
    pub fn new(
        broad_phase_layer_interface: Arc<dyn BroadPhaseLayerInterface>,
        object_vs_broad_phase_layer_filter: Arc<dyn CollisionVsBroadPhaseLayerFilter>,
        object_layer_pair_filter: Arc<dyn CollisionLayerPairFilter>,
    ) -> Self {
        Self {
            broad_phase_layer_interface,
            object_vs_broad_phase_layer_filter,
            object_layer_pair_filter,
        }
    }

    /// [`TwoLayerSetup`] for all three roles
    pub fn two_layer() -> Self {
        let setup = Arc::new(TwoLayerSetup);
        Self::new(setup.clone(), setup.clone(), setup)
    }
}

impl std::fmt::Debug for LayerFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerFilters")
            .field(
                "num_broad_phase_layers",
                &self.broad_phase_layer_interface.num_broad_phase_layers(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = SceneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.physics.gravity, Vec3::new(0.0, -9.81, 0.0));
    }

    #[test]
    fn test_save_load_config() {
        let mut config = SceneConfig::default();
        config.max_bodies = 128;
        config.physics.gravity = Vec3::new(0.0, -1.62, 0.0);
        config.physics.allow_sleeping = false;

        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        config.save_to_file(temp_file.path()).expect("Failed to save config");
        let loaded = SceneConfig::load_from_file(temp_file.path()).expect("Failed to load config");

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: SceneConfig =
            serde_json::from_str(r#"{ "max_bodies": 64, "physics": { "num_velocity_steps": 4 } }"#)
                .expect("Failed to parse config");
        assert_eq!(config.max_bodies, 64);
        assert_eq!(config.physics.num_velocity_steps, 4);
        assert_eq!(config.physics.num_position_steps, 2);
        assert_eq!(config.max_body_pairs, SceneConfig::default().max_body_pairs);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = SceneConfig::default();
        config.max_bodies = BodyId::MAX_BODY_INDEX + 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SceneConfig::default();
        config.physics.num_position_steps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SceneConfig::default();
        config.physics.penetration_slop = f32::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_json() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        std::fs::write(temp_file.path(), "{ invalid json }").expect("Failed to write file");
        assert!(matches!(
            SceneConfig::load_from_file(temp_file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
