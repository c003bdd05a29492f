//! Collision layers, broad phase layers and the filters between them
//!
//! Every body has a [`CollisionLayer`]. The application maps collision layers
//! onto a smaller set of [`BroadPhaseLayer`]s through a
//! [`BroadPhaseLayerInterface`], which the broad phase uses to keep bodies
//! that never interact in separate structures.

use serde::{Deserialize, Serialize};

/// Application defined layer of a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CollisionLayer(pub u16);

/// Layer a body is sorted into by the broad phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BroadPhaseLayer(pub u8);

/// Maps collision layers onto broad phase layers
pub trait BroadPhaseLayerInterface: Send + Sync {
    fn num_broad_phase_layers(&self) -> u32;

    fn broad_phase_layer(&self, layer: CollisionLayer) -> BroadPhaseLayer;
}

/// Decides whether a collision layer can hit anything in a broad phase layer
pub trait CollisionVsBroadPhaseLayerFilter: Send + Sync {
    fn should_collide(&self, layer: CollisionLayer, broad_phase_layer: BroadPhaseLayer) -> bool;
}

/// Decides whether two collision layers can collide
pub trait CollisionLayerPairFilter: Send + Sync {
    fn should_collide(&self, a: CollisionLayer, b: CollisionLayer) -> bool;
}

/// Group membership used to exclude pairs of bodies, e.g. the links of a ragdoll.
///
/// Bodies sharing a valid group id collide only when their sub groups differ by
/// more than one (adjacent sub groups are assumed to be jointed together).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollisionGroup {
    pub group_id: u32,
    pub sub_group_id: u32,
}

impl CollisionGroup {
    pub const INVALID_GROUP: u32 = u32::MAX;

    pub fn new(group_id: u32, sub_group_id: u32) -> Self {
        Self {
            group_id,
            sub_group_id,
        }
    }

    pub fn can_collide(&self, other: &CollisionGroup) -> bool {
        if self.group_id == Self::INVALID_GROUP || self.group_id != other.group_id {
            return true;
        }
        self.sub_group_id.abs_diff(other.sub_group_id) > 1
    }
}

impl Default for CollisionGroup {
    fn default() -> Self {
        Self {
            group_id: Self::INVALID_GROUP,
            sub_group_id: 0,
        }
    }
}

/// Layer for bodies that never move
pub const NON_MOVING: CollisionLayer = CollisionLayer(0);
/// Layer for everything else
pub const MOVING: CollisionLayer = CollisionLayer(1);

/// Broad phase layer for [`NON_MOVING`]
pub const BP_NON_MOVING: BroadPhaseLayer = BroadPhaseLayer(0);
/// Broad phase layer for [`MOVING`]
pub const BP_MOVING: BroadPhaseLayer = BroadPhaseLayer(1);

/// Two layer setup: moving bodies hit everything, non-moving bodies only hit moving ones
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoLayerSetup;

impl BroadPhaseLayerInterface for TwoLayerSetup {
    fn num_broad_phase_layers(&self) -> u32 {
        2
    }

    fn broad_phase_layer(&self, layer: CollisionLayer) -> BroadPhaseLayer {
        if layer == NON_MOVING {
            BP_NON_MOVING
        } else {
            BP_MOVING
        }
    }
}

impl CollisionVsBroadPhaseLayerFilter for TwoLayerSetup {
    fn should_collide(&self, layer: CollisionLayer, broad_phase_layer: BroadPhaseLayer) -> bool {
        layer != NON_MOVING || broad_phase_layer == BP_MOVING
    }
}

impl CollisionLayerPairFilter for TwoLayerSetup {
    fn should_collide(&self, a: CollisionLayer, b: CollisionLayer) -> bool {
        a != NON_MOVING || b != NON_MOVING
    }
}
