//! Feature extraction for placement decisions.

use buildbots_core::{CellPos, Vec3, VoxelWorld};
use serde::{Deserialize, Serialize};

/// Number of inputs wired into the placement classifier.
pub const FEATURE_COUNT: usize = 4;

/// Agent-to-target distance at which the distance feature saturates.
const DISTANCE_SCALE: f64 = 8.0;

/// Inputs describing one candidate placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementFeatures {
    /// Constant 1.0.
    pub bias: f64,
    /// 1.0 when the target cell is empty or its occupant may be overwritten.
    pub replaceable: f64,
    /// 1.0 when the cell directly below is non-empty.
    pub support: f64,
    /// Agent distance to the target center over 8, capped at 1.0.
    pub normalized_distance: f64,
}

impl PlacementFeatures {
    #[must_use]
    pub const fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.bias,
            self.replaceable,
            self.support,
            self.normalized_distance,
        ]
    }
}

fn indicator(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

/// Describe placing into `target` for an agent whose feet are at `agent`.
#[must_use]
pub fn extract_features(world: &dyn VoxelWorld, agent: Vec3, target: CellPos) -> PlacementFeatures {
    let distance = agent.distance(target.center());
    PlacementFeatures {
        bias: 1.0,
        replaceable: indicator(world.is_empty(target) || world.is_replaceable(target)),
        support: indicator(!world.is_empty(target.down())),
        normalized_distance: (distance / DISTANCE_SCALE).min(1.0),
    }
}
