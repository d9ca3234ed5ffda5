//! Ring-sampling search for a standable cell within reach of a target.

use std::collections::HashSet;
use std::f64::consts::TAU;

use buildbots_core::{CellPos, Vec3, VoxelWorld};

use crate::is_standable;

const RING_STEP: f64 = 0.55;
const RING_LIMIT: f64 = 6.4;
const RING_OVERSHOOT: f64 = 0.8;
const MIN_RING_SAMPLES: usize = 8;
const SAMPLES_PER_UNIT: f64 = 8.0;
const VERTICAL_BAND: i32 = 2;
/// Candidates may sit this far beyond reach from the target center.
pub const ACCEPT_SLACK: f64 = 0.35;
/// Staying put is acceptable when the agent is this close to reach.
pub const FALLBACK_SLACK: f64 = 0.25;

const TARGET_DISTANCE_WEIGHT: f64 = 0.45;
const RING_PREFERENCE_WEIGHT: f64 = 0.05;
const HEIGHT_CHANGE_WEIGHT: f64 = 0.18;

/// Where the agent should stand to work on a target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApproachPoint {
    pub cell: CellPos,
    /// Feet position to move the agent to.
    pub feet: Vec3,
    /// Lower is better; zero for the stay-put fallback.
    pub score: f64,
}

/// Choose the cheapest standable stand-point from which `target` is within `reach`.
///
/// Rings of growing radius are sampled around the target at feet levels
/// `target.y - 2 ..= target.y + 2`, plus the agent's own level when it lies
/// outside that band. Falls back to the agent's current spot when nothing
/// qualifies but the agent is already nearly in reach.
#[must_use]
pub fn select_approach(
    world: &dyn VoxelWorld,
    agent: Vec3,
    target: CellPos,
    reach: f64,
) -> Option<ApproachPoint> {
    let center = target.center();
    let max_radius = (reach + RING_OVERSHOOT).min(RING_LIMIT);
    let preferred_radius = reach - ACCEPT_SLACK;

    let mut levels: Vec<i32> = (target.y.saturating_sub(VERTICAL_BAND)
        ..=target.y.saturating_add(VERTICAL_BAND))
        .collect();
    let agent_level = agent.y.floor() as i32;
    if agent_level.abs_diff(target.y) > VERTICAL_BAND.unsigned_abs() {
        levels.push(agent_level);
    }

    let mut seen = HashSet::new();
    let mut best: Option<ApproachPoint> = None;
    let mut ring = 1_u32;
    loop {
        let radius = RING_STEP * f64::from(ring);
        if radius > max_radius + 1e-9 {
            break;
        }
        let samples = ((radius * SAMPLES_PER_UNIT).ceil() as usize).max(MIN_RING_SAMPLES);
        for sample in 0..samples {
            let angle = TAU * sample as f64 / samples as f64;
            let x = (center.x + angle.cos() * radius).floor() as i32;
            let z = (center.z + angle.sin() * radius).floor() as i32;
            for &y in &levels {
                let cell = CellPos::new(x, y, z);
                if !seen.insert(cell) || cell == target || cell.up() == target {
                    continue;
                }
                if !is_standable(world, cell) {
                    continue;
                }
                let feet = cell.feet();
                let to_target = feet.distance(center);
                if to_target > reach + ACCEPT_SLACK {
                    continue;
                }
                let score = feet.distance(agent)
                    + TARGET_DISTANCE_WEIGHT * to_target
                    + RING_PREFERENCE_WEIGHT * (radius - preferred_radius).abs()
                    + HEIGHT_CHANGE_WEIGHT * (feet.y - agent.y).abs();
                if best.is_none_or(|current| score < current.score) {
                    best = Some(ApproachPoint { cell, feet, score });
                }
            }
        }
        ring += 1;
    }

    best.or_else(|| {
        (agent.distance(center) <= reach + FALLBACK_SLACK).then(|| ApproachPoint {
            cell: CellPos::containing(agent),
            feet: agent,
            score: 0.0,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildbots_core::{OccupantId, VerticalBounds, VoxelGrid};

    fn floor() -> VoxelGrid {
        let stone = OccupantId::parse("stone").expect("id");
        VoxelGrid::with_floor(VerticalBounds::default(), -1, 24, &stone)
    }

    #[test]
    fn picks_reachable_cell_near_agent() {
        let world = floor();
        let target = CellPos::new(0, 0, 0);
        let agent = Vec3::new(12.5, 0.0, 0.5);
        let point = select_approach(&world, agent, target, 4.5).expect("approach");
        assert!(point.feet.distance(target.center()) <= 4.5 + ACCEPT_SLACK);
        assert!(point.cell.x > 0, "should approach from the agent's side");
        assert_eq!(point.cell.y, 0);
    }

    #[test]
    fn never_stands_inside_the_target() {
        let world = floor();
        let target = CellPos::new(3, 1, 3);
        let point =
            select_approach(&world, Vec3::new(3.5, 0.0, 3.5), target, 2.0).expect("approach");
        assert_ne!(point.cell, target);
        assert_ne!(point.cell.up(), target);
    }

    #[test]
    fn falls_back_to_current_spot_or_gives_up() {
        let world = VoxelGrid::new(VerticalBounds::default());
        let target = CellPos::new(0, 10, 0);
        let close = Vec3::new(0.5, 6.4, 0.5);
        let stay = select_approach(&world, close, target, 4.0).expect("fallback");
        assert_eq!(stay.feet, close);
        assert!(select_approach(&world, Vec3::new(40.0, 0.0, 0.0), target, 4.0).is_none());
    }
}
