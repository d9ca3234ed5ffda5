//! Movement planning for build agents: standability, bounded A*, and the
//! per-tick "get within reach" decision.

use buildbots_core::{Actor, CellPos, MoveMode, SettingsSnapshot, VoxelWorld};
use tracing::debug;

pub mod approach;
pub mod astar;

pub use approach::{ApproachPoint, select_approach};
pub use astar::{MAX_EXPANSIONS, NEAR_GOAL, PathKey, PathNode, PathSearch, find_path};

/// Walk mode stops once the agent is this close to reach.
pub const WALK_SLACK: f64 = 0.1;
/// A teleport succeeds when it lands within reach plus this slack.
pub const TELEPORT_SLACK: f64 = 0.5;
/// Path cells a single walk advances through per tick.
pub const DEFAULT_WALK_STEPS: usize = 8;

/// Per-tick movement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavOutcome {
    /// Target already within reach; nothing moved.
    AlreadyInRange,
    /// The agent moved toward the target.
    Moved,
    /// No movement happened; the caller decides whether to retry.
    NoProgress,
}

/// Whether an agent could rest in `cell`: the cell and the one above are
/// passable, the one below is solid, and all three lie within the world.
#[must_use]
pub fn is_standable(world: &dyn VoxelWorld, cell: CellPos) -> bool {
    let bounds = world.vertical_bounds();
    if !bounds.contains(cell.y.saturating_sub(1)) || !bounds.contains(cell.y.saturating_add(1)) {
        return false;
    }
    !world.is_solid(cell) && !world.is_solid(cell.up()) && world.is_solid(cell.down())
}

/// Straight-line distance from the agent to the target cell's center.
#[must_use]
pub fn distance_to_target(actor: &dyn Actor, target: CellPos) -> f64 {
    actor.squared_distance_to(target.center()).sqrt()
}

fn adjacent(a: CellPos, b: CellPos) -> bool {
    (a.x - b.x).abs() <= 1 && (a.y - b.y).abs() <= 1 && (a.z - b.z).abs() <= 1
}

/// Moves agents toward targets according to the job's settings snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Navigator {
    walk_steps: usize,
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new(DEFAULT_WALK_STEPS)
    }
}

impl Navigator {
    /// Navigator advancing at most `walk_steps` path cells per walk.
    #[must_use]
    pub fn new(walk_steps: usize) -> Self {
        Self {
            walk_steps: walk_steps.max(1),
        }
    }

    /// Try to bring `target` within reach of `actor` during this tick.
    pub fn ensure_in_range(
        &self,
        world: &dyn VoxelWorld,
        actor: &mut dyn Actor,
        target: CellPos,
        settings: &SettingsSnapshot,
    ) -> NavOutcome {
        let reach = settings.reach_distance();
        if distance_to_target(actor, target) <= reach {
            return NavOutcome::AlreadyInRange;
        }
        if !settings.smart_move() {
            return NavOutcome::NoProgress;
        }
        if !target.is_addressable() || !CellPos::containing(actor.position()).is_addressable() {
            debug!(%target, "target or agent outside the addressable world");
            return NavOutcome::NoProgress;
        }
        let Some(approach) = select_approach(world, actor.position(), target, reach) else {
            debug!(%target, "no approach point within reach");
            return NavOutcome::NoProgress;
        };

        match settings.move_mode() {
            MoveMode::Teleport => Self::teleport(actor, target, reach, &approach),
            MoveMode::Walk => self.walk(world, actor, target, reach, &approach),
            MoveMode::Auto => match self.walk(world, actor, target, reach, &approach) {
                NavOutcome::NoProgress => Self::teleport(actor, target, reach, &approach),
                outcome => outcome,
            },
        }
    }

    fn teleport(
        actor: &mut dyn Actor,
        target: CellPos,
        reach: f64,
        approach: &ApproachPoint,
    ) -> NavOutcome {
        if !actor.request_teleport(approach.feet) {
            return NavOutcome::NoProgress;
        }
        let distance = distance_to_target(actor, target);
        debug!(%target, cell = %approach.cell, distance, "teleported to approach point");
        if distance <= reach + TELEPORT_SLACK {
            NavOutcome::Moved
        } else {
            NavOutcome::NoProgress
        }
    }

    fn walk(
        &self,
        world: &dyn VoxelWorld,
        actor: &mut dyn Actor,
        target: CellPos,
        reach: f64,
        approach: &ApproachPoint,
    ) -> NavOutcome {
        if distance_to_target(actor, target) <= reach + WALK_SLACK {
            return NavOutcome::AlreadyInRange;
        }
        let start = CellPos::containing(actor.position());
        let search = find_path(world, start, approach.cell);
        let mut cells = search.cells;
        // The search stops near the goal; finish the last adjacent step here.
        let end = cells.last().copied().unwrap_or(start);
        if end != approach.cell && adjacent(end, approach.cell) && is_standable(world, approach.cell)
        {
            cells.push(approach.cell);
        }
        if cells.is_empty() {
            debug!(%start, goal = %approach.cell, expanded = search.expanded, "no walkable path");
            return NavOutcome::NoProgress;
        }

        let mut steps = 0_usize;
        for &cell in cells.iter().take(self.walk_steps) {
            if !is_standable(world, cell) || !actor.request_teleport(cell.feet()) {
                break;
            }
            steps += 1;
            if distance_to_target(actor, target) <= reach + WALK_SLACK {
                break;
            }
        }
        debug!(%target, steps, path_len = cells.len(), "walked toward target");
        if steps > 0 {
            NavOutcome::Moved
        } else {
            NavOutcome::NoProgress
        }
    }
}
