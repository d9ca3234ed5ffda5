//! Horizon-bounded A* over standable grid cells.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use buildbots_core::{CellPos, VoxelWorld};
use ordered_float::OrderedFloat;

use crate::is_standable;

/// Search node identity.
pub type PathKey = CellPos;

/// Hard cap on node expansions per search.
pub const MAX_EXPANSIONS: usize = 3200;
/// Nodes whose heuristic distance to the goal is at most this count as arrived.
pub const NEAR_GOAL: f64 = 1.25;

const STRAIGHT_COST: f64 = 1.0;
const DIAGONAL_COST: f64 = 1.41;
const CLIMB_COST: f64 = 0.35;
const VERTICAL_HEURISTIC_WEIGHT: f64 = 0.8;
const G_EPSILON: f64 = 1e-9;

const DIRECTIONS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// Open-set entry ordered by f-cost, then by push order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathNode {
    pub key: PathKey,
    pub g: OrderedFloat<f64>,
    pub f: OrderedFloat<f64>,
    seq: u64,
}

impl PartialOrd for PathNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f.cmp(&other.f).then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Search window measured from the start cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub horizontal: i32,
    pub vertical: i32,
}

impl SearchLimits {
    /// Window that grows with the start-to-goal separation.
    #[must_use]
    pub fn between(start: PathKey, goal: PathKey) -> Self {
        let dx = f64::from(goal.x) - f64::from(start.x);
        let dz = f64::from(goal.z) - f64::from(start.z);
        let horizontal_distance = (dx * dx + dz * dz).sqrt();
        let horizontal = ((horizontal_distance * 1.8).ceil() + 10.0).clamp(18.0, 64.0) as i32;
        let vertical = goal.y.abs_diff(start.y).saturating_add(5).clamp(4, 14) as i32;
        Self {
            horizontal,
            vertical,
        }
    }

    fn admits(&self, start: PathKey, cell: PathKey) -> bool {
        cell.x.abs_diff(start.x) <= self.horizontal.unsigned_abs()
            && cell.z.abs_diff(start.z) <= self.horizontal.unsigned_abs()
            && cell.y.abs_diff(start.y) <= self.vertical.unsigned_abs()
    }
}

/// Result of one search. An empty `cells` list means no usable path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathSearch {
    /// Cells to step through, excluding the start and ending at (or next to) the goal.
    pub cells: Vec<PathKey>,
    /// Accumulated edge cost of `cells`.
    pub cost: f64,
    /// Nodes expanded before the search finished.
    pub expanded: usize,
}

impl PathSearch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Heuristic distance with the vertical axis under-weighted.
#[must_use]
pub fn heuristic(from: PathKey, to: PathKey) -> f64 {
    let dx = f64::from(to.x) - f64::from(from.x);
    let dy = (f64::from(to.y) - f64::from(from.y)) * VERTICAL_HEURISTIC_WEIGHT;
    let dz = f64::from(to.z) - f64::from(from.z);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Cost of moving between two neighbouring cells.
#[must_use]
pub fn step_cost(from: PathKey, to: PathKey) -> f64 {
    let diagonal = from.x != to.x && from.z != to.z;
    let base = if diagonal { DIAGONAL_COST } else { STRAIGHT_COST };
    base + CLIMB_COST * f64::from(to.y.abs_diff(from.y))
}

/// Find a walkable route from `start` toward `goal`.
///
/// Nodes may be pushed several times; a popped node whose g-cost is worse
/// than the best one recorded is stale and skipped. The search gives up after
/// [`MAX_EXPANSIONS`] expansions and returns an empty path.
#[must_use]
pub fn find_path(world: &dyn VoxelWorld, start: PathKey, goal: PathKey) -> PathSearch {
    if start == goal {
        return PathSearch::default();
    }

    let limits = SearchLimits::between(start, goal);
    let mut open = BinaryHeap::new();
    let mut best_g: HashMap<PathKey, f64> = HashMap::new();
    let mut came_from: HashMap<PathKey, PathKey> = HashMap::new();
    let mut seq = 0_u64;
    let mut expanded = 0_usize;

    best_g.insert(start, 0.0);
    open.push(Reverse(PathNode {
        key: start,
        g: OrderedFloat(0.0),
        f: OrderedFloat(heuristic(start, goal)),
        seq,
    }));

    while let Some(Reverse(node)) = open.pop() {
        let g = node.g.into_inner();
        if best_g
            .get(&node.key)
            .is_some_and(|&best| g > best + G_EPSILON)
        {
            continue;
        }
        if node.key == goal || heuristic(node.key, goal) <= NEAR_GOAL {
            return PathSearch {
                cells: reconstruct(&came_from, start, node.key),
                cost: g,
                expanded,
            };
        }
        if expanded >= MAX_EXPANSIONS {
            return PathSearch {
                expanded,
                ..PathSearch::default()
            };
        }
        expanded += 1;

        for (dx, dz) in DIRECTIONS {
            for dy in -1..=1 {
                let next = node.key.offset(dx, dy, dz);
                if !limits.admits(start, next) || !is_standable(world, next) {
                    continue;
                }
                if dx != 0 && dz != 0 {
                    let shoulder_x = node.key.offset(dx, dy, 0);
                    let shoulder_z = node.key.offset(0, dy, dz);
                    if !is_standable(world, shoulder_x) && !is_standable(world, shoulder_z) {
                        continue;
                    }
                }
                let next_g = g + step_cost(node.key, next);
                if best_g
                    .get(&next)
                    .is_none_or(|&known| next_g + G_EPSILON < known)
                {
                    best_g.insert(next, next_g);
                    came_from.insert(next, node.key);
                    seq += 1;
                    open.push(Reverse(PathNode {
                        key: next,
                        g: OrderedFloat(next_g),
                        f: OrderedFloat(next_g + heuristic(next, goal)),
                        seq,
                    }));
                }
            }
        }
    }

    PathSearch {
        expanded,
        ..PathSearch::default()
    }
}

fn reconstruct(came_from: &HashMap<PathKey, PathKey>, start: PathKey, end: PathKey) -> Vec<PathKey> {
    let mut cells = Vec::new();
    let mut cursor = end;
    while cursor != start {
        cells.push(cursor);
        match came_from.get(&cursor) {
            Some(&previous) => cursor = previous,
            None => break,
        }
    }
    cells.reverse();
    cells
}
