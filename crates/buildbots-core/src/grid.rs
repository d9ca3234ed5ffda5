//! In-memory voxel world and agents used by the demo host and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use slotmap::SlotMap;

use crate::{
    Actor, ActorDirectory, AgentId, CellPos, OccupantId, RegionId, Vec3, VerticalBounds,
    VoxelWorld, WorldDirectory,
};

/// Sparse voxel grid; cells never written hold air.
#[derive(Debug, Clone, Default)]
pub struct VoxelGrid {
    bounds: VerticalBounds,
    cells: HashMap<CellPos, OccupantId>,
    replaceable: HashSet<OccupantId>,
    protected: HashSet<OccupantId>,
    locked: HashSet<CellPos>,
    writes: u64,
}

impl VoxelGrid {
    #[must_use]
    pub fn new(bounds: VerticalBounds) -> Self {
        Self {
            bounds,
            ..Self::default()
        }
    }

    /// Grid with a solid square floor at `floor_y` spanning `-half..=half` on x and z.
    #[must_use]
    pub fn with_floor(bounds: VerticalBounds, floor_y: i32, half: i32, floor: &OccupantId) -> Self {
        let mut grid = Self::new(bounds);
        grid.fill(
            CellPos::new(-half, floor_y, -half),
            CellPos::new(half, floor_y, half),
            floor,
        );
        grid
    }

    /// Set every cell of the inclusive box spanned by `a` and `b`.
    pub fn fill(&mut self, a: CellPos, b: CellPos, occupant: &OccupantId) {
        for x in a.x.min(b.x)..=a.x.max(b.x) {
            for y in a.y.min(b.y)..=a.y.max(b.y) {
                for z in a.z.min(b.z)..=a.z.max(b.z) {
                    self.put(CellPos::new(x, y, z), occupant.clone());
                }
            }
        }
    }

    /// Unconditional write that bypasses locks and the write counter.
    pub fn put(&mut self, pos: CellPos, occupant: OccupantId) {
        if occupant.is_air() {
            self.cells.remove(&pos);
        } else {
            self.cells.insert(pos, occupant);
        }
    }

    /// Occupants placements may overwrite (grass, snow, ...).
    pub fn mark_replaceable(&mut self, occupant: OccupantId) {
        self.replaceable.insert(occupant);
    }

    /// Occupants the safety policy forbids touching.
    pub fn mark_protected(&mut self, occupant: OccupantId) {
        self.protected.insert(occupant);
    }

    /// Make [`VoxelWorld::set_occupant`] fail for `pos`.
    pub fn lock_cell(&mut self, pos: CellPos) {
        self.locked.insert(pos);
    }

    pub fn unlock_cell(&mut self, pos: CellPos) {
        self.locked.remove(&pos);
    }

    /// Number of accepted writes made through [`VoxelWorld::set_occupant`].
    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.writes
    }

    /// Number of non-air cells.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.cells.len()
    }
}

impl VoxelWorld for VoxelGrid {
    fn occupant(&self, pos: CellPos) -> OccupantId {
        self.cells.get(&pos).cloned().unwrap_or_else(OccupantId::air)
    }

    fn is_empty(&self, pos: CellPos) -> bool {
        !self.cells.contains_key(&pos)
    }

    fn is_replaceable(&self, pos: CellPos) -> bool {
        self.cells
            .get(&pos)
            .is_none_or(|occupant| self.replaceable.contains(occupant))
    }

    fn is_solid(&self, pos: CellPos) -> bool {
        self.cells
            .get(&pos)
            .is_some_and(|occupant| !self.replaceable.contains(occupant))
    }

    fn set_occupant(&mut self, pos: CellPos, occupant: &OccupantId) -> bool {
        if self.locked.contains(&pos) || !self.bounds.contains(pos.y) {
            return false;
        }
        self.put(pos, occupant.clone());
        self.writes += 1;
        true
    }

    fn vertical_bounds(&self) -> VerticalBounds {
        self.bounds
    }

    fn is_protected(&self, occupant: &OccupantId) -> bool {
        self.protected.contains(occupant)
    }
}

/// Simulated agent that teleports wherever it is asked to.
#[derive(Debug, Clone, PartialEq)]
pub struct SimActor {
    pub position: Vec3,
    pub present: bool,
    /// Relocation requests honoured so far.
    pub moves: u64,
}

impl SimActor {
    #[must_use]
    pub const fn at(position: Vec3) -> Self {
        Self {
            position,
            present: true,
            moves: 0,
        }
    }
}

impl Actor for SimActor {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn request_teleport(&mut self, to: Vec3) -> bool {
        if !self.present {
            return false;
        }
        self.position = to;
        self.moves += 1;
        true
    }

    fn is_present(&self) -> bool {
        self.present
    }
}

impl WorldDirectory for BTreeMap<RegionId, VoxelGrid> {
    fn world_mut(&mut self, region: &RegionId) -> Option<&mut dyn VoxelWorld> {
        self.get_mut(region).map(|grid| grid as &mut dyn VoxelWorld)
    }
}

impl ActorDirectory for SlotMap<AgentId, SimActor> {
    fn actor_mut(&mut self, agent: AgentId) -> Option<&mut dyn Actor> {
        self.get_mut(agent).map(|actor| actor as &mut dyn Actor)
    }
}

/// Worlds plus agents; the two halves are borrowed separately during a tick.
#[derive(Debug, Default)]
pub struct Sandbox {
    pub worlds: BTreeMap<RegionId, VoxelGrid>,
    pub actors: SlotMap<AgentId, SimActor>,
}

impl Sandbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, position: Vec3) -> AgentId {
        self.actors.insert(SimActor::at(position))
    }

    #[must_use]
    pub fn world(&self, region: &RegionId) -> Option<&VoxelGrid> {
        self.worlds.get(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stone() -> OccupantId {
        OccupantId::parse("stone").expect("id")
    }

    #[test]
    fn grid_tracks_occupancy_and_policy() {
        let mut grid = VoxelGrid::with_floor(VerticalBounds::default(), -1, 2, &stone());
        assert_eq!(grid.filled(), 25);
        let below = CellPos::new(0, -1, 0);
        assert!(grid.is_solid(below));
        assert!(grid.is_empty(below.up()));
        assert_eq!(grid.occupant(below.up()), OccupantId::air());

        let grass = OccupantId::parse("grass").expect("id");
        grid.put(CellPos::new(1, 0, 1), grass.clone());
        grid.mark_replaceable(grass);
        assert!(grid.is_replaceable(CellPos::new(1, 0, 1)));
        assert!(!grid.is_solid(CellPos::new(1, 0, 1)));
        assert!(!grid.is_replaceable(below));

        grid.lock_cell(CellPos::new(0, 0, 0));
        assert!(!grid.set_occupant(CellPos::new(0, 0, 0), &stone()));
        assert!(grid.set_occupant(CellPos::new(0, 1, 0), &stone()));
        assert!(!grid.set_occupant(CellPos::new(0, 400, 0), &stone()));
        assert_eq!(grid.writes(), 1);
    }

    #[test]
    fn directories_resolve_members() {
        let mut sandbox = Sandbox::new();
        let region = RegionId::new("overworld").expect("region");
        sandbox
            .worlds
            .insert(region.clone(), VoxelGrid::new(VerticalBounds::default()));
        let agent = sandbox.spawn(Vec3::new(0.5, 0.0, 0.5));

        assert!(sandbox.worlds.world_mut(&region).is_some());
        let actor = sandbox.actors.actor_mut(agent).expect("actor");
        assert!(actor.request_teleport(Vec3::new(3.5, 0.0, 0.5)));
        assert!((actor.squared_distance_to(Vec3::new(0.5, 0.0, 0.5)) - 9.0).abs() < 1e-9);
    }
}
