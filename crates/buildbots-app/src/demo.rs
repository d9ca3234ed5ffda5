//! Seeded demo world: a stone plain with scattered grass and bedrock, a row
//! of agents, and one hollow tower blueprint per agent.

use buildbots_core::{
    AgentId, CellPos, IdError, OccupantId, RegionId, Sandbox, Vec3, VerticalBounds, VoxelGrid,
};
use buildbots_jobs::JobRequest;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub const DEMO_REGION: &str = "overworld";
const FLOOR_HALF: i32 = 40;
const TOWER_SIDE: i32 = 5;
const TOWER_HEIGHT: i32 = 3;
const MATERIALS: [&str; 3] = ["stone", "minecraft:cobblestone", "minecraft:oak_planks"];

/// Everything the host needs to run the demo.
#[derive(Debug)]
pub struct DemoWorld {
    pub sandbox: Sandbox,
    pub region: RegionId,
    pub agents: Vec<AgentId>,
    pub requests: Vec<JobRequest>,
}

impl DemoWorld {
    /// Build the demo deterministically from `seed`.
    pub fn generate(seed: u64, agent_count: usize) -> Result<Self, IdError> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let region = RegionId::new(DEMO_REGION)?;
        let grass = OccupantId::parse("minecraft:grass")?;
        let bedrock = OccupantId::parse("minecraft:bedrock")?;

        let mut grid = VoxelGrid::with_floor(
            VerticalBounds::default(),
            -1,
            FLOOR_HALF,
            &OccupantId::parse("stone")?,
        );
        grid.mark_replaceable(grass.clone());
        grid.mark_protected(bedrock.clone());
        for _ in 0..120 {
            let cell = CellPos::new(
                rng.random_range(-FLOOR_HALF..=FLOOR_HALF),
                0,
                rng.random_range(-FLOOR_HALF..=FLOOR_HALF),
            );
            let fill = if rng.random_bool(0.9) { &grass } else { &bedrock };
            grid.put(cell, fill.clone());
        }

        let mut sandbox = Sandbox::new();
        sandbox.worlds.insert(region.clone(), grid);

        let mut agents = Vec::with_capacity(agent_count);
        let mut requests = Vec::with_capacity(agent_count);
        for index in 0..agent_count {
            let lane = index as i32 * (TOWER_SIDE + 6) - FLOOR_HALF / 2;
            let spawn = Vec3::new(f64::from(lane) + 0.5, 0.0, -15.5);
            let agent = sandbox.spawn(spawn);
            let material = MATERIALS[rng.random_range(0..MATERIALS.len())];
            let origin = CellPos::new(lane, 0, rng.random_range(0..8));
            requests.push(tower_request(agent, &region, index, origin, material));
            agents.push(agent);
        }

        Ok(Self {
            sandbox,
            region,
            agents,
            requests,
        })
    }
}

/// Hollow square tower, bottom layer first.
fn tower_request(
    agent: AgentId,
    region: &RegionId,
    index: usize,
    origin: CellPos,
    material: &str,
) -> JobRequest {
    let mut request = JobRequest::new(agent, region.clone(), format!("tower-{index}"));
    for y in 0..TOWER_HEIGHT {
        for dx in 0..TOWER_SIDE {
            for dz in 0..TOWER_SIDE {
                let edge = dx == 0 || dz == 0 || dx == TOWER_SIDE - 1 || dz == TOWER_SIDE - 1;
                if edge {
                    request = request.with_target(origin.offset(dx, y, dz), material);
                }
            }
        }
    }
    request
}
