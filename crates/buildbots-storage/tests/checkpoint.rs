use std::fs;
use std::sync::Arc;

use buildbots_brain::{ModelStore, PlacementModel, extract_features};
use buildbots_core::{
    AgentId, ByteStore, CellPos, MoveMode, OccupantId, RegionId, RuntimeSettings, Sandbox,
    SharedSettings, Vec3, VerticalBounds, VoxelGrid,
};
use buildbots_jobs::{JobRequest, JobSet, Runner};
use buildbots_storage::{CheckpointReason, CheckpointStore, FileStore, MemoryStore};

fn stone() -> OccupantId {
    OccupantId::parse("stone").expect("id")
}

/// Runner holding three progressed jobs for three agents.
fn progressed_runner() -> (Runner, Sandbox, Vec<AgentId>) {
    let mut sandbox = Sandbox::new();
    let region = RegionId::new("overworld").expect("region");
    let mut grid = VoxelGrid::with_floor(VerticalBounds::default(), -1, 16, &stone());
    for z in [0, 5, 10] {
        grid.put(CellPos::new(2, 0, z), OccupantId::parse("dirt").expect("id"));
    }
    sandbox.worlds.insert(region.clone(), grid);

    let runner = Runner::new(SharedSettings::new(RuntimeSettings::default()));
    let mut agents = Vec::new();
    for (index, reach) in [4.5, 6.0, 3.0].into_iter().enumerate() {
        runner.settings().update(|s| {
            s.reach_distance = reach;
            s.move_mode = if index == 1 { MoveMode::Walk } else { MoveMode::Auto };
        });
        // Each agent builds in its own lane so jobs never touch each other.
        let z = 5 * index as i32;
        let agent = sandbox.spawn(Vec3::new(0.5, 0.0, f64::from(z) + 0.5));
        let request = JobRequest::new(agent, region.clone(), format!("job {index}\nline two"))
            .with_target(CellPos::new(1, 0, z), "stone")
            .with_target(CellPos::new(2, 0, z), "minecraft:stone")
            .with_target(CellPos::new(0, 0, z + 3), "stone");
        runner.submit(request).expect("submit");
        agents.push(agent);
    }
    let mut reports: Vec<(AgentId, String)> = Vec::new();
    for _ in 0..2 {
        runner.tick(&mut sandbox.worlds, &mut sandbox.actors, &mut reports);
    }
    (runner, sandbox, agents)
}

/// Move the second exported job into the pending list.
fn mixed_set(runner: &Runner) -> JobSet {
    let mut set = runner.export_jobs();
    let pending = set.active.remove(1);
    set.pending.push(pending);
    set
}

#[test]
fn checkpoint_round_trips_active_and_pending_jobs() {
    let (runner, _sandbox, _agents) = progressed_runner();
    let set = mixed_set(&runner);
    assert!(set.active.iter().chain(&set.pending).all(|job| job.counters.placed == 1));
    assert!(set.pending[0].counters.blocked == 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = CheckpointStore::new(Arc::new(FileStore::open(dir.path()).expect("store")));
    assert!(checkpoints.load().expect("empty load").is_none());
    assert_eq!(checkpoints.save(&set, CheckpointReason::Shutdown).expect("save"), 3);

    let restored = checkpoints.load().expect("load").expect("checkpoint");
    assert_eq!(restored.dropped, 0);
    assert_eq!(restored.reason, CheckpointReason::Shutdown);
    assert_eq!(restored.jobs, set);
    let original = &set.pending[0];
    let copy = &restored.jobs.pending[0];
    assert_eq!(
        copy.settings.reach_distance().to_bits(),
        original.settings.reach_distance().to_bits()
    );
    assert_eq!(copy.settings.move_mode(), MoveMode::Walk);
    assert_eq!(
        copy.counters.total_score.to_bits(),
        original.counters.total_score.to_bits()
    );
    assert_eq!(copy.tag, "job 1\nline two");

    let fresh = Runner::new(SharedSettings::default());
    assert_eq!(fresh.restore(restored.jobs), 3);
    assert_eq!(fresh.active_count(), 2);
    assert_eq!(fresh.pending_count(), 1);
}

#[test]
fn corrupted_job_is_dropped_and_siblings_survive() {
    let (runner, _sandbox, agents) = progressed_runner();
    let set = runner.export_jobs();
    let dir = tempfile::tempdir().expect("tempdir");
    let files = FileStore::open(dir.path()).expect("store");
    let checkpoints = CheckpointStore::new(Arc::new(files.clone()));
    checkpoints.save(&set, CheckpointReason::Interval).expect("save");

    let path = files.path_for("checkpoint").expect("path");
    let text = fs::read_to_string(&path).expect("read");
    let damaged: String = text
        .lines()
        .filter(|line| !line.starts_with("job.1.entry.0.occupant="))
        .map(|line| format!("{line}\n"))
        .collect();
    assert_ne!(damaged, text);
    fs::write(&path, damaged).expect("write");

    let restored = checkpoints.load().expect("load").expect("checkpoint");
    assert_eq!(restored.dropped, 1);
    assert_eq!(restored.reason, CheckpointReason::Interval);
    let agents_left: Vec<AgentId> = restored.jobs.active.iter().map(|job| job.agent).collect();
    assert_eq!(agents_left, vec![agents[0], agents[2]]);
    assert_eq!(restored.jobs.active[0], set.active[0]);
    assert_eq!(restored.jobs.active[1], set.active[2]);
}

#[test]
fn inflated_job_count_restores_only_recorded_jobs() {
    let (runner, _sandbox, _agents) = progressed_runner();
    let set = runner.export_jobs();
    let store = Arc::new(MemoryStore::new());
    let checkpoints = CheckpointStore::new(store.clone());

    let mut props = buildbots_storage::encode_checkpoint(&set, CheckpointReason::Interval);
    props.insert("job.count".into(), "50000000".into());
    props.insert("job.1.entry.0.attempts".into(), "9".into());
    let text = buildbots_core::encode_properties(&props);
    store
        .write_atomic(buildbots_storage::CHECKPOINT_RECORD, text.as_bytes())
        .expect("write");

    let restored = checkpoints.load().expect("load").expect("checkpoint");
    assert_eq!(restored.dropped, 1);
    assert_eq!(
        restored.jobs.active,
        vec![set.active[0].clone(), set.active[2].clone()]
    );
}

#[test]
fn invalid_cursor_or_state_drops_the_job() {
    let (runner, _sandbox, _agents) = progressed_runner();
    let set = runner.export_jobs();
    let store = Arc::new(MemoryStore::new());
    let checkpoints = CheckpointStore::new(store.clone()).with_record("alt");
    checkpoints.save(&set, CheckpointReason::Manual).expect("save");
    assert_eq!(store.names(), vec!["alt".to_owned()]);

    let mut props = buildbots_storage::encode_checkpoint(&set, CheckpointReason::Manual);
    props.insert("job.0.cursor".into(), "99".into());
    props.insert("job.2.state".into(), "paused".into());
    let restored = buildbots_storage::decode_checkpoint(&props).expect("decode");
    assert_eq!(restored.dropped, 2);
    assert_eq!(restored.jobs.active, vec![set.active[1].clone()]);
}

#[test]
fn model_store_persists_through_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let models = ModelStore::new(Arc::new(FileStore::open(dir.path()).expect("store")));
    assert_eq!(models.load().expect("defaults"), PlacementModel::default());

    let mut grid = VoxelGrid::with_floor(VerticalBounds::default(), -1, 4, &stone());
    grid.put(CellPos::new(1, 0, 0), stone());
    let features = extract_features(&grid, Vec3::new(0.5, 0.0, 0.5), CellPos::new(1, 1, 0));
    let mut model = PlacementModel::default();
    model.train(&features, false);
    models.save(&model).expect("save");
    assert_eq!(models.load().expect("load"), model);
    assert!(dir.path().join("placement-model.properties").exists());
}
