//! The per-tick build scheduler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use buildbots_brain::{ModelError, ModelStore, PlacementModel, extract_features};
use buildbots_core::{
    Actor, ActorDirectory, AgentId, AgentMap, CellPos, NullPreview, PREVIEW_MARKER_LIMIT,
    PreviewSink, ReportSink, SettingsSnapshot, SharedSettings, VoxelWorld, WorldDirectory,
};
use buildbots_nav::{NavOutcome, Navigator, TELEPORT_SLACK, distance_to_target};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::{
    DEFERRAL_CAP, Job, JobError, JobRequest, JobSnapshot, LOOKAHEAD_LIMIT, REPORT_INTERVAL,
    RETRY_CAP, Resolution, Target, TaskPhase,
};

/// Errors surfaced to request handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("agent {0:?} has no pending job")]
    NoPendingJob(AgentId),
    #[error("agent {0:?} already has an active job")]
    ActiveJobExists(AgentId),
}

/// How a submission was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Became the agent's active job.
    Started,
    /// Became the active job, discarding the previous one.
    Replaced,
    /// Staged as a pending preview awaiting confirmation.
    Staged,
    /// Staged, discarding the previously pending preview.
    Restaged,
}

/// Per-tick telemetry for the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs that took a step this tick.
    pub processed: usize,
    /// Finished jobs removed after their completion report.
    pub completed: usize,
    /// Jobs removed because their agent or region went away.
    pub dropped: usize,
    /// Voxels written this tick.
    pub placed: usize,
}

/// Every job the runner holds, split by state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSet {
    pub active: Vec<JobSnapshot>,
    pub pending: Vec<JobSnapshot>,
}

impl JobSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len() + self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
struct JobBook {
    active: AgentMap<Job>,
    pending: AgentMap<Job>,
}

/// Owns active and pending jobs and advances each active one per tick.
pub struct Runner {
    settings: SharedSettings,
    navigator: Navigator,
    jobs: Mutex<JobBook>,
    model: Mutex<PlacementModel>,
    model_store: Option<ModelStore>,
    preview: Arc<dyn PreviewSink>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("navigator", &self.navigator)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Runner {
    #[must_use]
    pub fn new(settings: SharedSettings) -> Self {
        Self {
            settings,
            navigator: Navigator::default(),
            jobs: Mutex::new(JobBook::default()),
            model: Mutex::new(PlacementModel::default()),
            model_store: None,
            preview: Arc::new(NullPreview),
        }
    }

    #[must_use]
    pub fn with_navigator(mut self, navigator: Navigator) -> Self {
        self.navigator = navigator;
        self
    }

    #[must_use]
    pub fn with_preview(mut self, preview: Arc<dyn PreviewSink>) -> Self {
        self.preview = preview;
        self
    }

    #[must_use]
    pub fn with_model(self, model: PlacementModel) -> Self {
        *self.lock_model() = model;
        self
    }

    /// Persist the classifier here whenever a job completes.
    #[must_use]
    pub fn with_model_store(mut self, store: ModelStore) -> Self {
        self.model_store = Some(store);
        self
    }

    #[must_use]
    pub const fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    fn lock_jobs(&self) -> MutexGuard<'_, JobBook> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_model(&self) -> MutexGuard<'_, PlacementModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job, binding it to the settings current at this moment.
    pub fn submit(&self, request: JobRequest) -> Result<Submission, RunnerError> {
        let targets = request.parse_targets()?;
        let settings = self.settings.snapshot();
        let job = Job::new(request.agent, request.region, request.tag, targets, settings)?;
        let agent = job.agent();

        if settings.preview_before_build() {
            let markers: Vec<CellPos> = job
                .targets()
                .iter()
                .take(PREVIEW_MARKER_LIMIT)
                .map(|target| target.cell)
                .collect();
            let region = job.region().clone();
            let replaced = self.lock_jobs().pending.insert(agent, job).is_some();
            self.preview.preview(agent, &region, &markers);
            info!(?agent, %region, markers = markers.len(), replaced, "job staged for preview");
            return Ok(if replaced {
                Submission::Restaged
            } else {
                Submission::Staged
            });
        }

        let targets = job.total_targets();
        let replaced = self.lock_jobs().active.insert(agent, job).is_some();
        info!(?agent, targets, replaced, "job started");
        Ok(if replaced {
            Submission::Replaced
        } else {
            Submission::Started
        })
    }

    /// Promote the agent's pending job to active.
    pub fn confirm(&self, agent: AgentId) -> Result<(), RunnerError> {
        let mut book = self.lock_jobs();
        if !book.pending.contains_key(agent) {
            return Err(RunnerError::NoPendingJob(agent));
        }
        if book.active.contains_key(agent) {
            return Err(RunnerError::ActiveJobExists(agent));
        }
        if let Some(job) = book.pending.remove(agent) {
            info!(?agent, targets = job.total_targets(), "pending job confirmed");
            book.active.insert(agent, job);
        }
        Ok(())
    }

    /// Remove the agent's active and pending jobs. Returns whether any existed.
    pub fn cancel(&self, agent: AgentId) -> bool {
        let mut book = self.lock_jobs();
        let active = book.active.remove(agent).is_some();
        let pending = book.pending.remove(agent).is_some();
        if active || pending {
            info!(?agent, active, pending, "job cancelled");
        }
        active || pending
    }

    #[must_use]
    pub fn active_job(&self, agent: AgentId) -> Option<JobSnapshot> {
        self.lock_jobs().active.get(agent).map(Job::snapshot)
    }

    #[must_use]
    pub fn pending_job(&self, agent: AgentId) -> Option<JobSnapshot> {
        self.lock_jobs().pending.get(agent).map(Job::snapshot)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock_jobs().active.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_jobs().pending.len()
    }

    /// Copy every job for checkpointing.
    #[must_use]
    pub fn export_jobs(&self) -> JobSet {
        let book = self.lock_jobs();
        JobSet {
            active: book.active.values().map(Job::snapshot).collect(),
            pending: book.pending.values().map(Job::snapshot).collect(),
        }
    }

    /// Re-register checkpointed jobs. Invalid snapshots are skipped; returns
    /// how many were restored.
    pub fn restore(&self, jobs: JobSet) -> usize {
        let mut book = self.lock_jobs();
        let mut restored = 0;
        for (snapshots, pending) in [(jobs.active, false), (jobs.pending, true)] {
            for snapshot in snapshots {
                let agent = snapshot.agent;
                match Job::from_snapshot(snapshot) {
                    Ok(job) => {
                        let map = if pending {
                            &mut book.pending
                        } else {
                            &mut book.active
                        };
                        map.insert(agent, job);
                        restored += 1;
                    }
                    Err(err) => warn!(?agent, %err, "skipping unrestorable job"),
                }
            }
        }
        info!(restored, "jobs restored");
        restored
    }

    #[must_use]
    pub fn model(&self) -> PlacementModel {
        self.lock_model().clone()
    }

    pub fn reset_model(&self) {
        self.lock_model().reset();
        info!("placement model reset");
    }

    pub fn configure_model(&self, threshold: f64, learning_rate: f64) -> Result<(), ModelError> {
        self.lock_model().configure(threshold, learning_rate)
    }

    /// Advance every active job by one step.
    pub fn tick(
        &self,
        worlds: &mut dyn WorldDirectory,
        actors: &mut dyn ActorDirectory,
        reports: &mut dyn ReportSink,
    ) -> TickReport {
        let mut summary = TickReport::default();
        let mut finished: Vec<AgentId> = Vec::new();
        {
            let mut guard = self.lock_jobs();
            let book = &mut *guard;
            let mut model = self.lock_model();
            let agents: Vec<AgentId> = book.active.keys().collect();

            for agent in agents {
                let present = actors.actor_mut(agent).is_some_and(|actor| actor.is_present());
                if !present {
                    if book.active.remove(agent).is_some() {
                        info!(?agent, "agent gone; job dropped");
                    }
                    summary.dropped += 1;
                    continue;
                }
                let Some(job) = book.active.get_mut(agent) else {
                    continue;
                };
                if job.is_complete() {
                    reports.report(agent, &job.completion_line());
                    info!(?agent, tag = job.tag(), counters = ?job.counters(), "job complete");
                    book.active.remove(agent);
                    summary.completed += 1;
                    finished.push(agent);
                    continue;
                }

                job.record_tick();
                let Some(world) = worlds.world_mut(job.region()) else {
                    reports.report(
                        agent,
                        &format!("[{}] region {} unavailable; job aborted", job.tag(), job.region()),
                    );
                    warn!(?agent, region = %job.region(), "region unavailable; job dropped");
                    book.active.remove(agent);
                    summary.dropped += 1;
                    continue;
                };
                let Some(actor) = actors.actor_mut(agent) else {
                    continue;
                };

                summary.placed += self.step(job, world, actor, &mut model);
                summary.processed += 1;
                if !job.is_complete() && job.counters().ticks % REPORT_INTERVAL == 0 {
                    reports.report(agent, &job.progress_line());
                }
            }
        }

        if !finished.is_empty() {
            self.persist_model(&finished, reports);
        }
        summary
    }

    fn persist_model(&self, finished: &[AgentId], reports: &mut dyn ReportSink) {
        let Some(store) = &self.model_store else {
            return;
        };
        let model = self.model();
        if let Err(err) = store.save(&model) {
            warn!(%err, "failed to persist placement model");
            for &agent in finished {
                reports.report(agent, &format!("placement model not saved: {err}"));
            }
        }
    }

    /// Run one scheduling step for `job`; returns the number of voxels written.
    fn step(
        &self,
        job: &mut Job,
        world: &mut dyn VoxelWorld,
        actor: &mut dyn Actor,
        model: &mut PlacementModel,
    ) -> usize {
        let settings = *job.settings();
        if settings.scheduler_lookahead() {
            skip_already_placed(job, world);
        }
        let Some(target) = job.current_target().cloned() else {
            job.set_phase(TaskPhase::Complete);
            return 0;
        };

        job.set_phase(TaskPhase::Navigate);
        match self
            .navigator
            .ensure_in_range(world, actor, target.cell, &settings)
        {
            NavOutcome::AlreadyInRange => {}
            NavOutcome::NoProgress => {
                let attempts = job.record_attempt();
                debug!(cell = %target.cell, attempts, "no progress toward target");
                if attempts >= RETRY_CAP {
                    job.resolve(Resolution::NoReach);
                }
                return 0;
            }
            NavOutcome::Moved => {
                job.record_moved();
                if !in_placement_range(actor, target.cell, &settings) {
                    let deferrals = job.record_deferral();
                    debug!(cell = %target.cell, deferrals, "moved but still out of range");
                    if deferrals >= DEFERRAL_CAP {
                        job.resolve(Resolution::NoReach);
                    }
                    return 0;
                }
            }
        }

        job.set_phase(TaskPhase::Validate);
        if let Some(resolution) = check_legality(world, &target, &settings) {
            debug!(cell = %target.cell, ?resolution, "target resolved without placement");
            job.resolve(resolution);
            return 0;
        }

        let features = extract_features(world, actor.position(), target.cell);
        job.record_score(model.score(&features));
        if !model.should_place(&features) {
            model.train(&features, false);
            debug!(cell = %target.cell, ?features, "classifier rejected placement");
            job.resolve(Resolution::MlRejected);
            return 0;
        }

        job.set_phase(TaskPhase::Place);
        let success = world.set_occupant(target.cell, &target.occupant);
        model.train(&features, success);
        if success {
            job.resolve(Resolution::Placed);
            return 1;
        }
        let attempts = job.record_attempt();
        debug!(cell = %target.cell, attempts, "world rejected placement");
        if attempts >= RETRY_CAP {
            job.resolve(Resolution::Failed);
        }
        0
    }
}

/// Resolve targets whose cell already holds the desired occupant without
/// spending the step on them.
fn skip_already_placed(job: &mut Job, world: &dyn VoxelWorld) {
    let mut skipped = 0;
    while skipped < LOOKAHEAD_LIMIT {
        let Some(target) = job.current_target() else {
            break;
        };
        if world.occupant(target.cell) != target.occupant {
            break;
        }
        job.resolve(Resolution::AlreadyPlaced);
        skipped += 1;
    }
    if skipped > 0 {
        debug!(skipped, cursor = job.cursor(), "lookahead resolved placed targets");
    }
}

fn in_placement_range(actor: &dyn Actor, cell: CellPos, settings: &SettingsSnapshot) -> bool {
    distance_to_target(actor, cell) <= settings.reach_distance() + TELEPORT_SLACK
}

/// Ordered legality checks; `Some` short-circuits the target.
fn check_legality(
    world: &dyn VoxelWorld,
    target: &Target,
    settings: &SettingsSnapshot,
) -> Option<Resolution> {
    let current = world.occupant(target.cell);
    if current == target.occupant {
        return Some(Resolution::AlreadyPlaced);
    }
    if world.is_protected(&current) {
        return Some(Resolution::ProtectedBlocked);
    }
    let empty = world.is_empty(target.cell);
    if settings.strict_air_only() && !empty {
        return Some(Resolution::Blocked);
    }
    if !empty && !world.is_replaceable(target.cell) {
        return Some(Resolution::Blocked);
    }
    None
}
