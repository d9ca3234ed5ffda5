//! Per-agent build job state.

use std::fmt::Write as _;

use buildbots_core::{AgentId, CellPos, IdError, OccupantId, RegionId, SettingsSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attempts a target may consume before it is abandoned.
pub const RETRY_CAP: u32 = 3;
/// Moved-but-still-out-of-range ticks a target may consume.
pub const DEFERRAL_CAP: u32 = 24;
/// Already-placed targets resolved ahead of the step when lookahead is on.
pub const LOOKAHEAD_LIMIT: usize = 16;
/// Ticks between progress reports.
pub const REPORT_INTERVAL: u64 = 40;

/// Errors raised when building or restoring a job.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job has no targets")]
    EmptyTargets,
    #[error("target {index} has an invalid occupant: {source}")]
    InvalidOccupant {
        index: usize,
        #[source]
        source: IdError,
    },
    #[error("cursor {cursor} exceeds {len} targets")]
    CursorOutOfRange { cursor: usize, len: usize },
    #[error("{entries} entry states for {targets} targets")]
    EntryMismatch { entries: usize, targets: usize },
    #[error("target {index} at {cell} lies outside the addressable world")]
    CellOutOfRange { index: usize, cell: CellPos },
    #[error("entry {index} records {attempts} attempts and {deferrals} deferrals, over the caps")]
    EntryOverCap {
        index: usize,
        attempts: u32,
        deferrals: u32,
    },
    #[error("counters account for {resolved} targets but the cursor is at {cursor}")]
    CounterMismatch { resolved: u64, cursor: usize },
}

/// One cell the job must resolve and the occupant it should end up holding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub cell: CellPos,
    pub occupant: OccupantId,
}

/// Progress bookkeeping for a single target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    pub attempts: u32,
    pub deferrals: u32,
}

/// Monotonic tallies accumulated over the life of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCounters {
    pub placed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub moved: u64,
    pub already_placed: u64,
    pub blocked: u64,
    pub protected_blocked: u64,
    pub no_reach: u64,
    pub ml_rejected: u64,
    /// Sum of classifier scores over every evaluated target.
    pub total_score: f64,
    pub ticks: u64,
}

impl JobCounters {
    /// Targets accounted for so far.
    #[must_use]
    pub const fn resolved(&self) -> u64 {
        self.placed
            .saturating_add(self.skipped)
            .saturating_add(self.failed)
    }
}

/// Terminal outcome for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Placed,
    AlreadyPlaced,
    ProtectedBlocked,
    Blocked,
    NoReach,
    MlRejected,
    Failed,
}

/// Stage of the last step a job went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    None,
    Navigate,
    Validate,
    Place,
    Complete,
}

impl TaskPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Navigate => "navigate",
            Self::Validate => "validate",
            Self::Place => "place",
            Self::Complete => "complete",
        }
    }

    /// Parse a recorded phase; unknown labels read as [`TaskPhase::None`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "navigate" => Self::Navigate,
            "validate" => Self::Validate,
            "place" => Self::Place,
            "complete" => Self::Complete,
            _ => Self::None,
        }
    }
}

/// Submission payload handed to the runner by a front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub agent: AgentId,
    pub region: RegionId,
    /// Provenance label echoed in reports.
    pub tag: String,
    /// Target cells with raw occupant ids, validated on submission.
    pub targets: Vec<(CellPos, String)>,
}

impl JobRequest {
    #[must_use]
    pub fn new(agent: AgentId, region: RegionId, tag: impl Into<String>) -> Self {
        Self {
            agent,
            region,
            tag: tag.into(),
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_target(mut self, cell: CellPos, occupant: impl Into<String>) -> Self {
        self.targets.push((cell, occupant.into()));
        self
    }

    /// Validate every target, rejecting the request on the first bad one.
    pub fn parse_targets(&self) -> Result<Vec<Target>, JobError> {
        if self.targets.is_empty() {
            return Err(JobError::EmptyTargets);
        }
        self.targets
            .iter()
            .enumerate()
            .map(|(index, (cell, raw))| {
                check_cell(index, *cell)?;
                OccupantId::parse(raw)
                    .map(|occupant| Target {
                        cell: *cell,
                        occupant,
                    })
                    .map_err(|source| JobError::InvalidOccupant { index, source })
            })
            .collect()
    }
}

fn check_cell(index: usize, cell: CellPos) -> Result<(), JobError> {
    if cell.is_addressable() {
        Ok(())
    } else {
        Err(JobError::CellOutOfRange { index, cell })
    }
}

/// Full value copy of a job used for checkpointing and introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub agent: AgentId,
    pub region: RegionId,
    pub tag: String,
    pub targets: Vec<Target>,
    pub entries: Vec<EntryState>,
    pub cursor: usize,
    pub counters: JobCounters,
    pub settings: SettingsSnapshot,
    pub phase: TaskPhase,
}

/// Resumable build work for one agent. Only the runner mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    agent: AgentId,
    region: RegionId,
    tag: String,
    targets: Vec<Target>,
    entries: Vec<EntryState>,
    cursor: usize,
    counters: JobCounters,
    settings: SettingsSnapshot,
    phase: TaskPhase,
}

impl Job {
    pub fn new(
        agent: AgentId,
        region: RegionId,
        tag: impl Into<String>,
        targets: Vec<Target>,
        settings: SettingsSnapshot,
    ) -> Result<Self, JobError> {
        if targets.is_empty() {
            return Err(JobError::EmptyTargets);
        }
        Ok(Self {
            agent,
            region,
            tag: tag.into(),
            entries: vec![EntryState::default(); targets.len()],
            targets,
            cursor: 0,
            counters: JobCounters::default(),
            settings,
            phase: TaskPhase::None,
        })
    }

    /// Rebuild a job exactly as it was when `snapshot` was taken.
    pub fn from_snapshot(snapshot: JobSnapshot) -> Result<Self, JobError> {
        let JobSnapshot {
            agent,
            region,
            tag,
            targets,
            entries,
            cursor,
            counters,
            settings,
            phase,
        } = snapshot;
        if targets.is_empty() {
            return Err(JobError::EmptyTargets);
        }
        if entries.len() != targets.len() {
            return Err(JobError::EntryMismatch {
                entries: entries.len(),
                targets: targets.len(),
            });
        }
        if cursor > targets.len() {
            return Err(JobError::CursorOutOfRange {
                cursor,
                len: targets.len(),
            });
        }
        for (index, target) in targets.iter().enumerate() {
            check_cell(index, target.cell)?;
        }
        if let Some((index, entry)) = entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.attempts > RETRY_CAP || entry.deferrals > DEFERRAL_CAP)
        {
            return Err(JobError::EntryOverCap {
                index,
                attempts: entry.attempts,
                deferrals: entry.deferrals,
            });
        }
        if counters.resolved() != cursor as u64 {
            return Err(JobError::CounterMismatch {
                resolved: counters.resolved(),
                cursor,
            });
        }
        Ok(Self {
            agent,
            region,
            tag,
            targets,
            entries,
            cursor,
            counters,
            settings,
            phase,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            agent: self.agent,
            region: self.region.clone(),
            tag: self.tag.clone(),
            targets: self.targets.clone(),
            entries: self.entries.clone(),
            cursor: self.cursor,
            counters: self.counters,
            settings: self.settings,
            phase: self.phase,
        }
    }

    #[must_use]
    pub const fn agent(&self) -> AgentId {
        self.agent
    }

    #[must_use]
    pub const fn region(&self) -> &RegionId {
        &self.region
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    #[must_use]
    pub fn total_targets(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.targets.len()
    }

    #[must_use]
    pub fn current_target(&self) -> Option<&Target> {
        self.targets.get(self.cursor)
    }

    /// Progress state of the target under the cursor.
    #[must_use]
    pub fn current_entry(&self) -> Option<EntryState> {
        self.entries.get(self.cursor).copied()
    }

    #[must_use]
    pub const fn counters(&self) -> &JobCounters {
        &self.counters
    }

    #[must_use]
    pub const fn settings(&self) -> &SettingsSnapshot {
        &self.settings
    }

    #[must_use]
    pub const fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: TaskPhase) {
        self.phase = phase;
    }

    pub(crate) fn record_tick(&mut self) {
        self.counters.ticks += 1;
    }

    pub(crate) fn record_moved(&mut self) {
        self.counters.moved += 1;
    }

    pub(crate) fn record_score(&mut self, score: f64) {
        self.counters.total_score += score;
    }

    /// Count a failed attempt on the current target; returns the new total.
    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.entries.get_mut(self.cursor).map_or(0, |entry| {
            entry.attempts = (entry.attempts + 1).min(RETRY_CAP);
            entry.attempts
        })
    }

    /// Count a moved-but-out-of-range tick; returns the new total.
    pub(crate) fn record_deferral(&mut self) -> u32 {
        self.entries.get_mut(self.cursor).map_or(0, |entry| {
            entry.deferrals = (entry.deferrals + 1).min(DEFERRAL_CAP);
            entry.deferrals
        })
    }

    /// Account for the current target and move the cursor past it.
    pub(crate) fn resolve(&mut self, resolution: Resolution) {
        if self.is_complete() {
            return;
        }
        let counters = &mut self.counters;
        match resolution {
            Resolution::Placed => counters.placed += 1,
            Resolution::Failed => counters.failed += 1,
            Resolution::AlreadyPlaced => {
                counters.already_placed += 1;
                counters.skipped += 1;
            }
            Resolution::ProtectedBlocked => {
                counters.protected_blocked += 1;
                counters.skipped += 1;
            }
            Resolution::Blocked => {
                counters.blocked += 1;
                counters.skipped += 1;
            }
            Resolution::NoReach => {
                counters.no_reach += 1;
                counters.skipped += 1;
            }
            Resolution::MlRejected => {
                counters.ml_rejected += 1;
                counters.skipped += 1;
            }
        }
        self.cursor += 1;
        if self.is_complete() {
            self.phase = TaskPhase::Complete;
        }
    }

    fn summary(&self, label: &str) -> String {
        let c = &self.counters;
        let mut line = format!(
            "[{}] {label} {}/{}: placed={} skipped={} failed={} moved={}",
            self.tag,
            self.cursor,
            self.targets.len(),
            c.placed,
            c.skipped,
            c.failed,
            c.moved,
        );
        let _ = write!(
            line,
            " already={} blocked={} protected={} no_reach={} ml_rejected={} score={:.2} ticks={}",
            c.already_placed,
            c.blocked,
            c.protected_blocked,
            c.no_reach,
            c.ml_rejected,
            c.total_score,
            c.ticks,
        );
        line
    }

    /// Periodic report line carrying every counter and the tag.
    #[must_use]
    pub fn progress_line(&self) -> String {
        self.summary("progress")
    }

    /// Final report line emitted when the job leaves the runner.
    #[must_use]
    pub fn completion_line(&self) -> String {
        self.summary("complete")
    }
}
