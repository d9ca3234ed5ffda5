//! Crash-recovery checkpoints of every active and pending job.
//!
//! A checkpoint is one flat property record:
//!
//! ```text
//! version=1
//! reason=interval
//! job.count=2
//! job.0.state=active
//! job.0.agent=4294967297
//! job.0.region=overworld
//! job.0.tag=tower
//! job.0.cursor=3
//! job.0.phase=place
//! job.0.counter.placed=3
//! job.0.settings.reach_distance=4.5
//! job.0.entry.count=10
//! job.0.entry.0.occupant=stone
//! job.0.entry.0.x=1
//! ...
//! ```
//!
//! Jobs that fail to decode are dropped and counted; the rest still load.

use std::collections::BTreeSet;
use std::sync::Arc;

use buildbots_core::{
    AgentId, ByteStore, CellPos, IdError, OccupantId, Properties, PropertyError, RegionId,
    SettingsSnapshot, StoreError, agent_id_from_u64, agent_id_to_u64, decode_properties,
    encode_properties, parse_property, require,
};
use buildbots_jobs::{
    EntryState, Job, JobCounters, JobError, JobSet, JobSnapshot, Target, TaskPhase,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Record name checkpoints are saved under.
pub const CHECKPOINT_RECORD: &str = "checkpoint";
/// Current checkpoint layout version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CheckpointReason {
    #[default]
    None,
    Interval,
    Shutdown,
    Manual,
}

impl CheckpointReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }

    /// Unknown labels read as [`CheckpointReason::None`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "interval" => Self::Interval,
            "shutdown" => Self::Shutdown,
            "manual" => Self::Manual,
            _ => Self::None,
        }
    }
}

/// Errors that prevent a checkpoint from being written or read at all.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkpoint is not valid UTF-8")]
    NotUtf8,
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
    #[error("checkpoint header is malformed: {0}")]
    Header(#[from] PropertyError),
}

/// Why a single job could not be decoded.
#[derive(Debug, Error)]
enum JobDecodeError {
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("unknown job state `{0}`")]
    State(String),
}

/// Outcome of loading a checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restored {
    pub jobs: JobSet,
    /// Jobs present in the record but dropped as malformed.
    pub dropped: usize,
    pub reason: CheckpointReason,
}

/// Flatten every job into a checkpoint record.
#[must_use]
pub fn encode_checkpoint(jobs: &JobSet, reason: CheckpointReason) -> Properties {
    let mut props = Properties::new();
    props.insert("version".into(), CHECKPOINT_VERSION.to_string());
    props.insert("reason".into(), reason.as_str().into());
    props.insert("job.count".into(), jobs.len().to_string());
    let states = jobs
        .active
        .iter()
        .map(|job| ("active", job))
        .chain(jobs.pending.iter().map(|job| ("pending", job)));
    for (index, (state, job)) in states.enumerate() {
        write_job(&mut props, &format!("job.{index}"), state, job);
    }
    props
}

fn write_job(props: &mut Properties, prefix: &str, state: &str, job: &JobSnapshot) {
    let mut put = |key: &str, value: String| {
        props.insert(format!("{prefix}.{key}"), value);
    };
    put("state", state.to_owned());
    put("agent", agent_id_to_u64(job.agent).to_string());
    put("region", job.region.to_string());
    put("tag", job.tag.clone());
    put("cursor", job.cursor.to_string());
    put("phase", job.phase.as_str().to_owned());

    let c = &job.counters;
    for (name, value) in [
        ("placed", c.placed),
        ("skipped", c.skipped),
        ("failed", c.failed),
        ("moved", c.moved),
        ("already_placed", c.already_placed),
        ("blocked", c.blocked),
        ("protected_blocked", c.protected_blocked),
        ("no_reach", c.no_reach),
        ("ml_rejected", c.ml_rejected),
        ("ticks", c.ticks),
    ] {
        put(&format!("counter.{name}"), value.to_string());
    }
    put("counter.total_score", c.total_score.to_string());

    put("entry.count", job.targets.len().to_string());
    for (index, (target, entry)) in job.targets.iter().zip(&job.entries).enumerate() {
        let entry_key = |field: &str| format!("entry.{index}.{field}");
        put(&entry_key("occupant"), target.occupant.to_string());
        put(&entry_key("x"), target.cell.x.to_string());
        put(&entry_key("y"), target.cell.y.to_string());
        put(&entry_key("z"), target.cell.z.to_string());
        put(&entry_key("attempts"), entry.attempts.to_string());
        put(&entry_key("deferrals"), entry.deferrals.to_string());
    }
    job.settings
        .write_properties(&format!("{prefix}.settings"), props);
}

/// Rebuild jobs from a checkpoint record, dropping any malformed job.
pub fn decode_checkpoint(props: &Properties) -> Result<Restored, CheckpointError> {
    let version: u32 = parse_property(props, "version")?;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(version));
    }
    let reason = props
        .get("reason")
        .map_or(CheckpointReason::None, |label| {
            CheckpointReason::from_label(label)
        });
    let declared: usize = parse_property(props, "job.count")?;
    let indices = job_indices(props);
    if indices.len() != declared {
        warn!(declared, present = indices.len(), "checkpoint job count disagrees with its records");
    }

    let mut restored = Restored {
        reason,
        ..Restored::default()
    };
    for index in indices {
        let prefix = format!("job.{index}");
        match read_job(props, &prefix) {
            Ok((pending, snapshot)) if pending => restored.jobs.pending.push(snapshot),
            Ok((_, snapshot)) => restored.jobs.active.push(snapshot),
            Err(err) => {
                warn!(job = %prefix, %err, "dropping malformed checkpoint job");
                restored.dropped += 1;
            }
        }
    }
    Ok(restored)
}

/// Indices of every `job.<N>.*` group present in the record.
fn job_indices(props: &Properties) -> BTreeSet<usize> {
    props
        .keys()
        .filter_map(|key| {
            let (index, _) = key.strip_prefix("job.")?.split_once('.')?;
            index.parse().ok()
        })
        .collect()
}

/// Returns whether the job was pending, and its validated snapshot.
fn read_job(props: &Properties, prefix: &str) -> Result<(bool, JobSnapshot), JobDecodeError> {
    let key = |field: &str| format!("{prefix}.{field}");
    let pending = match require(props, &key("state"))? {
        "active" => false,
        "pending" => true,
        other => return Err(JobDecodeError::State(other.to_owned())),
    };
    let agent: AgentId = agent_id_from_u64(parse_property(props, &key("agent"))?);
    let region = RegionId::new(require(props, &key("region"))?)?;
    let tag = require(props, &key("tag"))?.to_owned();
    let cursor: usize = parse_property(props, &key("cursor"))?;
    let phase = props
        .get(&key("phase"))
        .map_or(TaskPhase::None, |label| TaskPhase::from_label(label));

    let counter = |name: &str| parse_property::<u64>(props, &key(&format!("counter.{name}")));
    let counters = JobCounters {
        placed: counter("placed")?,
        skipped: counter("skipped")?,
        failed: counter("failed")?,
        moved: counter("moved")?,
        already_placed: counter("already_placed")?,
        blocked: counter("blocked")?,
        protected_blocked: counter("protected_blocked")?,
        no_reach: counter("no_reach")?,
        ml_rejected: counter("ml_rejected")?,
        total_score: parse_property(props, &key("counter.total_score"))?,
        ticks: counter("ticks")?,
    };
    let settings = SettingsSnapshot::read_properties(&key("settings"), props)?;

    let entry_count: usize = parse_property(props, &key("entry.count"))?;
    let mut targets = Vec::with_capacity(entry_count.min(4096));
    let mut entries = Vec::with_capacity(entry_count.min(4096));
    for index in 0..entry_count {
        let entry_key = |field: &str| key(&format!("entry.{index}.{field}"));
        let occupant = OccupantId::parse(require(props, &entry_key("occupant"))?)?;
        let cell = CellPos::new(
            parse_property(props, &entry_key("x"))?,
            parse_property(props, &entry_key("y"))?,
            parse_property(props, &entry_key("z"))?,
        );
        targets.push(Target { cell, occupant });
        entries.push(EntryState {
            attempts: parse_property(props, &entry_key("attempts"))?,
            deferrals: parse_property(props, &entry_key("deferrals"))?,
        });
    }

    let snapshot = JobSnapshot {
        agent,
        region,
        tag,
        targets,
        entries,
        cursor,
        counters,
        settings,
        phase,
    };
    // Round through `Job` so restored snapshots obey the same invariants.
    let job = Job::from_snapshot(snapshot)?;
    Ok((pending, job.snapshot()))
}

/// Saves and loads checkpoints through a byte store.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ByteStore>,
    record: String,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    #[must_use]
    pub fn new(store: Arc<dyn ByteStore>) -> Self {
        Self {
            store,
            record: CHECKPOINT_RECORD.to_owned(),
        }
    }

    /// Use a record name other than [`CHECKPOINT_RECORD`].
    #[must_use]
    pub fn with_record(mut self, record: impl Into<String>) -> Self {
        self.record = record.into();
        self
    }

    /// Write every job; returns how many were saved.
    pub fn save(&self, jobs: &JobSet, reason: CheckpointReason) -> Result<usize, CheckpointError> {
        let text = encode_properties(&encode_checkpoint(jobs, reason));
        self.store.write_atomic(&self.record, text.as_bytes())?;
        info!(
            active = jobs.active.len(),
            pending = jobs.pending.len(),
            reason = reason.as_str(),
            "checkpoint saved"
        );
        Ok(jobs.len())
    }

    /// Load the last checkpoint; `Ok(None)` when none was ever written.
    pub fn load(&self) -> Result<Option<Restored>, CheckpointError> {
        let Some(bytes) = self.store.read(&self.record)? else {
            debug!(record = %self.record, "no checkpoint to restore");
            return Ok(None);
        };
        let text = String::from_utf8(bytes).map_err(|_| CheckpointError::NotUtf8)?;
        let restored = decode_checkpoint(&decode_properties(&text))?;
        info!(
            active = restored.jobs.active.len(),
            pending = restored.jobs.pending.len(),
            dropped = restored.dropped,
            reason = restored.reason.as_str(),
            "checkpoint loaded"
        );
        Ok(Some(restored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_reasons_read_as_none() {
        assert_eq!(CheckpointReason::from_label("shutdown"), CheckpointReason::Shutdown);
        assert_eq!(CheckpointReason::from_label("crash"), CheckpointReason::None);
    }

    #[test]
    fn header_problems_are_fatal() {
        let mut props = encode_checkpoint(&JobSet::default(), CheckpointReason::Manual);
        assert_eq!(
            decode_checkpoint(&props).expect("decode").reason,
            CheckpointReason::Manual
        );
        props.insert("version".into(), "2".into());
        assert!(matches!(
            decode_checkpoint(&props),
            Err(CheckpointError::UnsupportedVersion(2))
        ));
        props.remove("version");
        assert!(matches!(
            decode_checkpoint(&props),
            Err(CheckpointError::Header(PropertyError::Missing(_)))
        ));
    }

    #[test]
    fn declared_count_does_not_invent_jobs() {
        let mut props = encode_checkpoint(&JobSet::default(), CheckpointReason::Interval);
        props.insert("job.count".into(), "2".into());
        let restored = decode_checkpoint(&props).expect("decode");
        assert_eq!(restored.dropped, 0);
        assert!(restored.jobs.is_empty());

        props.insert("job.count".into(), "50000000000".into());
        props.insert("job.3.state".into(), "active".into());
        let restored = decode_checkpoint(&props).expect("decode");
        assert_eq!(restored.dropped, 1);
        assert!(restored.jobs.is_empty());
    }

    #[test]
    fn job_indices_come_from_present_keys() {
        let mut props = Properties::new();
        for key in ["job.count", "job.0.state", "job.0.entry.1.x", "job.7.tag", "job.x.state"] {
            props.insert(key.into(), String::new());
        }
        assert_eq!(job_indices(&props).into_iter().collect::<Vec<_>>(), vec![0, 7]);
    }
}
