//! Build jobs and the scheduler that advances them.
//!
//! A [`Job`] holds one agent's ordered targets, its cursor and counters, and
//! the settings snapshot taken at submission. The [`Runner`] owns the active
//! and pending jobs and, once per host tick, moves each active job one step:
//! navigate, validate, consult the classifier, then write the voxel.

pub mod job;
pub mod runner;

pub use job::{
    DEFERRAL_CAP, EntryState, Job, JobCounters, JobError, JobRequest, JobSnapshot,
    LOOKAHEAD_LIMIT, REPORT_INTERVAL, RETRY_CAP, Resolution, Target, TaskPhase,
};
pub use runner::{JobSet, Runner, RunnerError, Submission, TickReport};
