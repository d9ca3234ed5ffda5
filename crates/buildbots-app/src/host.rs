//! Tick loop that owns the demo world and feeds the runner.

use std::sync::Arc;

use buildbots_core::{AgentId, CellPos, PreviewSink, RegionId, Sandbox, Tick};
use buildbots_jobs::{Runner, TickReport};
use buildbots_storage::{CheckpointError, CheckpointReason, CheckpointStore};
use tracing::{info, warn};

use crate::command::{CommandReceiver, drain_pending_commands};

/// Preview renderer that only logs what it would draw.
#[derive(Debug, Default)]
pub struct LogPreview;

impl PreviewSink for LogPreview {
    fn preview(&self, agent: AgentId, region: &RegionId, markers: &[CellPos]) {
        info!(?agent, %region, markers = markers.len(), first = ?markers.first(), "preview staged");
    }
}

/// Totals accumulated over [`Host::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub placed: usize,
    pub completed: usize,
    pub dropped: usize,
    pub checkpoints: usize,
}

impl RunSummary {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.placed += report.placed;
        self.completed += report.completed;
        self.dropped += report.dropped;
    }
}

/// Owns the world, drains commands, ticks the runner, and checkpoints.
pub struct Host {
    runner: Arc<Runner>,
    sandbox: Sandbox,
    commands: CommandReceiver,
    checkpoints: Option<CheckpointStore>,
    checkpoint_interval: u64,
    clock: Tick,
    reports: Vec<(AgentId, String)>,
}

impl Host {
    #[must_use]
    pub fn new(runner: Arc<Runner>, sandbox: Sandbox, commands: CommandReceiver) -> Self {
        Self {
            runner,
            sandbox,
            commands,
            checkpoints: None,
            checkpoint_interval: 0,
            clock: Tick::zero(),
            reports: Vec::new(),
        }
    }

    /// Save a checkpoint every `interval` ticks (0 disables the timer).
    #[must_use]
    pub fn with_checkpoints(mut self, store: CheckpointStore, interval: u64) -> Self {
        self.checkpoints = Some(store);
        self.checkpoint_interval = interval;
        self
    }

    #[must_use]
    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    #[must_use]
    pub const fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    #[must_use]
    pub const fn clock(&self) -> Tick {
        self.clock
    }

    /// Take the report lines produced since the last call.
    pub fn take_reports(&mut self) -> Vec<(AgentId, String)> {
        std::mem::take(&mut self.reports)
    }

    /// Restore jobs from the last checkpoint; returns how many were restored.
    pub fn resume(&self) -> Result<usize, CheckpointError> {
        let Some(store) = &self.checkpoints else {
            return Ok(0);
        };
        let Some(restored) = store.load()? else {
            return Ok(0);
        };
        if restored.dropped > 0 {
            warn!(dropped = restored.dropped, "checkpoint held malformed jobs");
        }
        let count = self.runner.restore(restored.jobs);
        info!(count, reason = restored.reason.as_str(), "resumed from checkpoint");
        Ok(count)
    }

    /// Save every job now. Failures are logged and reported as `false`; the
    /// in-memory jobs stay authoritative.
    pub fn checkpoint(&self, reason: CheckpointReason) -> bool {
        let Some(store) = &self.checkpoints else {
            return false;
        };
        match store.save(&self.runner.export_jobs(), reason) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, reason = reason.as_str(), "checkpoint failed");
                false
            }
        }
    }

    /// One host tick: apply queued commands, step the runner, maybe checkpoint.
    pub fn step(&mut self) -> (TickReport, bool) {
        drain_pending_commands(&self.commands, &self.runner);
        let report = self.runner.tick(
            &mut self.sandbox.worlds,
            &mut self.sandbox.actors,
            &mut self.reports,
        );
        self.clock = self.clock.next();
        let due = self.checkpoint_interval > 0 && self.clock.0 % self.checkpoint_interval == 0;
        let saved = due && self.checkpoint(CheckpointReason::Interval);
        (report, saved)
    }

    /// Run `ticks` ticks, stopping early once no jobs remain, then write a
    /// shutdown checkpoint.
    pub fn run(&mut self, ticks: u64) -> RunSummary {
        let mut summary = RunSummary::default();
        for _ in 0..ticks {
            let (report, saved) = self.step();
            summary.absorb(&report);
            summary.checkpoints += usize::from(saved);
            for (agent, line) in self.take_reports() {
                info!(?agent, "{line}");
            }
            if self.runner.active_count() == 0 && self.runner.pending_count() == 0 {
                break;
            }
        }
        summary.checkpoints += usize::from(self.checkpoint(CheckpointReason::Shutdown));
        summary
    }
}
