//! Runtime settings and the immutable per-job snapshot.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::properties::{Properties, PropertyError, parse_property, require};

/// Smallest accepted reach distance.
pub const MIN_REACH: f64 = 2.0;
/// Largest accepted reach distance.
pub const MAX_REACH: f64 = 8.0;
/// Reach distance used when none is configured.
pub const DEFAULT_REACH: f64 = 4.5;

/// How the navigator relocates an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    Teleport,
    Walk,
    #[default]
    Auto,
}

impl MoveMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Teleport => "teleport",
            Self::Walk => "walk",
            Self::Auto => "auto",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "teleport" | "tp" => Some(Self::Teleport),
            "walk" => Some(Self::Walk),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Errors raised when validating settings.
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("reach_distance {0} must be finite and within [2.0, 8.0]")]
    ReachOutOfRange(f64),
}

/// Process-wide tunables read by the scheduler at job submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Whether the navigator may move agents toward out-of-reach targets.
    pub smart_move: bool,
    /// Maximum agent-to-target distance for a placement.
    pub reach_distance: f64,
    pub move_mode: MoveMode,
    /// Only place into empty cells, never over replaceable occupants.
    pub strict_air_only: bool,
    /// Stage new jobs as pending previews that need confirmation.
    pub preview_before_build: bool,
    /// Let already-placed targets resolve without spending the job's tick.
    pub scheduler_lookahead: bool,
    /// Restore the last checkpoint when the host starts.
    pub auto_resume: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            smart_move: true,
            reach_distance: DEFAULT_REACH,
            move_mode: MoveMode::Auto,
            strict_air_only: false,
            preview_before_build: false,
            scheduler_lookahead: false,
            auto_resume: true,
        }
    }
}

impl RuntimeSettings {
    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.reach_distance.is_finite()
            || !(MIN_REACH..=MAX_REACH).contains(&self.reach_distance)
        {
            return Err(SettingsError::ReachOutOfRange(self.reach_distance));
        }
        Ok(())
    }

    /// Set the reach distance, clamped into the accepted range.
    pub fn set_reach_distance(&mut self, reach: f64) -> f64 {
        self.reach_distance = sanitize_reach(reach);
        self.reach_distance
    }

    /// Immutable copy bound to a job at creation.
    #[must_use]
    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            smart_move: self.smart_move,
            reach_distance: sanitize_reach(self.reach_distance),
            move_mode: self.move_mode,
            strict_air_only: self.strict_air_only,
            preview_before_build: self.preview_before_build,
            scheduler_lookahead: self.scheduler_lookahead,
            auto_resume: self.auto_resume,
        }
    }
}

/// Clamp into the accepted range; non-finite values fall back to the default.
fn sanitize_reach(reach: f64) -> f64 {
    if reach.is_finite() {
        reach.clamp(MIN_REACH, MAX_REACH)
    } else {
        DEFAULT_REACH
    }
}

/// Frozen settings value carried by each job and written into checkpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SettingsSnapshot {
    smart_move: bool,
    reach_distance: f64,
    move_mode: MoveMode,
    strict_air_only: bool,
    preview_before_build: bool,
    scheduler_lookahead: bool,
    auto_resume: bool,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        RuntimeSettings::default().snapshot()
    }
}

impl From<SettingsSnapshot> for RuntimeSettings {
    fn from(snapshot: SettingsSnapshot) -> Self {
        Self {
            smart_move: snapshot.smart_move,
            reach_distance: snapshot.reach_distance,
            move_mode: snapshot.move_mode,
            strict_air_only: snapshot.strict_air_only,
            preview_before_build: snapshot.preview_before_build,
            scheduler_lookahead: snapshot.scheduler_lookahead,
            auto_resume: snapshot.auto_resume,
        }
    }
}

impl SettingsSnapshot {
    #[must_use]
    pub const fn smart_move(&self) -> bool {
        self.smart_move
    }

    #[must_use]
    pub const fn reach_distance(&self) -> f64 {
        self.reach_distance
    }

    #[must_use]
    pub const fn move_mode(&self) -> MoveMode {
        self.move_mode
    }

    #[must_use]
    pub const fn strict_air_only(&self) -> bool {
        self.strict_air_only
    }

    #[must_use]
    pub const fn preview_before_build(&self) -> bool {
        self.preview_before_build
    }

    #[must_use]
    pub const fn scheduler_lookahead(&self) -> bool {
        self.scheduler_lookahead
    }

    #[must_use]
    pub const fn auto_resume(&self) -> bool {
        self.auto_resume
    }

    /// Write every field under `<prefix>.<field>`.
    pub fn write_properties(&self, prefix: &str, props: &mut Properties) {
        let mut put = |field: &str, value: String| {
            props.insert(format!("{prefix}.{field}"), value);
        };
        put("smart_move", self.smart_move.to_string());
        put("reach_distance", self.reach_distance.to_string());
        put("move_mode", self.move_mode.as_str().to_owned());
        put("strict_air_only", self.strict_air_only.to_string());
        put("preview_before_build", self.preview_before_build.to_string());
        put("scheduler_lookahead", self.scheduler_lookahead.to_string());
        put("auto_resume", self.auto_resume.to_string());
    }

    /// Read a snapshot written by [`Self::write_properties`].
    pub fn read_properties(prefix: &str, props: &Properties) -> Result<Self, PropertyError> {
        let key = |field: &str| format!("{prefix}.{field}");
        let mode_key = key("move_mode");
        let mode_raw = require(props, &mode_key)?;
        let move_mode = MoveMode::from_label(mode_raw).ok_or_else(|| PropertyError::Invalid {
            key: mode_key.clone(),
            value: mode_raw.to_owned(),
        })?;
        let reach_key = key("reach_distance");
        let reach_distance: f64 = parse_property(props, &reach_key)?;
        if !reach_distance.is_finite() || !(MIN_REACH..=MAX_REACH).contains(&reach_distance) {
            return Err(PropertyError::Invalid {
                key: reach_key,
                value: reach_distance.to_string(),
            });
        }
        Ok(Self {
            smart_move: parse_property(props, &key("smart_move"))?,
            reach_distance,
            move_mode,
            strict_air_only: parse_property(props, &key("strict_air_only"))?,
            preview_before_build: parse_property(props, &key("preview_before_build"))?,
            scheduler_lookahead: parse_property(props, &key("scheduler_lookahead"))?,
            auto_resume: parse_property(props, &key("auto_resume"))?,
        })
    }
}

/// Shared, lock-guarded settings value handed to the runner and front ends.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl SharedSettings {
    #[must_use]
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings.
    #[must_use]
    pub fn current(&self) -> RuntimeSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> SettingsSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Apply an in-place edit under the write lock.
    pub fn update<R>(&self, edit: impl FnOnce(&mut RuntimeSettings) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        edit(&mut guard)
    }
}
