//! Core types shared across the BuildBots workspace.
//!
//! Everything the scheduler consumes from its host lives here: identifiers,
//! grid geometry, the runtime settings value, and the collaborator traits for
//! the voxel world, the acting agent, reporting, previews, and byte storage.

use serde::{Deserialize, Serialize};
use slotmap::{Key, KeyData, SecondaryMap, new_key_type};
use std::fmt;
use thiserror::Error;

pub mod grid;
pub mod properties;
pub mod settings;

pub use grid::{Sandbox, SimActor, VoxelGrid};
pub use properties::{
    Properties, PropertyError, decode_properties, encode_properties, parse_property, require,
};
pub use settings::{
    DEFAULT_REACH, MAX_REACH, MIN_REACH, MoveMode, RuntimeSettings, SettingsError,
    SettingsSnapshot, SharedSettings,
};

new_key_type! {
    /// Stable handle for build agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Flatten an agent handle into an integer suitable for text records.
#[must_use]
pub fn agent_id_to_u64(id: AgentId) -> u64 {
    id.data().as_ffi()
}

/// Rebuild an agent handle from [`agent_id_to_u64`] output.
#[must_use]
pub fn agent_id_from_u64(raw: u64) -> AgentId {
    KeyData::from_ffi(raw).into()
}

/// High level scheduler clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors raised when validating identifiers handed to the core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier `{id}` is invalid: {reason}")]
    Invalid { id: String, reason: &'static str },
}

/// Name of a world or region a job builds in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(IdError::Empty);
        }
        if name.chars().any(char::is_control) {
            return Err(IdError::Invalid {
                id: name,
                reason: "control characters are not allowed",
            });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Material identifier filling a cell (`namespace:path` or a bare path).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OccupantId(String);

impl OccupantId {
    /// Identifier reported for cells that hold nothing.
    pub const AIR: &'static str = "air";

    /// Validate and wrap an occupant identifier.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        let invalid = |reason| IdError::Invalid {
            id: raw.to_owned(),
            reason,
        };
        if raw.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(invalid("whitespace and control characters are not allowed"));
        }
        if raw.contains('=') {
            return Err(invalid("`=` is not allowed"));
        }
        let mut parts = raw.split(':');
        let first = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (_, Some(_)) => Err(invalid("at most one namespace separator is allowed")),
            (Some(path), None) if first.is_empty() || path.is_empty() => {
                Err(invalid("namespace and path must both be non-empty"))
            }
            _ => Ok(Self(raw.to_owned())),
        }
    }

    /// The empty-cell occupant.
    #[must_use]
    pub fn air() -> Self {
        Self(Self::AIR.to_owned())
    }

    #[must_use]
    pub fn is_air(&self) -> bool {
        self.0 == Self::AIR
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OccupantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Continuous world-space point (y is vertical).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn distance_sq(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_sq(other).sqrt()
    }
}

/// Integer address of one voxel (y is vertical).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Cell containing the given world-space point.
    #[must_use]
    pub fn containing(point: Vec3) -> Self {
        Self::new(
            point.x.floor() as i32,
            point.y.floor() as i32,
            point.z.floor() as i32,
        )
    }

    /// Largest absolute coordinate a job target or agent cell may use.
    pub const MAX_COORD: i32 = 30_000_000;

    /// Whether every coordinate lies within [`CellPos::MAX_COORD`].
    #[must_use]
    pub const fn is_addressable(self) -> bool {
        self.x.unsigned_abs() <= Self::MAX_COORD as u32
            && self.y.unsigned_abs() <= Self::MAX_COORD as u32
            && self.z.unsigned_abs() <= Self::MAX_COORD as u32
    }

    /// Neighbouring cell; saturates at the `i32` limits.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.z.saturating_add(dz),
        )
    }

    #[must_use]
    pub const fn up(self) -> Self {
        self.offset(0, 1, 0)
    }

    #[must_use]
    pub const fn down(self) -> Self {
        self.offset(0, -1, 0)
    }

    /// Geometric center of the cell.
    #[must_use]
    pub fn center(self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) + 0.5,
            f64::from(self.y) + 0.5,
            f64::from(self.z) + 0.5,
        )
    }

    /// Point an agent standing in this cell occupies (bottom face center).
    #[must_use]
    pub fn feet(self) -> Vec3 {
        Vec3::new(f64::from(self.x) + 0.5, f64::from(self.y), f64::from(self.z) + 0.5)
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// Valid vertical range of a world: `min_y` inclusive, `max_y` exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerticalBounds {
    pub min_y: i32,
    pub max_y: i32,
}

impl VerticalBounds {
    #[must_use]
    pub const fn new(min_y: i32, max_y: i32) -> Self {
        Self { min_y, max_y }
    }

    #[must_use]
    pub const fn contains(&self, y: i32) -> bool {
        y >= self.min_y && y < self.max_y
    }
}

impl Default for VerticalBounds {
    fn default() -> Self {
        Self::new(-64, 320)
    }
}

/// Occupancy queries and writes the scheduler performs against a voxel world.
pub trait VoxelWorld {
    /// Current occupant of `pos` ([`OccupantId::air`] when empty).
    fn occupant(&self, pos: CellPos) -> OccupantId;

    fn is_empty(&self, pos: CellPos) -> bool;

    /// Whether the current occupant may be overwritten by a placement.
    fn is_replaceable(&self, pos: CellPos) -> bool;

    /// Whether an agent collides with the cell. Defaults to non-empty.
    fn is_solid(&self, pos: CellPos) -> bool {
        !self.is_empty(pos)
    }

    /// Write `occupant` into `pos`, returning whether the world accepted it.
    fn set_occupant(&mut self, pos: CellPos, occupant: &OccupantId) -> bool;

    fn vertical_bounds(&self) -> VerticalBounds;

    /// Safety policy: protected occupants are never overwritten.
    fn is_protected(&self, occupant: &OccupantId) -> bool;
}

/// The agent a job moves and builds with.
pub trait Actor {
    /// Feet position in world space.
    fn position(&self) -> Vec3;

    /// Ask the host to relocate the agent; returns whether it moved.
    fn request_teleport(&mut self, to: Vec3) -> bool;

    /// Whether the agent is still present/connected.
    fn is_present(&self) -> bool;

    fn squared_distance_to(&self, point: Vec3) -> f64 {
        self.position().distance_sq(point)
    }
}

/// Host lookup of worlds by region.
pub trait WorldDirectory {
    fn world_mut(&mut self, region: &RegionId) -> Option<&mut dyn VoxelWorld>;
}

/// Host lookup of live agents.
pub trait ActorDirectory {
    fn actor_mut(&mut self, agent: AgentId) -> Option<&mut dyn Actor>;
}

/// Receives one line of text per progress or completion event.
pub trait ReportSink {
    fn report(&mut self, agent: AgentId, line: &str);
}

impl ReportSink for Vec<(AgentId, String)> {
    fn report(&mut self, agent: AgentId, line: &str) {
        self.push((agent, line.to_owned()));
    }
}

/// Maximum number of markers handed to a preview renderer per staged job.
pub const PREVIEW_MARKER_LIMIT: usize = 250;

/// External renderer asked to visualise a staged (pending) job.
pub trait PreviewSink: Send + Sync {
    fn preview(&self, agent: AgentId, region: &RegionId, markers: &[CellPos]);
}

/// No-op preview renderer.
#[derive(Debug, Default)]
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn preview(&self, _agent: AgentId, _region: &RegionId, _markers: &[CellPos]) {}
}

/// Errors raised by byte stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record name `{0}`")]
    InvalidName(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Named byte records with atomic-replace writes.
pub trait ByteStore: Send + Sync {
    /// Read a record; `Ok(None)` when it was never written.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace a record so readers never observe a partial write.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}
