//! Durable storage for BuildBots: byte stores with atomic replace and the
//! checkpoint codec used for crash recovery.
//!
//! Saving and loading perform blocking I/O and belong on a timer or at
//! shutdown, outside the runner's tick.

pub mod checkpoint;
pub mod file;

pub use checkpoint::{
    CHECKPOINT_RECORD, CHECKPOINT_VERSION, CheckpointError, CheckpointReason, CheckpointStore,
    Restored, decode_checkpoint, encode_checkpoint,
};
pub use file::{FileStore, MemoryStore};
