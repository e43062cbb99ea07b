//! Checkpoint module for resumable incremental sync.
//!
//! Provides:
//! - `CheckpointRecord`: Per-task progress markers
//! - `CheckpointStore`: Lock-guarded record map with periodic atomic snapshots

mod record;
mod store;

pub use record::*;
pub use store::*;
