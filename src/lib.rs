//! github-audit - Incremental audit of GitHub activity relayed to observability sinks.
//!
//! ## Architecture
//!
//! - **Task Manager**: ticks every second, dispatches due tasks under a global
//!   concurrency ceiling, never runs the same task twice at once
//! - **Sync Pipeline**: one incremental pass per task; fetches commits (per
//!   branch), pull requests and issues since the stored markers, transforms
//!   them and publishes to every configured target
//! - **Checkpoint Store**: lock-guarded per-task markers, snapshotted to disk
//!   on its own timer
//!
//! ## Delivery
//!
//! Delivery is at-least-once relative to the last checkpoint snapshot on
//! disk. A crash (or a clean shutdown, which does not flush) between a marker
//! advance and the next snapshot re-delivers those documents on restart;
//! sinks must tolerate duplicates.

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod publisher;
pub mod scheduler;

// Re-exports for convenience
pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use client::{GithubProvider, RateLimiter, SourceConnector, SourceProvider};
pub use models::{AuditError, AuditJob, Config, ConfigError, Result, Target};
pub use pipeline::{SyncPipeline, SyncReport, build_tasks};
pub use processor::DocumentFormatter;
pub use publisher::{HttpPublisherFactory, Publisher, PublisherFactory};
pub use scheduler::{Task, TaskManager, TaskRunner, start_tasks};
