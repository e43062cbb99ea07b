//! Scheduler module - tasks, the task manager and process wiring.

mod manager;
mod task;

pub use manager::*;
pub use task::{Task, TaskParams, TaskRunner};

use crate::checkpoint::CheckpointStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concurrency ceiling: twice the available parallelism.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

/// Register `tasks`, start the checkpoint flush loop and tick until cancelled.
///
/// Nothing is flushed on the way out; a restart resumes from the last
/// periodic flush.
pub async fn start_tasks(
    cancel: CancellationToken,
    tasks: Vec<Task>,
    runner: Arc<dyn TaskRunner>,
    store: Arc<CheckpointStore>,
    flush_interval: Duration,
) {
    let flusher = tokio::spawn(Arc::clone(&store).run_periodic_flush(flush_interval, cancel.clone()));

    let manager = TaskManager::new(runner);
    for task in tasks {
        manager.add_task(task);
    }
    info!(
        tasks = manager.len(),
        checkpoint = %store.path().display(),
        "Scheduler running"
    );

    manager.run(cancel).await;

    for status in manager.status() {
        debug!(
            task = %status.id,
            running = status.running,
            next_run = %status.next_run,
            "Task state at shutdown"
        );
    }

    if let Err(e) = flusher.await {
        warn!(error = %e, "Checkpoint flush loop panicked");
    }
}
