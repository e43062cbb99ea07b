//! Schedulable audit tasks.

use crate::models::{AuditJob, Result, Target};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Everything a task needs to run its pipeline.
#[derive(Debug, Clone)]
pub struct TaskParams {
    /// Audit job this task executes
    pub job: AuditJob,
    /// Targets named by the job's output
    pub targets: Vec<Target>,
    /// Decoded access token
    pub token: String,
}

/// Runtime counterpart of one audit job.
///
/// The running flag has exactly one writer per transition: the manager sets
/// it when dispatching, the dispatched execution clears it when done.
#[derive(Debug)]
pub struct Task {
    id: String,
    cadence: Duration,
    running: AtomicBool,
    params: TaskParams,
}

impl Task {
    pub fn new(params: TaskParams, cadence: Duration) -> Self {
        Self {
            id: params.job.task_id(),
            cadence,
            running: AtomicBool::new(false),
            params,
        }
    }

    /// `{jobName}${owner}${repo}`
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    pub fn job(&self) -> &AuditJob {
        &self.params.job
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark running; false if an execution is already in flight.
    pub(crate) fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Clears a task's running flag when dropped, including on panic.
pub(crate) struct RunningGuard(pub(crate) Arc<Task>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Executes one pass of a task's pipeline.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// `floor` is the task's previous run time, the marker floor for a first run.
    async fn run(&self, task: Arc<Task>, floor: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
pub(crate) fn test_task(name: &str, cadence: Duration) -> Task {
    let job = AuditJob {
        name: name.to_string(),
        repo_owner: "acme".to_string(),
        repo_name: "repo".to_string(),
        ..Default::default()
    };
    Task::new(
        TaskParams {
            job,
            targets: Vec::new(),
            token: String::new(),
        },
        cadence,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id() {
        let task = test_task("job1", Duration::from_secs(30));
        assert_eq!(task.id(), "job1$acme$repo");
    }

    #[test]
    fn test_running_flag_single_transition() {
        let task = test_task("job1", Duration::from_secs(30));
        assert!(task.try_start());
        assert!(!task.try_start());
        task.finish();
        assert!(task.try_start());
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let task = Arc::new(test_task("job1", Duration::from_secs(30)));
        assert!(task.try_start());
        drop(RunningGuard(Arc::clone(&task)));
        assert!(!task.is_running());
    }
}
