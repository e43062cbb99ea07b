//! Task manager: periodic readiness scan and bounded dispatch.
//!
//! Every tick the manager scans its registry under a single lock, picks the
//! tasks whose next run is due and that are not already running, and hands
//! them to the runner. Concurrency is capped by a semaphore; when all slots
//! are taken, dispatch (and therefore the tick loop) waits.

use super::task::{RunningGuard, Task, TaskRunner};
use super::default_parallelism;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between readiness scans.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

struct Entry {
    task: Arc<Task>,
    previous_run: DateTime<Utc>,
    next_run: DateTime<Utc>,
}

/// A task picked for execution.
pub struct Dispatch {
    pub task: Arc<Task>,
    /// Previous run time before this dispatch; the marker floor.
    pub floor: DateTime<Utc>,
}

/// Point-in-time view of one registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub running: bool,
    pub cadence_secs: u64,
    pub previous_run: DateTime<Utc>,
    pub next_run: DateTime<Utc>,
}

/// Owns the task registry and dispatches due tasks.
pub struct TaskManager {
    entries: Mutex<Vec<Entry>>,
    runner: Arc<dyn TaskRunner>,
    slots: Arc<Semaphore>,
    ceiling: usize,
    tick: Duration,
}

impl TaskManager {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self::with_ceiling(runner, default_parallelism())
    }

    /// Manager allowing at most `ceiling` concurrent executions.
    pub fn with_ceiling(runner: Arc<dyn TaskRunner>, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            entries: Mutex::new(Vec::new()),
            runner,
            slots: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task due immediately.
    pub fn add_task(&self, task: Task) {
        self.add_task_at(task, Utc::now());
    }

    /// Register a task created at `now`: due at `now`, previous run one cadence earlier.
    pub fn add_task_at(&self, task: Task, now: DateTime<Utc>) {
        let cadence = chrono::Duration::from_std(task.cadence()).unwrap_or(chrono::Duration::MAX);
        let previous_run = now.checked_sub_signed(cadence).unwrap_or(DateTime::<Utc>::MIN_UTC);
        debug!(task = task.id(), cadence_secs = task.cadence().as_secs(), "Task registered");
        self.entries().push(Entry {
            task: Arc::new(task),
            previous_run,
            next_run: now,
        });
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Select due tasks and mark them running.
    ///
    /// A task is due iff `now >= next_run` and it is not running. Each
    /// selected task gets `next_run = now + cadence` and `previous_run = now`.
    pub fn collect_ready(&self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut entries = self.entries();
        let mut ready = Vec::new();
        for entry in entries.iter_mut() {
            if now < entry.next_run || !entry.task.try_start() {
                continue;
            }
            let cadence =
                chrono::Duration::from_std(entry.task.cadence()).unwrap_or(chrono::Duration::MAX);
            let floor = entry.previous_run;
            entry.next_run = now.checked_add_signed(cadence).unwrap_or(DateTime::<Utc>::MAX_UTC);
            entry.previous_run = now;
            ready.push(Dispatch {
                task: Arc::clone(&entry.task),
                floor,
            });
        }
        ready
    }

    /// Dispatch every due task, waiting for a free slot before each.
    ///
    /// Returns the number of tasks started.
    pub async fn run_ready_tasks(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> usize {
        let mut ready = self.collect_ready(now).into_iter();
        let mut started = 0;

        while let Some(dispatch) = ready.next() {
            let guard = RunningGuard(Arc::clone(&dispatch.task));
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                // Clear the flags of everything we selected but did not start.
                drop(guard);
                ready.for_each(|d| d.task.finish());
                break;
            };

            let runner = Arc::clone(&self.runner);
            let task = dispatch.task;
            let floor = dispatch.floor;
            tokio::spawn(async move {
                let _guard = guard;
                let _permit = permit;
                let id = task.id().to_string();
                info!(task = %id, floor = %floor, "Task started");
                match runner.run(task, floor).await {
                    Ok(()) => info!(task = %id, "Task finished"),
                    Err(e) => error!(task = %id, error = %e, "Task failed"),
                }
            });
            started += 1;
        }
        started
    }

    /// Tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            tasks = self.len(),
            ceiling = self.ceiling,
            tick_ms = self.tick.as_millis() as u64,
            "Task manager started"
        );
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Task manager stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let started = self.run_ready_tasks(Utc::now(), &cancel).await;
                    if started > 0 {
                        debug!(
                            started = started,
                            in_flight = self.in_flight(),
                            "Dispatched ready tasks"
                        );
                    }
                }
            }
        }
    }

    /// Snapshot of every registered task.
    pub fn status(&self) -> Vec<TaskStatus> {
        self.entries()
            .iter()
            .map(|e| TaskStatus {
                id: e.task.id().to_string(),
                running: e.task.is_running(),
                cadence_secs: e.task.cadence().as_secs(),
                previous_run: e.previous_run,
                next_run: e.next_run,
            })
            .collect()
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        let available = self.slots.available_permits();
        if available > self.ceiling {
            warn!(available = available, "More free slots than the ceiling");
        }
        self.ceiling.saturating_sub(available)
    }
}
