//! Incremental synchronization pass for one task.
//!
//! Pipeline flow:
//! Checkpoint → Source Connector → Processor → Publisher (per target) → Checkpoint
//!
//! Every target reads the markers captured when the pass starts, so each one
//! gets the same window. Marker writes are monotonic max-merges applied under
//! the store lock, so concurrent branch and target completions cannot regress
//! each other. Delivery is at-least-once relative to the last flushed checkpoint.

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::client::{SourceConnector, SourceProvider};
use crate::models::{Result, Target};
use crate::processor::{Batch, DocumentFormatter, GithubProcessor, Marker};
use crate::publisher::{Publisher, PublisherFactory};
use crate::scheduler::{Task, TaskRunner, default_parallelism};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one publishable unit (a branch's commits, PRs or issues).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Documents delivered and marker advanced
    Published { count: usize },
    /// Nothing new since the marker
    Empty,
    /// Fetch, transform or publish failed; marker untouched
    Failed { error: String },
}

/// One unit within a target.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    /// `commits:{branch}`, `pull_requests` or `issues`
    pub unit: String,
    pub outcome: UnitOutcome,
}

/// Outcomes for one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    /// Set when no publisher could be built for the target
    pub error: Option<String>,
    pub units: Vec<UnitReport>,
}

/// Result of one pass. Logged, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether this pass created the task's checkpoint record
    pub first_run: bool,
    pub targets: Vec<TargetReport>,
}

impl SyncReport {
    /// Documents delivered across all targets.
    pub fn published(&self) -> usize {
        self.units()
            .map(|u| match u.outcome {
                UnitOutcome::Published { count } => count,
                _ => 0,
            })
            .sum()
    }

    /// Failed units plus targets without a publisher.
    pub fn failures(&self) -> usize {
        let units = self
            .units()
            .filter(|u| matches!(u.outcome, UnitOutcome::Failed { .. }))
            .count();
        units + self.targets.iter().filter(|t| t.error.is_some()).count()
    }

    fn units(&self) -> impl Iterator<Item = &UnitReport> {
        self.targets.iter().flat_map(|t| t.units.iter())
    }
}

/// Runs sync passes for scheduled tasks.
pub struct SyncPipeline {
    provider: Arc<dyn SourceProvider>,
    publishers: Arc<dyn PublisherFactory>,
    store: Arc<CheckpointStore>,
    formatter: Arc<DocumentFormatter>,
    parallelism: usize,
}

impl SyncPipeline {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        publishers: Arc<dyn PublisherFactory>,
        store: Arc<CheckpointStore>,
        formatter: Arc<DocumentFormatter>,
    ) -> Self {
        Self {
            provider,
            publishers,
            store,
            formatter,
            parallelism: default_parallelism(),
        }
    }

    /// Bound on concurrent targets per pass and branches per target.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// One incremental pass. `floor` seeds the markers of a first run.
    ///
    /// Only a connector that cannot be created fails the pass; unit and
    /// target failures are recorded in the report.
    pub async fn sync(&self, task: &Task, floor: DateTime<Utc>) -> Result<SyncReport> {
        let started_at = Utc::now();
        let job = task.job();
        let task_id = task.id().to_string();
        let branches = &job.repo_config.branches;

        // The default record goes into the store before any network call.
        let (mut record, first_run) = self
            .store
            .get_or_init(&task_id, || CheckpointRecord::initial(floor, branches));
        if first_run {
            info!(task_id = %task_id, floor = %floor, "No checkpoint, starting from floor");
        } else if record.ensure_branches(branches, floor) {
            debug!(task_id = %task_id, "Added markers for new branches");
            self.store
                .update(&task_id, |r| {
                    r.ensure_branches(branches, floor);
                });
        }

        let connector = self.provider.connect(job, &task.params().token)?;

        let pass = Arc::new(Pass {
            task_id: task_id.clone(),
            start: record,
            floor,
            until: started_at,
            branches: branches.clone(),
            tags: job.tags.clone(),
            connector,
            processor: GithubProcessor::new(
                job.repo_name.clone(),
                job.repo_config.repo_url.clone(),
                Arc::clone(&self.formatter),
            ),
            store: Arc::clone(&self.store),
            parallelism: self.parallelism,
        });

        let slots = Arc::new(Semaphore::new(self.parallelism));
        let mut pending = JoinSet::new();
        for (index, target) in task.params().targets.iter().enumerate() {
            let pass = Arc::clone(&pass);
            let slots = Arc::clone(&slots);
            let target = target.clone();
            let created = self.publishers.create(&target);
            pending.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                (index, pass.sync_target(target, created).await)
            });
        }

        let mut targets = Vec::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(done) => targets.push(done),
                Err(e) => warn!(task_id = %task_id, error = %e, "Target sync panicked"),
            }
        }
        targets.sort_by_key(|(index, _)| *index);
        let targets: Vec<TargetReport> = targets.into_iter().map(|(_, t)| t).collect();

        let finished_at = Utc::now();
        self.store
            .update(&task_id, |r| r.last_run_time = Some(finished_at));

        Ok(SyncReport {
            task_id,
            started_at,
            finished_at,
            first_run,
            targets,
        })
    }
}

#[async_trait]
impl TaskRunner for SyncPipeline {
    async fn run(&self, task: Arc<Task>, floor: DateTime<Utc>) -> Result<()> {
        let report = self.sync(&task, floor).await?;
        let elapsed = report.finished_at - report.started_at;
        info!(
            task_id = %report.task_id,
            targets = report.targets.len(),
            published = report.published(),
            failures = report.failures(),
            elapsed_ms = elapsed.num_milliseconds(),
            "Sync pass complete"
        );
        Ok(())
    }
}

/// Shared state of one pass, handed to every target and branch worker.
struct Pass {
    task_id: String,
    /// Record as it was when the pass started
    start: CheckpointRecord,
    floor: DateTime<Utc>,
    until: DateTime<Utc>,
    branches: Vec<String>,
    tags: HashMap<String, String>,
    connector: Arc<dyn SourceConnector>,
    processor: GithubProcessor,
    store: Arc<CheckpointStore>,
    parallelism: usize,
}

impl Pass {
    async fn sync_target(
        self: Arc<Self>,
        target: Target,
        publisher: Result<Arc<dyn Publisher>>,
    ) -> TargetReport {
        let publisher = match publisher {
            Ok(publisher) => publisher,
            Err(e) => {
                warn!(task_id = %self.task_id, sink = %target.name, error = %e, "Skipping target");
                return TargetReport {
                    target: target.name,
                    error: Some(e.to_string()),
                    units: Vec::new(),
                };
            }
        };

        let mut units = Arc::clone(&self).sync_commits(&publisher).await;
        units.push(self.unit("pull_requests", &target.name, self.sync_pull_requests(&publisher).await));
        units.push(self.unit("issues", &target.name, self.sync_issues(&publisher).await));

        TargetReport {
            target: target.name,
            error: None,
            units,
        }
    }

    /// All branches of one target, bounded by the pass parallelism.
    async fn sync_commits(self: Arc<Self>, publisher: &Arc<dyn Publisher>) -> Vec<UnitReport> {
        let slots = Arc::new(Semaphore::new(self.parallelism));
        let mut pending = JoinSet::new();
        for (index, branch) in self.branches.iter().enumerate() {
            let pass = Arc::clone(&self);
            let slots = Arc::clone(&slots);
            let publisher = Arc::clone(publisher);
            let branch = branch.clone();
            pending.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                let result = pass.sync_branch(&publisher, &branch).await;
                (
                    index,
                    pass.unit(&format!("commits:{branch}"), publisher.target(), result),
                )
            });
        }

        let mut units = Vec::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(unit) => units.push(unit),
                Err(e) => warn!(task_id = %self.task_id, error = %e, "Branch sync panicked"),
            }
        }
        units.sort_by_key(|(index, _)| *index);
        units.into_iter().map(|(_, u)| u).collect()
    }

    async fn sync_branch(&self, publisher: &Arc<dyn Publisher>, branch: &str) -> Result<usize> {
        let since = self.start.commit_marker(branch).unwrap_or(self.floor);
        let raw = self.connector.get_commits(since, self.until, branch).await?;
        let batch = self
            .processor
            .process_commits(&raw, &self.tags)?
            .retain_after(since);

        let Some(newest) = deliver(publisher.as_ref(), &batch).await? else {
            return Ok(0);
        };
        self.store
            .update(&self.task_id, |r| r.advance_commit(branch, newest));
        Ok(batch.len())
    }

    async fn sync_pull_requests(&self, publisher: &Arc<dyn Publisher>) -> Result<usize> {
        let after = self.start.last_pr_number;
        let raw = self.connector.get_pull_requests(after).await?;
        let batch = self
            .processor
            .process_pull_requests(&raw, &self.tags)?
            .retain_after(after);

        let Some(newest) = deliver(publisher.as_ref(), &batch).await? else {
            return Ok(0);
        };
        self.store
            .update(&self.task_id, |r| r.advance_pull_request(newest));
        Ok(batch.len())
    }

    async fn sync_issues(&self, publisher: &Arc<dyn Publisher>) -> Result<usize> {
        let raw = self.connector.get_issues(self.start.last_issue_time).await?;
        let batch = self.processor.process_issues(&raw, &self.tags)?;

        let Some(newest) = deliver(publisher.as_ref(), &batch).await? else {
            return Ok(0);
        };
        self.store
            .update(&self.task_id, |r| r.advance_issue(newest));
        Ok(batch.len())
    }

    fn unit(&self, unit: &str, sink: &str, result: Result<usize>) -> UnitReport {
        let outcome = match result {
            Ok(0) => UnitOutcome::Empty,
            Ok(count) => {
                debug!(task_id = %self.task_id, sink = %sink, unit = unit, count = count, "Unit published");
                UnitOutcome::Published { count }
            }
            Err(e) => {
                warn!(task_id = %self.task_id, sink = %sink, unit = unit, error = %e, "Unit failed");
                UnitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        UnitReport {
            unit: unit.to_string(),
            outcome,
        }
    }
}

/// Publish a batch; returns its newest key, or None if there was nothing to send.
async fn deliver<T: Marker>(publisher: &dyn Publisher, batch: &Batch<T>) -> Result<Option<T::Key>> {
    let Some(newest) = batch.newest() else {
        return Ok(None);
    };
    publisher.publish(batch.documents()).await?;
    Ok(Some(newest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditError, AuditJob};
    use crate::processor::fixtures;
    use crate::scheduler::TaskParams;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeConnector {
        store: Arc<CheckpointStore>,
        task_id: String,
        commits: HashMap<String, Vec<Value>>,
        pulls: Vec<Value>,
        issues: Vec<Value>,
        fail_branch: Option<String>,
        record_seen_before_fetch: AtomicBool,
        commit_since: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    impl FakeConnector {
        fn new(store: &Arc<CheckpointStore>) -> Self {
            Self {
                store: Arc::clone(store),
                task_id: "job1$acme$widgets".to_string(),
                commits: HashMap::new(),
                pulls: Vec::new(),
                issues: Vec::new(),
                fail_branch: None,
                record_seen_before_fetch: AtomicBool::new(false),
                commit_since: Mutex::new(HashMap::new()),
            }
        }

        fn note_record(&self) {
            if self.store.get(&self.task_id).is_some() {
                self.record_seen_before_fetch.store(true, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl SourceConnector for FakeConnector {
        async fn check_credentials(&self) -> Result<()> {
            Ok(())
        }

        async fn get_commits(
            &self,
            since: DateTime<Utc>,
            _until: DateTime<Utc>,
            branch: &str,
        ) -> Result<Vec<u8>> {
            self.note_record();
            self.commit_since
                .lock()
                .unwrap()
                .insert(branch.to_string(), since);
            if self.fail_branch.as_deref() == Some(branch) {
                return Err(AuditError::Internal("branch fetch failed".to_string()));
            }
            let commits = self.commits.get(branch).cloned().unwrap_or_default();
            Ok(serde_json::to_vec(&commits).unwrap())
        }

        async fn get_pull_requests(&self, _after: u64) -> Result<Vec<u8>> {
            self.note_record();
            Ok(serde_json::to_vec(&self.pulls).unwrap())
        }

        async fn get_issues(&self, _since: DateTime<Utc>) -> Result<Vec<u8>> {
            self.note_record();
            Ok(serde_json::to_vec(&self.issues).unwrap())
        }
    }

    struct FakeProvider(Arc<FakeConnector>);

    impl SourceProvider for FakeProvider {
        fn connect(&self, _job: &AuditJob, _token: &str) -> Result<Arc<dyn SourceConnector>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenProvider;

    impl SourceProvider for BrokenProvider {
        fn connect(&self, job: &AuditJob, _token: &str) -> Result<Arc<dyn SourceConnector>> {
            Err(AuditError::UnsupportedRepoType(job.repo_type.clone()))
        }
    }

    struct FakePublisher {
        name: String,
        fail: bool,
        calls: Mutex<usize>,
        received: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        fn target(&self) -> &str {
            &self.name
        }

        async fn publish(&self, documents: &[Value]) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(AuditError::publish(&self.name, "sink down"));
            }
            self.received.lock().unwrap().extend_from_slice(documents);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory(HashMap<String, Arc<FakePublisher>>);

    impl FakeFactory {
        fn with(mut self, name: &str, fail: bool) -> Self {
            self.0.insert(
                name.to_string(),
                Arc::new(FakePublisher {
                    name: name.to_string(),
                    fail,
                    calls: Mutex::new(0),
                    received: Mutex::new(Vec::new()),
                }),
            );
            self
        }

        fn get(&self, name: &str) -> Arc<FakePublisher> {
            self.0[name].clone()
        }
    }

    impl PublisherFactory for FakeFactory {
        fn create(&self, target: &Target) -> Result<Arc<dyn Publisher>> {
            match self.0.get(&target.name) {
                Some(p) => Ok(p.clone()),
                None => Err(AuditError::UnknownTargetType(target.target_type.clone())),
            }
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            target_type: "fake".to_string(),
            config: HashMap::new(),
        }
    }

    fn task(targets: &[&str]) -> Task {
        let mut job = AuditJob {
            name: "job1".to_string(),
            repo_type: "github".to_string(),
            repo_owner: "acme".to_string(),
            repo_name: "widgets".to_string(),
            tags: HashMap::from([("team".to_string(), "core".to_string())]),
            ..Default::default()
        };
        job.repo_config.repo_url = "https://github.com/acme/widgets".to_string();
        job.repo_config.branches = vec!["main".to_string(), "dev".to_string()];
        job.output.target_name = targets.iter().map(|t| t.to_string()).collect();
        Task::new(
            TaskParams {
                job,
                targets: targets.iter().map(|name| target(name)).collect(),
                token: "secret".to_string(),
            },
            Duration::from_secs(30),
        )
    }

    fn store(dir: &TempDir) -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::open(dir.path().join("taskStats.json")))
    }

    fn pipeline(
        connector: Arc<FakeConnector>,
        factory: Arc<FakeFactory>,
        store: &Arc<CheckpointStore>,
    ) -> SyncPipeline {
        SyncPipeline::new(
            Arc::new(FakeProvider(connector)),
            factory,
            Arc::clone(store),
            Arc::new(DocumentFormatter::default()),
        )
        .with_parallelism(2)
    }

    #[tokio::test]
    async fn test_first_run_records_default_before_fetching() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let connector = Arc::new(FakeConnector::new(&store));
        let factory = Arc::new(FakeFactory::default().with("es", false));
        let task = task(&["es"]);

        let report = pipeline(connector.clone(), factory, &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        assert!(report.first_run);
        assert!(connector.record_seen_before_fetch.load(Ordering::SeqCst));
        let record = store.get(task.id()).unwrap();
        assert_eq!(record.commit_marker("main"), Some(t(0)));
        assert_eq!(record.commit_marker("dev"), Some(t(0)));
        assert_eq!(record.last_issue_time, t(0));
        assert_eq!(record.last_pr_number, 0);
        assert!(record.last_run_time.is_some());
        assert_eq!(connector.commit_since.lock().unwrap()["main"], t(0));
    }

    #[tokio::test]
    async fn test_branches_advance_independently() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut connector = FakeConnector::new(&store);
        connector.commits.insert(
            "main".to_string(),
            vec![
                fixtures::commit("c2", "2024-03-01T00:02:00Z"),
                fixtures::commit("c1", "2024-03-01T00:01:00Z"),
            ],
        );
        let factory = Arc::new(FakeFactory::default().with("es", false));
        let task = task(&["es"]);

        let report = pipeline(Arc::new(connector), factory.clone(), &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        let record = store.get(task.id()).unwrap();
        assert_eq!(record.commit_marker("main"), Some(t(120)));
        assert_eq!(record.commit_marker("dev"), Some(t(0)));
        assert_eq!(report.published(), 2);

        let received = factory.get("es").received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["team"], "core");
    }

    #[tokio::test]
    async fn test_failed_sink_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut connector = FakeConnector::new(&store);
        connector.pulls = vec![fixtures::pull_request(4)];
        let factory = Arc::new(
            FakeFactory::default()
                .with("broken", true)
                .with("es", false),
        );
        let task = task(&["broken", "es"]);

        let report = pipeline(Arc::new(connector), factory.clone(), &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        assert_eq!(*factory.get("broken").calls.lock().unwrap(), 1);
        assert_eq!(factory.get("es").received.lock().unwrap().len(), 1);
        assert_eq!(report.targets[0].target, "broken");
        assert_eq!(report.failures(), 1);
        assert_eq!(store.get(task.id()).unwrap().last_pr_number, 4);
    }

    #[tokio::test]
    async fn test_failed_branch_keeps_its_marker() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut connector = FakeConnector::new(&store);
        connector.fail_branch = Some("dev".to_string());
        connector.commits.insert(
            "main".to_string(),
            vec![fixtures::commit("c1", "2024-03-01T00:01:00Z")],
        );
        let factory = Arc::new(FakeFactory::default().with("es", false));
        let task = task(&["es"]);

        let report = pipeline(Arc::new(connector), factory, &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        let record = store.get(task.id()).unwrap();
        assert_eq!(record.commit_marker("main"), Some(t(60)));
        assert_eq!(record.commit_marker("dev"), Some(t(0)));
        let units = &report.targets[0].units;
        assert_eq!(units[0].unit, "commits:main");
        assert_eq!(units[0].outcome, UnitOutcome::Published { count: 1 });
        assert!(matches!(units[1].outcome, UnitOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_markers_filter_and_never_regress() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task(&["es"]);
        let mut existing = CheckpointRecord::initial(t(0), &["main".to_string()]);
        existing.advance_pull_request(5);
        existing.advance_issue(t(600));
        store.set(task.id(), existing);

        let mut connector = FakeConnector::new(&store);
        connector.pulls = vec![fixtures::pull_request(7), fixtures::pull_request(3)];
        connector.issues = vec![
            fixtures::issue(9, "2024-03-01T00:05:00Z", false),
            fixtures::issue(10, "2024-03-01T00:06:00Z", true),
        ];
        let factory = Arc::new(FakeFactory::default().with("es", false));

        let report = pipeline(Arc::new(connector), factory.clone(), &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        assert!(!report.first_run);
        let record = store.get(task.id()).unwrap();
        assert_eq!(record.last_pr_number, 7);
        // Issue created before the marker is still delivered but cannot move it back.
        assert_eq!(record.last_issue_time, t(600));
        // "dev" was configured after the record was created.
        assert_eq!(record.commit_marker("dev"), Some(t(0)));

        let received = factory.get("es").received.lock().unwrap().clone();
        let numbers: Vec<&Value> = received
            .iter()
            .filter_map(|d| d.get("pull_request_no"))
            .collect();
        assert_eq!(numbers, vec!["7"]);
        assert_eq!(
            received.iter().filter(|d| d["document_type"] == "issue").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_target_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let connector = Arc::new(FakeConnector::new(&store));
        let factory = Arc::new(FakeFactory::default().with("es", false));
        let task = task(&["missing", "es"]);

        let report = pipeline(connector, factory, &store)
            .sync(&task, t(0))
            .await
            .unwrap();

        assert!(report.targets[0].error.is_some());
        assert!(report.targets[1].error.is_none());
        assert_eq!(report.targets[1].units.len(), 4);
    }

    #[tokio::test]
    async fn test_connector_failure_fails_pass() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let pipeline = SyncPipeline::new(
            Arc::new(BrokenProvider),
            Arc::new(FakeFactory::default()),
            Arc::clone(&store),
            Arc::new(DocumentFormatter::default()),
        );
        let task = task(&["es"]);

        assert!(pipeline.sync(&task, t(0)).await.is_err());
        let record = store.get(task.id()).unwrap();
        assert!(record.last_run_time.is_none());
    }
}
