//! Source connector seam.
//!
//! A connector hands back raw provider payloads (JSON arrays as bytes);
//! turning them into documents is the processor's job.

use crate::models::{AuditJob, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Incremental access to one repository's activity.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Verify the configured credentials are accepted.
    async fn check_credentials(&self) -> Result<()>;

    /// Commits on `branch` committed in `[since, until]`.
    async fn get_commits(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        branch: &str,
    ) -> Result<Vec<u8>>;

    /// Pull requests in any state with a number greater than `after`.
    async fn get_pull_requests(&self, after: u64) -> Result<Vec<u8>>;

    /// Issues updated since `since`.
    async fn get_issues(&self, since: DateTime<Utc>) -> Result<Vec<u8>>;
}

/// Builds connectors for audit jobs.
pub trait SourceProvider: Send + Sync {
    /// Create a connector for `job` authenticated with the decoded `token`.
    fn connect(&self, job: &AuditJob, token: &str) -> Result<Arc<dyn SourceConnector>>;
}
