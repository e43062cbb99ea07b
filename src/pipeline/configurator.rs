//! Turns validated audit jobs into schedulable tasks.

use crate::client::SourceProvider;
use crate::models::{AuditError, AuditJob, Config, Result, parse_polling_interval};
use crate::scheduler::{Task, TaskParams};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{error, info, warn};

/// Decode a base64 access token.
pub fn decode_token(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuditError::InvalidInput(format!("access token is not base64: {e}")))?;
    let token = String::from_utf8(bytes)
        .map_err(|_| AuditError::InvalidInput("access token is not UTF-8".to_string()))?;
    Ok(token.trim_end().to_string())
}

/// Build one task per audit job that passes the credential check.
///
/// A job that fails is logged and skipped; it never aborts the others.
pub async fn build_tasks(config: &Config, provider: &dyn SourceProvider) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(config.audit_jobs.len());

    for job in &config.audit_jobs {
        match build_task(config, job, provider).await {
            Ok(task) => {
                info!(
                    task_id = task.id(),
                    cadence_secs = task.cadence().as_secs(),
                    targets = task.params().targets.len(),
                    branches = job.repo_config.branches.len(),
                    "Task configured"
                );
                tasks.push(task);
            }
            Err(e) => error!(job = %job.name, error = %e, "Skipping audit job"),
        }
    }

    if tasks.is_empty() {
        return Err(AuditError::NoTaskConfigured);
    }
    Ok(tasks)
}

async fn build_task(config: &Config, job: &AuditJob, provider: &dyn SourceProvider) -> Result<Task> {
    let token = decode_token(&job.repo_config.credentials.access_token)?;

    let connector = provider.connect(job, &token)?;
    connector.check_credentials().await?;

    let cadence = match parse_polling_interval(&job.polling_interval) {
        Some(cadence) => cadence,
        None => {
            warn!(
                job = %job.name,
                polling_interval = %job.polling_interval,
                "Unparsable polling interval, using default"
            );
            job.cadence()
        }
    };

    Ok(Task::new(
        TaskParams {
            job: job.clone(),
            targets: config.targets_for(job),
            token,
        },
        cadence,
    ))
}
