//! Elasticsearch bulk publisher.
//!
//! Documents go to the `metric-{index}-{path}-$_write` alias through the
//! `_bulk` API. Per-item failures inside a successful bulk response are
//! logged, not raised: the sink is expected to tolerate re-delivery and a
//! retry would resend the whole batch.

use super::http::{build_client, flag, send_with_retry};
use super::{Publisher, settings_from};
use crate::models::{AuditError, Result, Target};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request timeout for bulk calls.
pub const ELASTICSEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Target settings for `type = "elasticsearch"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub index: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// "true" for clusters older than 7.x (mapping type `doc`)
    #[serde(default)]
    pub old_es: String,
    /// "true" to skip TLS certificate verification
    #[serde(default)]
    pub insecure: String,
}

fn default_port() -> String {
    "9200".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    error: Option<EsError>,
}

#[derive(Debug, Deserialize)]
struct EsError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: EsError,
}

/// Publishes to an Elasticsearch cluster.
pub struct ElasticsearchPublisher {
    name: String,
    client: reqwest::Client,
    url: String,
    credentials: Option<(String, String)>,
}

impl ElasticsearchPublisher {
    pub fn from_target(target: &Target) -> Result<Self> {
        let settings: ElasticsearchSettings = settings_from(target)?;
        Self::new(&target.name, settings)
    }

    pub fn new(name: &str, settings: ElasticsearchSettings) -> Result<Self> {
        let client = build_client(ELASTICSEARCH_TIMEOUT, flag(&settings.insecure))?;
        let credentials = match (&settings.username, &settings.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            client,
            url: bulk_url(&settings),
            credentials,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `{protocol}://{host}:{port}/metric-{index}-{path}-$_write/{type}/_bulk/`
pub fn bulk_url(settings: &ElasticsearchSettings) -> String {
    let doc_type = if flag(&settings.old_es) { "doc" } else { "_doc" };
    format!(
        "{}://{}:{}/metric-{}-{}-$_write/{}/_bulk/",
        settings.protocol, settings.host, settings.port, settings.index, settings.path, doc_type
    )
}

/// NDJSON bulk body: an empty index action before every document.
pub fn bulk_body(documents: &[Value]) -> Result<String> {
    let mut body = String::new();
    for doc in documents {
        let line = serde_json::to_string(doc)
            .map_err(|e| AuditError::Internal(format!("Serializing document: {e}")))?;
        body.push_str("{\"index\":{}}\n");
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl Publisher for ElasticsearchPublisher {
    fn target(&self) -> &str {
        &self.name
    }

    async fn publish(&self, documents: &[Value]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let body = bulk_body(documents)?;

        let (status, response) = send_with_retry(&self.name, || {
            let request = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/x-ndjson")
                .body(body.clone());
            match &self.credentials {
                Some((user, password)) => request.basic_auth(user, Some(password)),
                None => request,
            }
        })
        .await?;

        if !status.is_success() {
            let reason = serde_json::from_str::<ErrorResponse>(&response)
                .map(|e| format!("{}: {}", e.error.error_type, e.error.reason))
                .unwrap_or(response);
            return Err(AuditError::publish(
                &self.name,
                format!("status {}: {reason}", status.as_u16()),
            ));
        }

        let bulk: BulkResponse = serde_json::from_str(&response).map_err(|e| {
            AuditError::publish(&self.name, format!("invalid bulk response: {e}"))
        })?;

        if bulk.errors {
            let failed: Vec<&EsError> = bulk
                .items
                .iter()
                .flat_map(|item| item.values())
                .filter(|item| item.status > 299)
                .filter_map(|item| item.error.as_ref())
                .collect();
            for error in &failed {
                debug!(sink = %self.name, reason = %error.reason, "Bulk item rejected");
            }
            warn!(
                sink = %self.name,
                rejected = failed.len(),
                total = documents.len(),
                "Elasticsearch rejected some documents"
            );
        } else {
            info!(sink = %self.name, count = documents.len(), "Published to Elasticsearch");
        }
        Ok(())
    }
}
