//! GitHub REST API connector.
//!
//! Every list endpoint is paged (`per_page=100`) by following the
//! `Link: <...>; rel="next"` header until it disappears. Pages are merged
//! into one JSON array so callers see a single payload.

use super::{RateLimiter, SourceConnector, SourceProvider};
use crate::models::{AuditError, AuditJob, ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, LINK, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Public GitHub API.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Per-request timeout for GitHub calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const PER_PAGE: &str = "100";
const MAX_ATTEMPTS: u32 = 3;

/// Connector for one GitHub repository.
pub struct GithubClient {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
    principal: String,
    token: String,
    timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
}

impl GithubClient {
    /// Create a new GitHub client.
    pub fn new(
        base_url: Option<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        principal: impl Into<String>,
        token: impl Into<String>,
        timeout: Option<Duration>,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AuditError::Network)?;

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            owner: owner.into(),
            repo: repo.into(),
            principal: principal.into(),
            token: token.into(),
            timeout,
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
        })
    }

    /// Build headers for a request.
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("github-audit"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        if !self.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|_| AuditError::InvalidInput("access token is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// URL of a repository endpoint with query parameters.
    pub fn repo_url(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Url> {
        let raw = format!(
            "{}/repos/{}/{}/{}",
            self.base_url, self.owner, self.repo, endpoint
        );
        Url::parse_with_params(&raw, params)
            .map_err(|e| AuditError::InvalidInput(format!("Invalid API URL {raw}: {e}")))
    }

    /// GET one URL, retrying transient failures and waiting out rate limits.
    async fn get(&self, url: &Url) -> Result<(Value, HeaderMap)> {
        let mut last_error: Option<AuditError> = None;
        let mut rate_limit_retried = false;

        for attempt in 0..MAX_ATTEMPTS {
            self.rate_limiter.wait_if_needed(&self.principal).await?;

            let response = match self
                .client
                .get(url.clone())
                .headers(self.headers()?)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        AuditError::Timeout(self.timeout)
                    } else {
                        AuditError::Network(e)
                    });
                    backoff(attempt).await;
                    continue;
                }
            };

            let status = response.status();
            let headers = response.headers().clone();
            self.rate_limiter
                .record_request(&self.principal, status.as_u16(), &headers);

            if super::is_rate_limited(status.as_u16(), &headers) {
                let error = AuditError::RateLimited {
                    retry_after_secs: self.rate_limiter.wait_time(&self.principal).as_secs_f64(),
                };
                if rate_limit_retried {
                    return Err(error);
                }
                // One retry, after the wait at the top of the next attempt.
                rate_limit_retried = true;
                last_error = Some(error);
                continue;
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                let error = match status {
                    StatusCode::UNAUTHORIZED => {
                        ProviderError::AuthenticationFailed(self.principal.clone())
                    }
                    StatusCode::NOT_FOUND => {
                        ProviderError::NotFound(format!("{}/{}", self.owner, self.repo))
                    }
                    _ => ProviderError::ApiError {
                        status: status.as_u16(),
                        message,
                    },
                };
                let error = AuditError::Provider(error);
                if !error.is_retryable() {
                    return Err(error);
                }
                last_error = Some(error);
                backoff(attempt).await;
                continue;
            }

            let body: Value = response.json().await.map_err(|e| {
                AuditError::Provider(ProviderError::InvalidResponse(format!(
                    "Failed to parse response: {e}"
                )))
            })?;
            return Ok((body, headers));
        }

        Err(last_error.unwrap_or_else(|| {
            AuditError::Internal("GitHub request loop exited without a result".to_string())
        }))
    }

    /// Follow pagination from `url`, keeping items accepted by `keep`.
    async fn list<F>(&self, mut url: Url, keep: F) -> Result<Vec<Value>>
    where
        F: Fn(&Value) -> bool,
    {
        let mut items = Vec::new();
        let mut pages = 0usize;

        loop {
            let (body, headers) = self.get(&url).await?;
            pages += 1;
            match body {
                Value::Array(page) => items.extend(page.into_iter().filter(|v| keep(v))),
                other => {
                    return Err(AuditError::Provider(ProviderError::InvalidResponse(format!(
                        "expected a JSON array, got {}",
                        kind_of(&other)
                    ))));
                }
            }

            match next_page(&headers) {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(
            repo = %format!("{}/{}", self.owner, self.repo),
            pages = pages,
            items = items.len(),
            "Fetched listing"
        );
        Ok(items)
    }
}

async fn backoff(attempt: u32) {
    if attempt + 1 < MAX_ATTEMPTS {
        let delay = Duration::from_secs(2u64.pow(attempt));
        debug!(attempt = attempt, backoff_secs = delay.as_secs(), "Retrying GitHub request");
        tokio::time::sleep(delay).await;
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_bytes(items: Vec<Value>) -> Result<Vec<u8>> {
    serde_json::to_vec(&items)
        .map_err(|e| AuditError::Internal(format!("Serializing listing: {e}")))
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_page(headers: &HeaderMap) -> Option<Url> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|s| s.trim() == r#"rel="next""#);
        if !is_next {
            return None;
        }
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        Url::parse(target).ok()
    })
}

#[async_trait]
impl SourceConnector for GithubClient {
    async fn check_credentials(&self) -> Result<()> {
        let url = Url::parse(&format!("{}/user", self.base_url))
            .map_err(|e| AuditError::InvalidInput(format!("Invalid API URL: {e}")))?;
        self.get(&url).await.map(|_| ())
    }

    async fn get_commits(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        branch: &str,
    ) -> Result<Vec<u8>> {
        debug!(
            branch = branch,
            repo = %self.repo,
            since = %since,
            until = %until,
            "Fetching commits"
        );
        let url = self.repo_url(
            "commits",
            &[
                ("sha", branch.to_string()),
                ("since", timestamp(since)),
                ("until", timestamp(until)),
                ("per_page", PER_PAGE.to_string()),
            ],
        )?;
        to_bytes(self.list(url, |_| true).await?)
    }

    async fn get_pull_requests(&self, after: u64) -> Result<Vec<u8>> {
        debug!(after = after, repo = %self.repo, "Fetching pull requests");
        let url = self.repo_url(
            "pulls",
            &[
                ("state", "all".to_string()),
                ("per_page", PER_PAGE.to_string()),
            ],
        )?;
        let items = self
            .list(url, |pr| {
                pr.get("number")
                    .and_then(Value::as_u64)
                    .is_some_and(|n| n > after)
            })
            .await?;
        to_bytes(items)
    }

    async fn get_issues(&self, since: DateTime<Utc>) -> Result<Vec<u8>> {
        debug!(since = %since, repo = %self.repo, "Fetching issues");
        let url = self.repo_url(
            "issues",
            &[
                ("state", "all".to_string()),
                ("since", timestamp(since)),
                ("per_page", PER_PAGE.to_string()),
            ],
        )?;
        to_bytes(self.list(url, |_| true).await?)
    }
}

/// Builds [`GithubClient`]s sharing one rate limiter.
#[derive(Default)]
pub struct GithubProvider {
    rate_limiter: Arc<RateLimiter>,
    timeout: Option<Duration>,
}

impl GithubProvider {
    pub fn new(rate_limiter: Arc<RateLimiter>, timeout: Option<Duration>) -> Self {
        Self {
            rate_limiter,
            timeout,
        }
    }
}

impl SourceProvider for GithubProvider {
    fn connect(&self, job: &AuditJob, token: &str) -> Result<Arc<dyn SourceConnector>> {
        if !job.repo_type.eq_ignore_ascii_case("github") {
            return Err(AuditError::UnsupportedRepoType(job.repo_type.clone()));
        }
        let client = GithubClient::new(
            job.api_url.clone(),
            job.repo_owner.clone(),
            job.repo_name.clone(),
            job.repo_config.credentials.principal(),
            token,
            self.timeout,
            Some(Arc::clone(&self.rate_limiter)),
        )?;
        Ok(Arc::new(client))
    }
}
