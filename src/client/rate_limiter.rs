//! Adaptive rate limiter for the GitHub REST API.
//!
//! Assumptions:
//! - GitHub reports the remaining budget and its reset (epoch seconds) on every response
//! - Exhausting the budget yields 403 or 429; secondary limits send `retry-after`
//! - Limits are per credential, so state is keyed by the authenticated principal

use crate::models::{AuditError, Result};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest we will sleep for a single reset; beyond that the call fails fast
/// and the work is picked up again on the next cadence.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Rate limit state for a single credential.
#[derive(Debug)]
pub struct RateLimitState {
    /// Requests allowed per window
    pub limit: Option<u32>,
    /// Requests remaining in the current window
    pub remaining: Option<u32>,
    /// When the window resets
    pub reset_at: Option<Instant>,
    /// Consecutive limited responses (for backoff)
    pub consecutive_limited: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
    /// Last update time
    pub last_updated: Instant,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            limit: None,
            remaining: None,
            reset_at: None,
            consecutive_limited: 0,
            backoff_until: None,
            last_updated: Instant::now(),
        }
    }
}

impl RateLimitState {
    /// Get time to wait before proceeding.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut max_wait = Duration::ZERO;

        if let Some(until) = self.backoff_until.filter(|&t| t > now) {
            max_wait = max_wait.max(until - now);
        }

        if self.remaining == Some(0) {
            if let Some(reset_at) = self.reset_at.filter(|&t| t > now) {
                max_wait = max_wait.max(reset_at - now);
            }
        }

        max_wait
    }

    /// Record a limited response, honouring `retry-after` when present.
    pub fn record_limited(&mut self, retry_after: Option<Duration>) {
        self.consecutive_limited += 1;
        let backoff = retry_after.unwrap_or_else(|| {
            Duration::from_secs_f64((2.0_f64).powi(self.consecutive_limited as i32).min(60.0))
        });
        self.backoff_until = Some(Instant::now() + backoff);
        warn!(
            consecutive = self.consecutive_limited,
            backoff_secs = backoff.as_secs_f64(),
            "Rate limited by GitHub, backing off"
        );
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        if self.consecutive_limited > 0 {
            self.consecutive_limited = 0;
            self.backoff_until = None;
        }
    }

    /// Update state from GitHub's `x-ratelimit-*` headers.
    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        let now = Instant::now();
        let parse = |key: &str| -> Option<i64> { headers.get(key)?.to_str().ok()?.parse().ok() };

        if let Some(limit) = parse("x-ratelimit-limit") {
            self.limit = u32::try_from(limit).ok();
        }
        if let Some(remaining) = parse("x-ratelimit-remaining") {
            self.remaining = u32::try_from(remaining).ok();
        }
        if let Some(reset_epoch) = parse("x-ratelimit-reset") {
            let secs = (reset_epoch - chrono::Utc::now().timestamp()).max(0) as u64;
            self.reset_at = Some(now + Duration::from_secs(secs));
        }

        self.last_updated = now;
    }
}

/// Whether a response means the rate limit was hit.
pub fn is_rate_limited(status: u16, headers: &HeaderMap) -> bool {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");
    status == 429 || (status == 403 && (exhausted || headers.contains_key("retry-after")))
}

/// `retry-after` header in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Adaptive rate limiter shared by all GitHub connectors.
#[derive(Debug)]
pub struct RateLimiter {
    /// Per-credential rate limit state
    states: DashMap<String, RateLimitState>,
    /// Global stats
    total_requests: AtomicU64,
    total_limited: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_limited: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Time a request for `key` would have to wait.
    pub fn wait_time(&self, key: &str) -> Duration {
        self.states
            .get(key)
            .map(|state| state.wait_time())
            .unwrap_or(Duration::ZERO)
    }

    /// Wait if necessary before making a request for `key`.
    ///
    /// Returns the duration waited, or `RateLimited` without sleeping when the
    /// wait would exceed [`MAX_RATE_LIMIT_WAIT`].
    pub async fn wait_if_needed(&self, key: &str) -> Result<Duration> {
        let wait_time = self.wait_time(key);
        if wait_time > MAX_RATE_LIMIT_WAIT {
            warn!(
                key = key,
                wait_secs = wait_time.as_secs(),
                "Rate limit reset too far away, giving up"
            );
            return Err(AuditError::RateLimited {
                retry_after_secs: wait_time.as_secs_f64(),
            });
        }

        if wait_time > Duration::ZERO {
            debug!(
                key = key,
                wait_ms = wait_time.as_millis() as u64,
                "Waiting for rate limit"
            );
            self.total_wait_ms
                .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait_time).await;
        }

        Ok(wait_time)
    }

    /// Record a response.
    pub fn record_request(&self, key: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut state = self.states.entry(key.to_string()).or_default();
        state.update_from_headers(headers);

        if is_rate_limited(status, headers) {
            self.total_limited.fetch_add(1, Ordering::Relaxed);
            state.record_limited(retry_after(headers));
        } else if status < 400 {
            state.record_success();
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_limited = self.total_limited.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);

        RateLimiterStats {
            total_requests,
            total_limited,
            total_wait_secs: total_wait_ms as f64 / 1000.0,
            credentials_tracked: self.states.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_limited: u64,
    pub total_wait_secs: f64,
    pub credentials_tracked: usize,
}
