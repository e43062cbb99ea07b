//! HTTP plumbing shared by the sink publishers.

use crate::models::{AuditError, Result};
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Wait before the single retry of a failed publish request.
pub const RETRY_WAIT: Duration = Duration::from_millis(500);

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 1;

/// Build a client with a per-request timeout.
pub(crate) fn build_client(timeout: Duration, insecure: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(AuditError::Network)
}

/// Send a request, retrying once on a network error or 5xx status.
///
/// `build` is called per attempt because request builders are consumed on send.
pub(crate) async fn send_with_retry<F>(target: &str, build: F) -> Result<(StatusCode, String)>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let outcome = build().send().await;
        let retryable = match &outcome {
            Err(_) => true,
            Ok(response) => response.status().is_server_error(),
        };

        if retryable && attempt < MAX_RETRIES {
            attempt += 1;
            debug!(sink = target, attempt = attempt, "Retrying publish request");
            tokio::time::sleep(RETRY_WAIT).await;
            continue;
        }

        let response = outcome.map_err(AuditError::Network)?;
        let status = response.status();
        let body = response.text().await.map_err(AuditError::Network)?;
        return Ok((status, body));
    }
}

/// Interpret a settings flag ("true", "1", "yes").
pub(crate) fn flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag() {
        assert!(flag("true"));
        assert!(flag(" TRUE "));
        assert!(flag("1"));
        assert!(!flag("false"));
        assert!(!flag(""));
    }

    #[tokio::test]
    async fn test_retries_once_on_server_error() {
        let (addr, captured) = test_server::serve(vec![
            (503, "{}".to_string()),
            (200, "{\"ok\":true}".to_string()),
        ])
        .await;
        let client = build_client(Duration::from_secs(5), false).unwrap();
        let url = format!("http://{addr}/");

        let (status, body) = send_with_retry("t", || client.post(&url).body("x"))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\"ok\":true}");
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_one_retry() {
        let (addr, captured) = test_server::serve(vec![(500, "{}".to_string())]).await;
        let client = build_client(Duration::from_secs(5), false).unwrap();
        let url = format!("http://{addr}/");

        let (status, _) = send_with_retry("t", || client.post(&url).body("x"))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let (addr, captured) = test_server::serve(vec![(400, "{}".to_string())]).await;
        let client = build_client(Duration::from_secs(5), false).unwrap();
        let url = format!("http://{addr}/");

        let (status, _) = send_with_retry("t", || client.post(&url).body("x"))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(captured.lock().unwrap().len(), 1);
    }
}
