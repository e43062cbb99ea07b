//! Kafka REST proxy publisher.

use super::http::{build_client, flag, send_with_retry};
use super::{Publisher, settings_from};
use crate::models::{AuditError, Result, Target};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Request timeout for record batches.
pub const KAFKA_REST_TIMEOUT: Duration = Duration::from_secs(15);

/// Target settings for `type = "kafka-rest"`.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaRestSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub topic: String,
    /// Optional URL prefix before `/topics`
    #[serde(default)]
    pub path: String,
    /// Sent verbatim as the Authorization header
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "username")]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: String,
}

fn default_port() -> String {
    "8082".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

#[derive(Serialize)]
struct RecordBatch<'a> {
    records: Vec<Record<'a>>,
}

#[derive(Serialize)]
struct Record<'a> {
    value: &'a Value,
}

#[derive(Debug, Default, Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    offsets: Vec<Offset>,
}

#[derive(Debug, Deserialize)]
struct Offset {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// Publishes to a topic through the Confluent REST proxy (v2 API).
pub struct KafkaRestPublisher {
    name: String,
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    credentials: Option<(String, String)>,
}

impl KafkaRestPublisher {
    pub fn from_target(target: &Target) -> Result<Self> {
        let settings: KafkaRestSettings = settings_from(target)?;
        Self::new(&target.name, settings)
    }

    pub fn new(name: &str, settings: KafkaRestSettings) -> Result<Self> {
        let client = build_client(KAFKA_REST_TIMEOUT, flag(&settings.insecure))?;
        let credentials = match (&settings.user, &settings.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            client,
            url: topic_url(&settings),
            token: settings.token.filter(|t| !t.is_empty()),
            credentials,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `{protocol}://{host}:{port}[/{path}]/topics/{topic}`
pub fn topic_url(settings: &KafkaRestSettings) -> String {
    let path = settings.path.trim_matches('/');
    if path.is_empty() {
        format!(
            "{}://{}:{}/topics/{}",
            settings.protocol, settings.host, settings.port, settings.topic
        )
    } else {
        format!(
            "{}://{}:{}/{}/topics/{}",
            settings.protocol, settings.host, settings.port, path, settings.topic
        )
    }
}

/// `{"records":[{"value":<doc>},...]}`
pub fn record_body(documents: &[Value]) -> Result<String> {
    let batch = RecordBatch {
        records: documents.iter().map(|value| Record { value }).collect(),
    };
    serde_json::to_string(&batch)
        .map_err(|e| AuditError::Internal(format!("Serializing records: {e}")))
}

#[async_trait]
impl Publisher for KafkaRestPublisher {
    fn target(&self) -> &str {
        &self.name
    }

    async fn publish(&self, documents: &[Value]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let body = record_body(documents)?;

        let (status, response) = send_with_retry(&self.name, || {
            let mut request = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/vnd.kafka.json.v2+json")
                .header(ACCEPT, "application/vnd.kafka.v2+json")
                .body(body.clone());
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, token);
            }
            if let Some((user, password)) = &self.credentials {
                request = request.basic_auth(user, Some(password));
            }
            request
        })
        .await?;

        let parsed: ProduceResponse = serde_json::from_str(&response).unwrap_or_default();

        if !status.is_success() {
            let message = parsed.message.unwrap_or(response);
            return Err(AuditError::publish(
                &self.name,
                format!("status {}: {message}", status.as_u16()),
            ));
        }

        if parsed.error_code.is_some_and(|c| c != 0) {
            warn!(
                sink = %self.name,
                error_code = parsed.error_code.unwrap_or_default(),
                message = parsed.message.as_deref().unwrap_or_default(),
                "Kafka REST reported a batch error"
            );
            return Ok(());
        }

        let failed = parsed
            .offsets
            .iter()
            .filter(|o| o.error_code.is_some_and(|c| c != 0) || o.error.is_some())
            .count();
        if failed > 0 {
            warn!(
                sink = %self.name,
                rejected = failed,
                total = documents.len(),
                "Kafka REST rejected some records"
            );
        } else {
            info!(sink = %self.name, count = documents.len(), "Published to Kafka REST");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::http::test_server;
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn settings(host: &str, port: &str) -> KafkaRestSettings {
        KafkaRestSettings {
            host: host.to_string(),
            port: port.to_string(),
            protocol: "http".to_string(),
            topic: "github-audit".to_string(),
            path: String::new(),
            token: Some("Bearer abc".to_string()),
            user: None,
            password: None,
            insecure: String::new(),
        }
    }

    #[test]
    fn test_topic_url() {
        let mut s = settings("kafka.local", "8082");
        assert_eq!(topic_url(&s), "http://kafka.local:8082/topics/github-audit");
        s.path = "/proxy/".to_string();
        assert_eq!(topic_url(&s), "http://kafka.local:8082/proxy/topics/github-audit");
    }

    #[test]
    fn test_record_body() {
        let body = record_body(&[json!({"a": 1}), json!("b")]).unwrap();
        assert_eq!(body, r#"{"records":[{"value":{"a":1}},{"value":"b"}]}"#);
    }

    #[test]
    fn test_settings_from_target_map() {
        let target = Target {
            name: "kafka".to_string(),
            target_type: "kafka-rest".to_string(),
            config: HashMap::from([
                ("host".to_string(), "localhost".to_string()),
                ("topic".to_string(), "audit".to_string()),
                ("user".to_string(), "u".to_string()),
                ("password".to_string(), "p".to_string()),
            ]),
        };
        let publisher = KafkaRestPublisher::from_target(&target).unwrap();
        assert_eq!(publisher.url(), "http://localhost:8082/topics/audit");
        assert!(publisher.credentials.is_some());
    }

    #[tokio::test]
    async fn test_publish_sends_records() {
        let (addr, captured) = test_server::serve(vec![(
            200,
            r#"{"offsets": [{"partition": 0, "offset": 1}], "key_schema_id": null, "value_schema_id": null}"#
                .to_string(),
        )])
        .await;
        let (host, port) = addr.split_once(':').unwrap();
        let publisher = KafkaRestPublisher::new("kafka", settings(host, port)).unwrap();

        publisher.publish(&[json!({"sha": "c1"})]).await.unwrap();

        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].request_line(), "POST /topics/github-audit HTTP/1.1");
        assert_eq!(requests[0].body, r#"{"records":[{"value":{"sha":"c1"}}]}"#);
        assert_eq!(
            requests[0].header("content-type").as_deref(),
            Some("application/vnd.kafka.json.v2+json")
        );
        assert_eq!(requests[0].header("authorization").as_deref(), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let (addr, _) = test_server::serve(vec![(
            404,
            r#"{"error_code": 40401, "message": "Topic not found."}"#.to_string(),
        )])
        .await;
        let (host, port) = addr.split_once(':').unwrap();
        let publisher = KafkaRestPublisher::new("kafka", settings(host, port)).unwrap();

        let err = publisher.publish(&[json!({"x": 1})]).await.unwrap_err();
        assert!(err.to_string().contains("Topic not found."));
    }
}
