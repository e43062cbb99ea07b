//! Sink publishers.
//!
//! Provides:
//! - `Publisher`: the seam the sync pipeline pushes documents through
//! - `PublisherFactory` / `HttpPublisherFactory`: target type to publisher
//! - `ElasticsearchPublisher`: `_bulk` API
//! - `KafkaRestPublisher`: REST proxy v2 API
//!
//! Delivery is at-least-once; sinks must tolerate duplicates.

mod elasticsearch;
mod http;
mod kafka_rest;

pub use elasticsearch::*;
pub use http::{MAX_RETRIES, RETRY_WAIT};
#[cfg(test)]
pub(crate) use http::test_server;
pub use kafka_rest::*;

use crate::models::{AuditError, Result, Target};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Target type names.
pub const ELASTICSEARCH: &str = "elasticsearch";
pub const KAFKA_REST: &str = "kafka-rest";

/// Delivers transformed documents to one sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Configured target name, for logs and errors.
    fn target(&self) -> &str;

    /// Deliver `documents` in order. An empty slice is a no-op.
    async fn publish(&self, documents: &[Value]) -> Result<()>;
}

/// Creates publishers from target configuration.
pub trait PublisherFactory: Send + Sync {
    fn create(&self, target: &Target) -> Result<Arc<dyn Publisher>>;
}

/// Factory for the HTTP-based sinks.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpPublisherFactory;

impl PublisherFactory for HttpPublisherFactory {
    fn create(&self, target: &Target) -> Result<Arc<dyn Publisher>> {
        match target.target_type.to_ascii_lowercase().as_str() {
            ELASTICSEARCH => Ok(Arc::new(ElasticsearchPublisher::from_target(target)?)),
            KAFKA_REST => Ok(Arc::new(KafkaRestPublisher::from_target(target)?)),
            _ => Err(AuditError::UnknownTargetType(target.target_type.clone())),
        }
    }
}

/// Deserialize a target's (env-expanded) string map into typed settings.
pub(crate) fn settings_from<T: DeserializeOwned>(target: &Target) -> Result<T> {
    let map = serde_json::Map::from_iter(
        target
            .expanded_config()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v))),
    );
    serde_json::from_value(Value::Object(map)).map_err(|e| {
        AuditError::InvalidInput(format!("target '{}' settings: {e}", target.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn target(kind: &str) -> Target {
        Target {
            name: "t".to_string(),
            target_type: kind.to_string(),
            config: HashMap::from([
                ("host".to_string(), "localhost".to_string()),
                ("index".to_string(), "github".to_string()),
                ("topic".to_string(), "audit".to_string()),
            ]),
        }
    }

    #[test]
    fn test_factory_by_type() {
        let factory = HttpPublisherFactory;
        assert_eq!(factory.create(&target("elasticsearch")).unwrap().target(), "t");
        assert_eq!(factory.create(&target("Kafka-Rest")).unwrap().target(), "t");
    }

    #[test]
    fn test_factory_unknown_type() {
        let err = HttpPublisherFactory.create(&target("splunk")).err().unwrap();
        assert!(matches!(err, AuditError::UnknownTargetType(t) if t == "splunk"));
    }
}
