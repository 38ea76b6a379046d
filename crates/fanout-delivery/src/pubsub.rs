//! Pub/sub adapter: publishes envelope payloads to named topics.
//!
//! The payload is encoded as UTF-8 JSON bytes and published to the
//! fully-qualified topic path `projects/{project_id}/topics/{topic}`.
//! The broker transport itself sits behind [`TopicPublisher`], so the
//! adapter is testable without a real broker; [`memory::InMemoryPublisher`]
//! is the default in-process implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fanout_core::{Destination, Envelope, TaskKind};
use tracing::{debug, info_span, Instrument};

use crate::{
    adapter::{DeliveryAdapter, DeliveryReceipt},
    error::{DeliveryError, Result},
};

/// Transport seam for topic-based publishing.
///
/// Implementations map their transport failures to
/// `DeliveryError::Broker` so the retry policy treats outages as
/// transient.
#[async_trait]
pub trait TopicPublisher: Send + Sync + std::fmt::Debug {
    /// Publishes one message to a fully-qualified topic path.
    async fn publish(&self, topic_path: &str, data: Bytes) -> Result<()>;
}

/// Adapter for pub/sub destinations.
#[derive(Debug, Clone)]
pub struct PubSubAdapter {
    publisher: Arc<dyn TopicPublisher>,
    project_id: String,
}

impl PubSubAdapter {
    /// Creates a pub/sub adapter publishing under the given project.
    pub fn new(publisher: Arc<dyn TopicPublisher>, project_id: impl Into<String>) -> Self {
        Self { publisher, project_id: project_id.into() }
    }

    /// Fully-qualified path for a topic under this adapter's project.
    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic)
    }
}

#[async_trait]
impl DeliveryAdapter for PubSubAdapter {
    fn kind(&self) -> TaskKind {
        TaskKind::PubSubNotify
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<DeliveryReceipt> {
        let Destination::PubSub { topic } = &envelope.destination else {
            return Err(DeliveryError::configuration(format!(
                "pubsub adapter cannot deliver to {:?}",
                envelope.destination.kind()
            )));
        };

        let topic_path = self.topic_path(topic);
        let span = info_span!(
            "pubsub_publish",
            envelope_id = %envelope.id,
            topic = %topic_path,
            attempt = envelope.attempt_count
        );

        async move {
            let data = serde_json::to_vec(&envelope.payload)
                .map_err(|e| DeliveryError::serialization(format!("payload encoding: {e}")))?;

            let start_time = std::time::Instant::now();
            self.publisher.publish(&topic_path, Bytes::from(data)).await?;

            let duration = start_time.elapsed();
            debug!(duration_ms = duration.as_millis(), "message published");
            Ok(DeliveryReceipt::published(duration))
        }
        .instrument(span)
        .await
    }
}

/// In-process publisher, the default when no broker is configured.
pub mod memory {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    /// Published message with its topic path.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PublishedMessage {
        /// Fully-qualified topic path the message went to.
        pub topic_path: String,
        /// Encoded message payload.
        pub data: Bytes,
    }

    /// Topic publisher that records messages in memory.
    ///
    /// Used both as the default transport and as a test double; tests
    /// can inject failures to exercise the broker-error path.
    #[derive(Debug, Default)]
    pub struct InMemoryPublisher {
        messages: Mutex<Vec<PublishedMessage>>,
        fail_topics: Mutex<HashMap<String, String>>,
    }

    impl InMemoryPublisher {
        /// Creates an empty publisher.
        pub fn new() -> Self {
            Self::default()
        }

        /// All messages published so far, in order.
        pub async fn published(&self) -> Vec<PublishedMessage> {
            self.messages.lock().await.clone()
        }

        /// Messages published to one topic path.
        pub async fn published_to(&self, topic_path: &str) -> Vec<PublishedMessage> {
            self.messages
                .lock()
                .await
                .iter()
                .filter(|m| m.topic_path == topic_path)
                .cloned()
                .collect()
        }

        /// Makes future publishes to `topic_path` fail with a broker
        /// error carrying `message`.
        pub async fn fail_topic(&self, topic_path: impl Into<String>, message: impl Into<String>) {
            self.fail_topics.lock().await.insert(topic_path.into(), message.into());
        }

        /// Clears an injected failure.
        pub async fn heal_topic(&self, topic_path: &str) {
            self.fail_topics.lock().await.remove(topic_path);
        }
    }

    #[async_trait]
    impl TopicPublisher for InMemoryPublisher {
        async fn publish(&self, topic_path: &str, data: Bytes) -> Result<()> {
            if let Some(message) = self.fail_topics.lock().await.get(topic_path) {
                return Err(DeliveryError::broker(message.clone()));
            }
            self.messages
                .lock()
                .await
                .push(PublishedMessage { topic_path: topic_path.to_string(), data });
            Ok(())
        }
    }
}
