//! Observation hook for delivery outcomes.
//!
//! The worker pool emits an [`Observation`] for every retry decision and
//! every terminal outcome. Surrounding systems subscribe through the
//! [`ObservationSink`] trait without the delivery loop knowing who is
//! listening. This replaces bare error printing with structured,
//! fan-out-able reporting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EnvelopeId, TaskKind};

/// Observations emitted by the delivery system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Observation {
    /// A worker started a delivery attempt.
    AttemptStarted(AttemptStarted),
    /// Delivery succeeded. Terminal.
    Succeeded(DeliverySucceeded),
    /// Delivery failed and a retry was scheduled.
    RetryScheduled(RetryScheduled),
    /// Delivery failed permanently. Terminal.
    FailedPermanently(DeliveryFailed),
}

impl Observation {
    /// Envelope this observation is about.
    pub fn envelope_id(&self) -> EnvelopeId {
        match self {
            Self::AttemptStarted(o) => o.envelope_id,
            Self::Succeeded(o) => o.envelope_id,
            Self::RetryScheduled(o) => o.envelope_id,
            Self::FailedPermanently(o) => o.envelope_id,
        }
    }
}

/// Emitted when a worker begins a delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStarted {
    /// Envelope being delivered.
    pub envelope_id: EnvelopeId,
    /// Kind of delivery task.
    pub kind: TaskKind,
    /// Attempt number (1-based).
    pub attempt_count: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
}

/// Emitted when a delivery attempt succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceeded {
    /// Envelope that was delivered.
    pub envelope_id: EnvelopeId,
    /// Kind of delivery task.
    pub kind: TaskKind,
    /// Attempt number that succeeded (1-based).
    pub attempt_count: u32,
    /// HTTP status code, when the adapter produced one.
    pub status_code: Option<u16>,
    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when a failed attempt is scheduled for retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryScheduled {
    /// Envelope that failed.
    pub envelope_id: EnvelopeId,
    /// Kind of delivery task.
    pub kind: TaskKind,
    /// Attempt number that failed (1-based).
    pub attempt_count: u32,
    /// Error detail from the failed attempt.
    pub error: String,
    /// When the next attempt becomes visible.
    pub next_attempt_at: DateTime<Utc>,
}

/// Emitted when an envelope is finalized as permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailed {
    /// Envelope that failed.
    pub envelope_id: EnvelopeId,
    /// Kind of delivery task.
    pub kind: TaskKind,
    /// Attempt count when the envelope was finalized.
    pub attempt_count: u32,
    /// Error detail from the final attempt.
    pub error: String,
    /// Why the retry policy gave up.
    pub reason: String,
    /// When the envelope was finalized.
    pub failed_at: DateTime<Utc>,
}

/// Receives delivery observations.
///
/// Implementations must not block delivery processing; failures in a
/// sink are the sink's problem and are never propagated back into the
/// worker loop.
#[async_trait::async_trait]
pub trait ObservationSink: Send + Sync + std::fmt::Debug {
    /// Handles one observation.
    async fn observe(&self, observation: Observation);
}

/// Sink that discards all observations.
#[derive(Debug, Default)]
pub struct NoOpSink;

impl NoOpSink {
    /// Creates a new no-op sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ObservationSink for NoOpSink {
    async fn observe(&self, _observation: Observation) {}
}

/// Sink that logs observations through `tracing`.
///
/// Terminal failures log at error level so alerting can key off them;
/// retries at warn; successes at info.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    /// Creates a new tracing sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ObservationSink for TracingSink {
    async fn observe(&self, observation: Observation) {
        match observation {
            Observation::AttemptStarted(o) => {
                tracing::debug!(
                    envelope_id = %o.envelope_id,
                    kind = %o.kind,
                    attempt = o.attempt_count,
                    "delivery attempt started"
                );
            },
            Observation::Succeeded(o) => {
                tracing::info!(
                    envelope_id = %o.envelope_id,
                    kind = %o.kind,
                    attempt = o.attempt_count,
                    status_code = o.status_code,
                    "delivery succeeded"
                );
            },
            Observation::RetryScheduled(o) => {
                tracing::warn!(
                    envelope_id = %o.envelope_id,
                    kind = %o.kind,
                    attempt = o.attempt_count,
                    error = %o.error,
                    next_attempt_at = %o.next_attempt_at,
                    "delivery failed, retry scheduled"
                );
            },
            Observation::FailedPermanently(o) => {
                tracing::error!(
                    envelope_id = %o.envelope_id,
                    kind = %o.kind,
                    attempt = o.attempt_count,
                    error = %o.error,
                    reason = %o.reason,
                    "delivery permanently failed"
                );
            },
        }
    }
}

/// Sink that forwards observations to multiple subscribers.
///
/// Subscribers are registered at startup; observations are delivered to
/// all of them concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastSink {
    sinks: Vec<Arc<dyn ObservationSink>>,
}

impl MulticastSink {
    /// Creates a multicast sink with no subscribers.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, sink: Arc<dyn ObservationSink>) {
        self.sinks.push(sink);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait::async_trait]
impl ObservationSink for MulticastSink {
    async fn observe(&self, observation: Observation) {
        let futures = self.sinks.iter().map(|sink| {
            let observation = observation.clone();
            async move {
                sink.observe(observation).await;
            }
        });
        futures::future::join_all(futures).await;
    }
}
