//! Task envelope model and strongly-typed identifiers.
//!
//! An [`Envelope`] describes one unit of pending delivery work: an
//! immutable payload and destination plus the mutable retry bookkeeping
//! (attempt count, visibility time, status). Status transitions are
//! monotone and enforced here so that a terminal envelope can never be
//! re-dispatched.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Strongly-typed envelope identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned when the
/// producer creates the envelope and stable for its whole lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub Uuid);

impl EnvelopeId {
    /// Creates a new random envelope ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EnvelopeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Kind of delivery task an envelope represents.
///
/// Determines which adapter the worker pool looks up in the task
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// POST the event to an HTTP webhook endpoint.
    WebhookNotify,
    /// Publish the payload on a pub/sub topic.
    PubSubNotify,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebhookNotify => write!(f, "webhook_notify"),
            Self::PubSubNotify => write!(f, "pubsub_notify"),
        }
    }
}

/// Delivery destination, immutable once the envelope is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// HTTP webhook endpoint.
    Webhook {
        /// Target URL for the POST request.
        url: String,
        /// Caller-supplied headers, merged over adapter defaults.
        headers: HashMap<String, String>,
    },
    /// Pub/sub topic, resolved against the configured project at
    /// delivery time.
    PubSub {
        /// Short topic name (not the fully-qualified path).
        topic: String,
    },
}

impl Destination {
    /// Returns the task kind this destination requires.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Webhook { .. } => TaskKind::WebhookNotify,
            Self::PubSub { .. } => TaskKind::PubSubNotify,
        }
    }
}

/// Envelope lifecycle status.
///
/// Transitions are monotone: `Pending -> InFlight -> {Succeeded |
/// Pending (retry) | FailedPermanently}`. Terminal statuses are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Waiting in the queue (possibly behind a backoff delay).
    Pending,
    /// Leased by exactly one worker, delivery attempt in progress.
    InFlight,
    /// Delivered successfully. Terminal.
    Succeeded,
    /// Retries exhausted or failure was permanent. Terminal.
    FailedPermanently,
}

impl EnvelopeStatus {
    /// Returns true for statuses that end the envelope's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanently)
    }
}

/// One unit of pending delivery work.
///
/// Payload and destination are fixed at creation; only the retry
/// bookkeeping (`attempt_count`, `not_before`, `status`) mutates, and
/// only through the transition methods. The queue's lease mechanism
/// guarantees a single writer at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, assigned at creation.
    pub id: EnvelopeId,

    /// Event name included in the delivered webhook body. Absent for
    /// pub/sub envelopes.
    pub event_name: Option<String>,

    /// Opaque structured payload. Immutable after creation.
    pub payload: serde_json::Value,

    /// Where to deliver. Immutable after creation.
    pub destination: Destination,

    /// Number of delivery attempts started so far. Only increases.
    pub attempt_count: u32,

    /// Workers must not attempt delivery before this time.
    pub not_before: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: EnvelopeStatus,

    /// When the producer created this envelope.
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Creates a webhook delivery envelope.
    pub fn webhook(
        url: impl Into<String>,
        event_name: impl Into<String>,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            event_name: Some(event_name.into()),
            payload,
            destination: Destination::Webhook { url: url.into(), headers },
            attempt_count: 0,
            not_before: now,
            status: EnvelopeStatus::Pending,
            created_at: now,
        }
    }

    /// Creates a pub/sub delivery envelope.
    pub fn pubsub(
        topic: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            event_name: None,
            payload,
            destination: Destination::PubSub { topic: topic.into() },
            attempt_count: 0,
            not_before: now,
            status: EnvelopeStatus::Pending,
            created_at: now,
        }
    }

    /// Returns the task kind, derived from the destination.
    pub fn kind(&self) -> TaskKind {
        self.destination.kind()
    }

    /// Starts a delivery attempt: `Pending -> InFlight`.
    ///
    /// Increments `attempt_count`, so each dequeue counts as exactly one
    /// attempt (including redeliveries after a lease expiry).
    pub fn begin_attempt(&mut self) -> Result<()> {
        self.transition(EnvelopeStatus::Pending, EnvelopeStatus::InFlight)?;
        self.attempt_count += 1;
        Ok(())
    }

    /// Records a successful delivery: `InFlight -> Succeeded`.
    pub fn mark_succeeded(&mut self) -> Result<()> {
        self.transition(EnvelopeStatus::InFlight, EnvelopeStatus::Succeeded)
    }

    /// Records a permanent failure: `InFlight -> FailedPermanently`.
    pub fn mark_failed(&mut self) -> Result<()> {
        self.transition(EnvelopeStatus::InFlight, EnvelopeStatus::FailedPermanently)
    }

    /// Schedules a retry: `InFlight -> Pending` with an updated
    /// visibility time.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>) -> Result<()> {
        self.transition(EnvelopeStatus::InFlight, EnvelopeStatus::Pending)?;
        self.not_before = not_before;
        Ok(())
    }

    /// Returns the envelope to `Pending` after its lease expired.
    ///
    /// Used by the queue when a worker holding the lease never acked.
    /// The attempt count is left unchanged; the next `begin_attempt`
    /// accounts for the redelivery.
    pub fn reclaim(&mut self) -> Result<()> {
        self.transition(EnvelopeStatus::InFlight, EnvelopeStatus::Pending)
    }

    fn transition(&mut self, from: EnvelopeStatus, to: EnvelopeStatus) -> Result<()> {
        if self.status != from {
            return Err(CoreError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }
}
