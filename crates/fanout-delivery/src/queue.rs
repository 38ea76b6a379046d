//! Dispatch queue: the holding area between producers and workers.
//!
//! The [`DispatchQueue`] trait is the seam between the engine and the
//! queue transport. Envelopes are handed to workers under a [`Lease`],
//! a temporary exclusive claim that expires if the worker never
//! acknowledges it, making delivery at-least-once: a crashed worker's
//! envelopes become visible again instead of being lost.
//!
//! [`InMemoryQueue`] is the default backend. Durable broker-backed
//! queues implement the same trait and are selected through the
//! `broker_backend` configuration.

use std::{
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanout_core::{Clock, Envelope, EnvelopeId, EnvelopeStatus};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Temporary exclusive claim on one envelope.
///
/// Exactly one worker holds a lease at any instant; the queue's lease
/// table is the mutual-exclusion primitive, no extra locking needed.
/// Consuming the lease via `ack`/`nack`/`fail` ends the claim.
#[derive(Debug)]
pub struct Lease {
    token: Uuid,
    envelope: Envelope,
}

impl Lease {
    /// The leased envelope, snapshotted at dequeue time (after the
    /// attempt count was incremented).
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Opaque lease token.
    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// Queue population counts by status, for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Envelopes waiting (including those behind a backoff delay).
    pub pending: usize,
    /// Envelopes currently leased to workers.
    pub in_flight: usize,
    /// Delivered envelopes still inside the retention window.
    pub succeeded: usize,
    /// Permanently failed envelopes still inside the retention window.
    pub failed: usize,
}

/// Queue contract between the engine, workers, and the transport.
#[async_trait]
pub trait DispatchQueue: Send + Sync + 'static {
    /// Adds an envelope. Must survive a worker-pool restart.
    async fn enqueue(&self, envelope: Envelope) -> Result<EnvelopeId>;

    /// Leases up to `max_n` ready envelopes.
    ///
    /// Only envelopes whose `not_before` has passed are returned. An
    /// empty vec means no work is ready; callers poll. Expired leases
    /// are reclaimed before new ones are handed out.
    async fn dequeue_batch(&self, max_n: usize) -> Result<Vec<Lease>>;

    /// Finalizes a delivered envelope as `Succeeded`.
    async fn ack(&self, lease: Lease) -> Result<()>;

    /// Returns a failed envelope to `Pending`, visible again after
    /// `retry_after`.
    async fn nack(&self, lease: Lease, retry_after: Duration) -> Result<()>;

    /// Finalizes an envelope as `FailedPermanently`. It will never be
    /// dequeued again.
    async fn fail(&self, lease: Lease, reason: &str) -> Result<()>;

    /// Current population counts.
    async fn depth(&self) -> Result<QueueDepth>;

    /// Looks up an envelope by id, including finalized ones still in
    /// the retention window.
    async fn find_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>>;
}

/// Configuration for the in-memory queue backend.
#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// How long a lease stays valid before the envelope is reclaimed.
    pub lease_timeout: Duration,
    /// How long finalized envelopes remain queryable before pruning.
    pub retention: Duration,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self { lease_timeout: Duration::from_secs(30), retention: Duration::from_secs(300) }
    }
}

/// Entry in the backoff schedule, ordered earliest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledEnvelope {
    not_before: DateTime<Utc>,
    id: EnvelopeId,
}

impl PartialOrd for ScheduledEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEnvelope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so BinaryHeap pops the earliest time first.
        other.not_before.cmp(&self.not_before)
    }
}

#[derive(Debug)]
struct InFlightEntry {
    envelope_id: EnvelopeId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// All live envelopes, keyed by id. Single source of truth.
    envelopes: HashMap<EnvelopeId, Envelope>,
    /// Envelope ids ready for immediate dequeue, FIFO-ish.
    ready: VecDeque<EnvelopeId>,
    /// Envelopes waiting out a backoff delay.
    scheduled: BinaryHeap<ScheduledEnvelope>,
    /// Active leases by token.
    in_flight: HashMap<Uuid, InFlightEntry>,
    /// Finalized envelopes with their finalization time, oldest first.
    finished: VecDeque<(EnvelopeId, DateTime<Utc>)>,
}

impl QueueState {
    /// Moves envelopes whose lease expired back to the ready queue.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            let Some(entry) = self.in_flight.remove(&token) else { continue };
            if let Some(envelope) = self.envelopes.get_mut(&entry.envelope_id) {
                if envelope.reclaim().is_ok() {
                    warn!(
                        envelope_id = %entry.envelope_id,
                        attempt = envelope.attempt_count,
                        "lease expired, envelope visible for redelivery"
                    );
                    self.ready.push_back(entry.envelope_id);
                }
            }
        }
    }

    /// Moves scheduled envelopes whose backoff has elapsed to ready.
    fn promote_scheduled(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.not_before > now {
                break; // heap is ordered, nothing later is due
            }
            let entry = self.scheduled.pop().expect("peeked entry exists");
            let due = self
                .envelopes
                .get(&entry.id)
                .is_some_and(|e| e.status == EnvelopeStatus::Pending);
            if due {
                self.ready.push_back(entry.id);
            }
        }
    }

    /// Drops finalized envelopes older than the retention window.
    fn prune_finished(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        while let Some((id, finalized_at)) = self.finished.front() {
            if *finalized_at > cutoff {
                break;
            }
            self.envelopes.remove(id);
            self.finished.pop_front();
        }
    }

    fn counts(&self) -> QueueDepth {
        let mut depth = QueueDepth::default();
        for envelope in self.envelopes.values() {
            match envelope.status {
                EnvelopeStatus::Pending => depth.pending += 1,
                EnvelopeStatus::InFlight => depth.in_flight += 1,
                EnvelopeStatus::Succeeded => depth.succeeded += 1,
                EnvelopeStatus::FailedPermanently => depth.failed += 1,
            }
        }
        depth
    }
}

/// In-memory queue backend.
///
/// Concurrency-safe by construction: all state sits behind one mutex
/// and leases are the only handle workers get. Durability is scoped to
/// the process; the queue is owned by the engine, not the worker pool,
/// so enqueued work survives pool restarts.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    config: InMemoryQueueConfig,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new(config: InMemoryQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(QueueState::default()), config, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<EnvelopeId> {
        if envelope.status != EnvelopeStatus::Pending {
            return Err(DeliveryError::broker(format!(
                "cannot enqueue envelope in status {:?}",
                envelope.status
            )));
        }

        let id = envelope.id;
        let now = self.now();
        let mut state = self.state.lock().await;

        if state.envelopes.contains_key(&id) {
            return Err(DeliveryError::broker(format!("envelope {id} already enqueued")));
        }

        if envelope.not_before > now {
            state
                .scheduled
                .push(ScheduledEnvelope { not_before: envelope.not_before, id });
        } else {
            state.ready.push_back(id);
        }
        state.envelopes.insert(id, envelope);

        debug!(envelope_id = %id, "envelope enqueued");
        Ok(id)
    }

    async fn dequeue_batch(&self, max_n: usize) -> Result<Vec<Lease>> {
        let now = self.now();
        let mut state = self.state.lock().await;

        state.reclaim_expired(now);
        state.promote_scheduled(now);

        let mut leases = Vec::new();
        while leases.len() < max_n {
            let Some(id) = state.ready.pop_front() else { break };
            let Some(envelope) = state.envelopes.get_mut(&id) else { continue };

            // Each dequeue is one delivery attempt.
            if let Err(error) = envelope.begin_attempt() {
                warn!(envelope_id = %id, error = %error, "skipping undeliverable envelope");
                continue;
            }

            let token = Uuid::new_v4();
            let snapshot = envelope.clone();
            let expires_at = now
                + chrono::Duration::from_std(self.config.lease_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            state.in_flight.insert(token, InFlightEntry { envelope_id: id, expires_at });
            leases.push(Lease { token, envelope: snapshot });
        }

        Ok(leases)
    }

    async fn ack(&self, lease: Lease) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let Some(entry) = state.in_flight.remove(&lease.token) else {
            // Lease already expired: the envelope was (or will be)
            // redelivered. At-least-once allows the duplicate.
            warn!(envelope_id = %lease.envelope.id, "ack on expired lease ignored");
            return Ok(());
        };

        if let Some(envelope) = state.envelopes.get_mut(&entry.envelope_id) {
            envelope
                .mark_succeeded()
                .map_err(|e| DeliveryError::broker(format!("ack failed: {e}")))?;
        }
        state.finished.push_back((entry.envelope_id, now));
        state.prune_finished(now, self.config.retention);
        Ok(())
    }

    async fn nack(&self, lease: Lease, retry_after: Duration) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let Some(entry) = state.in_flight.remove(&lease.token) else {
            warn!(envelope_id = %lease.envelope.id, "nack on expired lease ignored");
            return Ok(());
        };

        let not_before = now
            + chrono::Duration::from_std(retry_after)
                .unwrap_or_else(|_| chrono::Duration::zero());

        if let Some(envelope) = state.envelopes.get_mut(&entry.envelope_id) {
            envelope
                .schedule_retry(not_before)
                .map_err(|e| DeliveryError::broker(format!("nack failed: {e}")))?;
            state
                .scheduled
                .push(ScheduledEnvelope { not_before, id: entry.envelope_id });
        }
        Ok(())
    }

    async fn fail(&self, lease: Lease, reason: &str) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let Some(entry) = state.in_flight.remove(&lease.token) else {
            warn!(envelope_id = %lease.envelope.id, "fail on expired lease ignored");
            return Ok(());
        };

        if let Some(envelope) = state.envelopes.get_mut(&entry.envelope_id) {
            envelope
                .mark_failed()
                .map_err(|e| DeliveryError::broker(format!("fail failed: {e}")))?;
            debug!(envelope_id = %entry.envelope_id, reason, "envelope finalized as failed");
        }
        state.finished.push_back((entry.envelope_id, now));
        state.prune_finished(now, self.config.retention);
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        Ok(self.state.lock().await.counts())
    }

    async fn find_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>> {
        Ok(self.state.lock().await.envelopes.get(&id).cloned())
    }
}
