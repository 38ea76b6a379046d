//! Worker loop: leases envelopes, runs adapters, applies retry policy.
//!
//! Each worker polls the queue for a batch, delivers every envelope
//! through its registered adapter, and settles the lease according to
//! the outcome. A failure of one envelope never affects the processing
//! of any other envelope or the worker itself.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use fanout_core::{
    AttemptStarted, Clock, DeliveryFailed, DeliverySucceeded, Observation, ObservationSink,
    RetryScheduled,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::DeliveryError,
    queue::{DispatchQueue, Lease},
    registry::TaskRegistry,
    retry::{RetryContext, RetryDecision, RetryPolicy},
};

/// Configuration for the delivery engine and its workers.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Maximum envelopes leased per poll.
    pub batch_size: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Ceiling on a single delivery attempt, independent of any
    /// adapter-internal timeout.
    pub delivery_timeout: Duration,
    /// Retry policy applied to failed attempts.
    pub retry_policy: RetryPolicy,
    /// How long graceful shutdown waits for in-flight work.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            delivery_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters shared by all workers of one engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

impl EngineStats {
    /// Envelopes finalized as succeeded.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Attempts that ended with a scheduled retry.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Envelopes finalized as permanently failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// One polling worker. Owned and spawned by the worker pool.
pub(crate) struct DeliveryWorker {
    worker_id: usize,
    queue: Arc<dyn DispatchQueue>,
    registry: TaskRegistry,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ObservationSink>,
    stats: Arc<EngineStats>,
}

impl DeliveryWorker {
    pub(crate) fn new(
        worker_id: usize,
        queue: Arc<dyn DispatchQueue>,
        registry: TaskRegistry,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ObservationSink>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self { worker_id, queue, registry, config, clock, sink, stats }
    }

    /// Runs the poll loop until cancellation.
    ///
    /// Cancellation is checked between batches, so envelopes already
    /// leased are settled before the worker exits.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        debug!(worker_id = self.worker_id, "worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let processed = self.process_batch().await;

            if processed == 0 {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.clock.sleep(self.config.poll_interval) => {},
                }
            }
        }

        debug!(worker_id = self.worker_id, "worker stopped");
    }

    /// Leases and processes one batch. Returns how many envelopes were
    /// handled.
    pub(crate) async fn process_batch(&self) -> usize {
        let leases = match self.queue.dequeue_batch(self.config.batch_size).await {
            Ok(leases) => leases,
            Err(error) => {
                warn!(worker_id = self.worker_id, error = %error, "dequeue failed");
                return 0;
            },
        };

        let count = leases.len();
        for lease in leases {
            self.process_envelope(lease).await;
        }
        count
    }

    /// Delivers one leased envelope and settles its lease.
    async fn process_envelope(&self, lease: Lease) {
        let envelope = lease.envelope().clone();

        self.sink
            .observe(Observation::AttemptStarted(AttemptStarted {
                envelope_id: envelope.id,
                kind: envelope.kind(),
                attempt_count: envelope.attempt_count,
                started_at: self.wall_now(),
            }))
            .await;

        let outcome = match self.registry.adapter_for(envelope.kind()) {
            Ok(adapter) => {
                match tokio::time::timeout(
                    self.config.delivery_timeout,
                    adapter.deliver(&envelope),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::timeout(self.config.delivery_timeout.as_secs())),
                }
            },
            Err(error) => Err(error),
        };

        match outcome {
            Ok(receipt) => {
                if let Err(error) = self.queue.ack(lease).await {
                    warn!(envelope_id = %envelope.id, error = %error, "ack failed");
                    return;
                }
                self.stats.record_delivered();
                self.sink
                    .observe(Observation::Succeeded(DeliverySucceeded {
                        envelope_id: envelope.id,
                        kind: envelope.kind(),
                        attempt_count: envelope.attempt_count,
                        status_code: receipt.status_code,
                        delivered_at: self.wall_now(),
                    }))
                    .await;
            },
            Err(error) => self.settle_failure(lease, &envelope, error).await,
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn settle_failure(
        &self,
        lease: Lease,
        envelope: &fanout_core::Envelope,
        error: DeliveryError,
    ) {
        let context = RetryContext::new(
            envelope.attempt_count,
            error.clone(),
            self.wall_now(),
            self.config.retry_policy.clone(),
        );

        match context.decide() {
            RetryDecision::Retry { after, next_attempt_at } => {
                if let Err(nack_error) = self.queue.nack(lease, after).await {
                    warn!(envelope_id = %envelope.id, error = %nack_error, "nack failed");
                    return;
                }
                self.stats.record_retried();
                self.sink
                    .observe(Observation::RetryScheduled(RetryScheduled {
                        envelope_id: envelope.id,
                        kind: envelope.kind(),
                        attempt_count: envelope.attempt_count,
                        error: error.to_string(),
                        next_attempt_at,
                    }))
                    .await;
            },
            RetryDecision::GiveUp { reason } => {
                if let Err(fail_error) = self.queue.fail(lease, &reason).await {
                    warn!(envelope_id = %envelope.id, error = %fail_error, "fail failed");
                    return;
                }
                self.stats.record_failed();
                self.sink
                    .observe(Observation::FailedPermanently(DeliveryFailed {
                        envelope_id: envelope.id,
                        kind: envelope.kind(),
                        attempt_count: envelope.attempt_count,
                        error: error.to_string(),
                        reason,
                        failed_at: self.wall_now(),
                    }))
                    .await;
            },
        }
    }

    fn wall_now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use fanout_core::{Envelope, EnvelopeStatus, NoOpSink, RealClock, TaskKind, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{
        adapter::{DeliveryAdapter, DeliveryReceipt},
        queue::{InMemoryQueue, InMemoryQueueConfig},
    };

    /// Adapter that fails a fixed number of times, then succeeds.
    #[derive(Debug)]
    struct FlakyAdapter {
        failures: AtomicU64,
        error: DeliveryError,
    }

    impl FlakyAdapter {
        fn new(failures: u64, error: DeliveryError) -> Self {
            Self { failures: AtomicU64::new(failures), error }
        }
    }

    #[async_trait::async_trait]
    impl DeliveryAdapter for FlakyAdapter {
        fn kind(&self) -> TaskKind {
            TaskKind::WebhookNotify
        }

        async fn deliver(&self, _envelope: &Envelope) -> crate::error::Result<DeliveryReceipt> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(DeliveryReceipt::http(200, Duration::ZERO))
        }
    }

    fn webhook_envelope(now: DateTime<Utc>) -> Envelope {
        Envelope::webhook(
            "https://example.com/hook",
            "order.created",
            json!({"id": 1}),
            HashMap::new(),
            now,
        )
    }

    fn clock_now(clock: &TestClock) -> DateTime<Utc> {
        DateTime::<Utc>::from(clock.now_system())
    }

    /// Sink that records every observation in order.
    #[derive(Debug, Default)]
    struct RecordingSink {
        observations: std::sync::Mutex<Vec<Observation>>,
    }

    impl RecordingSink {
        fn recorded(&self) -> Vec<Observation> {
            self.observations.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ObservationSink for RecordingSink {
        async fn observe(&self, observation: Observation) {
            self.observations.lock().unwrap().push(observation);
        }
    }

    fn worker_with(
        queue: Arc<dyn DispatchQueue>,
        adapter: Arc<dyn DeliveryAdapter>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> (DeliveryWorker, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::default());
        let worker = DeliveryWorker::new(
            0,
            queue,
            TaskRegistry::new().with_adapter(adapter),
            config,
            clock,
            Arc::new(NoOpSink::new()),
            stats.clone(),
        );
        (worker, stats)
    }

    fn no_jitter_config() -> DeliveryConfig {
        DeliveryConfig {
            retry_policy: RetryPolicy { jitter_factor: 0.0, ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_delivery_acks_and_counts() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(0, DeliveryError::network("unused")));
        let (worker, stats) = worker_with(queue.clone(), adapter, clock, no_jitter_config());

        let id = queue.enqueue(webhook_envelope(Utc::now())).await.unwrap();
        assert_eq!(worker.process_batch().await, 1);

        assert_eq!(stats.delivered(), 1);
        let envelope = queue.find_envelope(id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Succeeded);
        assert_eq!(envelope.attempt_count, 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_until_success() {
        let clock = Arc::new(TestClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(2, DeliveryError::server(500, "oops")));
        let (worker, stats) =
            worker_with(queue.clone(), adapter, clock.clone(), no_jitter_config());

        let id = queue.enqueue(webhook_envelope(clock_now(&clock))).await.unwrap();

        // Attempt 1 fails, retry in 1s. Attempt 2 fails, retry in 2s.
        // Attempt 3 succeeds.
        worker.process_batch().await;
        clock.advance(Duration::from_secs(2));
        worker.process_batch().await;
        clock.advance(Duration::from_secs(3));
        worker.process_batch().await;

        assert_eq!(stats.retried(), 2);
        assert_eq!(stats.delivered(), 1);
        let envelope = queue.find_envelope(id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Succeeded);
        assert_eq!(envelope.attempt_count, 3);
    }

    #[tokio::test]
    async fn permanent_failure_finalizes_without_retry() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(10, DeliveryError::client(400, "bad request")));
        let (worker, stats) = worker_with(queue.clone(), adapter, clock, no_jitter_config());

        let id = queue.enqueue(webhook_envelope(Utc::now())).await.unwrap();
        worker.process_batch().await;

        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.retried(), 0);
        let envelope = queue.find_envelope(id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::FailedPermanently);
        assert_eq!(envelope.attempt_count, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let clock = Arc::new(TestClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(100, DeliveryError::server(500, "oops")));
        let config = DeliveryConfig {
            retry_policy: RetryPolicy {
                max_attempts: 3,
                jitter_factor: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let (worker, stats) = worker_with(queue.clone(), adapter, clock.clone(), config);

        let id = queue.enqueue(webhook_envelope(clock_now(&clock))).await.unwrap();
        for _ in 0..5 {
            worker.process_batch().await;
            clock.advance(Duration::from_secs(10));
        }

        assert_eq!(stats.retried(), 2);
        assert_eq!(stats.failed(), 1);
        let envelope = queue.find_envelope(id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::FailedPermanently);
        assert_eq!(envelope.attempt_count, 3);
    }

    #[tokio::test]
    async fn each_decision_emits_one_observation_with_matching_attempt() {
        let clock = Arc::new(TestClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(1, DeliveryError::server(500, "oops")));
        let sink = Arc::new(RecordingSink::default());
        let worker = DeliveryWorker::new(
            0,
            queue.clone(),
            TaskRegistry::new().with_adapter(adapter),
            no_jitter_config(),
            clock.clone(),
            sink.clone(),
            Arc::new(EngineStats::default()),
        );

        queue.enqueue(webhook_envelope(clock_now(&clock))).await.unwrap();
        worker.process_batch().await;
        clock.advance(Duration::from_secs(2));
        worker.process_batch().await;

        let observations = sink.recorded();
        assert_eq!(observations.len(), 4);
        assert!(
            matches!(&observations[0], Observation::AttemptStarted(o) if o.attempt_count == 1)
        );
        assert!(
            matches!(&observations[1], Observation::RetryScheduled(o) if o.attempt_count == 1)
        );
        assert!(
            matches!(&observations[2], Observation::AttemptStarted(o) if o.attempt_count == 2)
        );
        assert!(matches!(
            &observations[3],
            Observation::Succeeded(o) if o.attempt_count == 2 && o.status_code == Some(200)
        ));
    }

    #[tokio::test]
    async fn permanent_failure_emits_one_terminal_observation() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let adapter = Arc::new(FlakyAdapter::new(10, DeliveryError::client(400, "bad request")));
        let sink = Arc::new(RecordingSink::default());
        let worker = DeliveryWorker::new(
            0,
            queue.clone(),
            TaskRegistry::new().with_adapter(adapter),
            no_jitter_config(),
            clock,
            sink.clone(),
            Arc::new(EngineStats::default()),
        );

        queue.enqueue(webhook_envelope(Utc::now())).await.unwrap();
        worker.process_batch().await;

        let observations = sink.recorded();
        assert_eq!(observations.len(), 2);
        assert!(
            matches!(&observations[0], Observation::AttemptStarted(o) if o.attempt_count == 1)
        );
        assert!(
            matches!(&observations[1], Observation::FailedPermanently(o) if o.attempt_count == 1)
        );
    }

    #[tokio::test]
    async fn missing_adapter_is_finalized_not_retried() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));
        let stats = Arc::new(EngineStats::default());
        let worker = DeliveryWorker::new(
            0,
            queue.clone(),
            TaskRegistry::new(), // nothing registered
            no_jitter_config(),
            clock,
            Arc::new(NoOpSink::new()),
            stats.clone(),
        );

        let id = queue.enqueue(webhook_envelope(Utc::now())).await.unwrap();
        worker.process_batch().await;

        assert_eq!(stats.failed(), 1);
        let envelope = queue.find_envelope(id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::FailedPermanently);
    }

    #[tokio::test]
    async fn one_bad_envelope_does_not_block_the_batch() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));

        /// Fails only envelopes whose event name says so.
        #[derive(Debug)]
        struct SelectiveAdapter;

        #[async_trait::async_trait]
        impl DeliveryAdapter for SelectiveAdapter {
            fn kind(&self) -> TaskKind {
                TaskKind::WebhookNotify
            }

            async fn deliver(
                &self,
                envelope: &Envelope,
            ) -> crate::error::Result<DeliveryReceipt> {
                if envelope.event_name.as_deref() == Some("poison") {
                    return Err(DeliveryError::client(422, "rejected"));
                }
                Ok(DeliveryReceipt::http(200, Duration::ZERO))
            }
        }

        let (worker, stats) =
            worker_with(queue.clone(), Arc::new(SelectiveAdapter), clock, no_jitter_config());

        let poison = Envelope::webhook(
            "https://example.com/hook",
            "poison",
            json!({}),
            HashMap::new(),
            Utc::now(),
        );
        let poison_id = queue.enqueue(poison).await.unwrap();
        let healthy_id = queue.enqueue(webhook_envelope(Utc::now())).await.unwrap();

        worker.process_batch().await;

        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.delivered(), 1);
        assert_eq!(
            queue.find_envelope(poison_id).await.unwrap().unwrap().status,
            EnvelopeStatus::FailedPermanently
        );
        assert_eq!(
            queue.find_envelope(healthy_id).await.unwrap().unwrap().status,
            EnvelopeStatus::Succeeded
        );
    }
}
