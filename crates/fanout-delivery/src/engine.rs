//! Fan-out engine: the producer-facing surface.
//!
//! Producers call `submit_*` and get an envelope id back immediately;
//! delivery happens on the worker pool. Submission only fails when the
//! queue transport rejects the envelope, never because a destination
//! is down.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use fanout_core::{Clock, Envelope, EnvelopeId, NoOpSink, ObservationSink, RealClock};
use tracing::info;

use crate::{
    error::{DeliveryError, Result},
    queue::{DispatchQueue, QueueDepth},
    registry::TaskRegistry,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
    worker_pool::WorkerPool,
};

/// Asynchronous event fan-out engine.
///
/// Owns the queue, the adapter registry, and the worker pool. The
/// queue outlives the pool, so a stop/start cycle delivers everything
/// submitted in between.
pub struct FanoutEngine {
    queue: Arc<dyn DispatchQueue>,
    registry: TaskRegistry,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ObservationSink>,
    stats: Arc<EngineStats>,
    pool: Option<WorkerPool>,
}

impl FanoutEngine {
    /// Creates an engine over the given queue and adapters. Workers do
    /// not run until [`start`](Self::start) is called.
    pub fn new(
        queue: Arc<dyn DispatchQueue>,
        registry: TaskRegistry,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            clock: Arc::new(RealClock::new()),
            sink: Arc::new(NoOpSink::new()),
            stats: Arc::new(EngineStats::default()),
            pool: None,
        }
    }

    /// Replaces the clock. Must be called before [`start`](Self::start).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the observation sink. Must be called before
    /// [`start`](Self::start).
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ObservationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Queues a webhook notification and returns its envelope id.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty URL and `Broker` when the
    /// queue rejects the envelope.
    pub async fn submit_webhook_notification(
        &self,
        url: impl Into<String>,
        event_name: impl Into<String>,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> Result<EnvelopeId> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(DeliveryError::configuration("webhook url must not be empty"));
        }

        let envelope = Envelope::webhook(url, event_name, payload, headers, self.wall_now());
        self.queue.enqueue(envelope).await
    }

    /// Queues a pub/sub notification and returns its envelope id.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty topic and `Broker` when
    /// the queue rejects the envelope.
    pub async fn submit_pubsub_notification(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<EnvelopeId> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(DeliveryError::configuration("pubsub topic must not be empty"));
        }

        let envelope = Envelope::pubsub(topic, payload, self.wall_now());
        self.queue.enqueue(envelope).await
    }

    /// Starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the pool is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Err(DeliveryError::configuration("engine already started"));
        }

        let workers = (0..self.config.worker_count)
            .map(|worker_id| {
                DeliveryWorker::new(
                    worker_id,
                    self.queue.clone(),
                    self.registry.clone(),
                    self.config.clone(),
                    self.clock.clone(),
                    self.sink.clone(),
                    self.stats.clone(),
                )
            })
            .collect();

        self.pool = Some(WorkerPool::spawn(workers, self.config.shutdown_timeout));
        info!(worker_count = self.config.worker_count, "fanout engine started");
        Ok(())
    }

    /// Stops the worker pool, waiting for in-flight deliveries.
    ///
    /// Queued envelopes stay queued; a later [`start`](Self::start)
    /// resumes them.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers had to be aborted.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.pool.take() {
            Some(pool) => pool.shutdown_graceful().await,
            None => Ok(()),
        }
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.pool.is_some()
    }

    /// Shared delivery counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Current queue population.
    ///
    /// # Errors
    ///
    /// Returns `Broker` when the queue transport fails.
    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        self.queue.depth().await
    }

    /// Looks up an envelope, including recently finalized ones.
    ///
    /// # Errors
    ///
    /// Returns `Broker` when the queue transport fails.
    pub async fn find_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>> {
        self.queue.find_envelope(id).await
    }

    fn wall_now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }
}
