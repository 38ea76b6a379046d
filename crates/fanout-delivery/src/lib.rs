//! Asynchronous fan-out delivery: queue, retry policy, adapters, and
//! worker pool.
//!
//! Producers submit notifications through [`FanoutEngine`] and get an
//! [`EnvelopeId`] back immediately; a pool of workers leases envelopes
//! from the [`DispatchQueue`], delivers them through per-kind
//! [`DeliveryAdapter`]s, and applies the [`RetryPolicy`] to failures.
//! Delivery is at-least-once: an unacknowledged lease expires and the
//! envelope becomes visible again.
//!
//! ```no_run
//! use std::{collections::HashMap, sync::Arc};
//!
//! use fanout_core::RealClock;
//! use fanout_delivery::{
//!     DeliveryConfig, FanoutEngine, InMemoryQueue, InMemoryQueueConfig, TaskRegistry,
//!     WebhookAdapter,
//! };
//!
//! # async fn run() -> fanout_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock));
//! let registry = TaskRegistry::new().with_adapter(Arc::new(WebhookAdapter::with_defaults()?));
//!
//! let mut engine = FanoutEngine::new(queue, registry, DeliveryConfig::default());
//! engine.start()?;
//!
//! engine
//!     .submit_webhook_notification(
//!         "https://example.com/hooks",
//!         "user.registered",
//!         serde_json::json!({"user_id": 42}),
//!         HashMap::new(),
//!     )
//!     .await?;
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod engine;
pub mod error;
pub mod pubsub;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod webhook;
pub mod worker;
pub mod worker_pool;

pub use adapter::{DeliveryAdapter, DeliveryReceipt};
pub use engine::FanoutEngine;
pub use error::{DeliveryError, Result};
pub use fanout_core::EnvelopeId;
pub use pubsub::{memory::InMemoryPublisher, PubSubAdapter, TopicPublisher};
pub use queue::{DispatchQueue, InMemoryQueue, InMemoryQueueConfig, Lease, QueueDepth};
pub use registry::TaskRegistry;
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use webhook::{WebhookAdapter, WebhookConfig};
pub use worker::{DeliveryConfig, EngineStats};
pub use worker_pool::WorkerPool;
