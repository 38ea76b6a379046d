//! Error taxonomy for delivery operations.
//!
//! Every adapter failure is classified here so the retry policy can
//! decide between backing off and finalizing. Adapter errors never
//! escape the worker loop; only broker failures at submit time reach
//! the producer.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure classifications for delivery attempts and engine lifecycle.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure. Retryable.
    #[error("network connection failed: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// Delivery attempt exceeded its timeout. Retryable.
    #[error("delivery timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout that was exceeded, in seconds.
        timeout_seconds: u64,
    },

    /// HTTP 4xx other than 429. Permanent: retrying a client error
    /// cannot succeed and would retry-loop a poison-pill event.
    #[error("client error: HTTP {status_code}")]
    Client {
        /// HTTP status code (4xx).
        status_code: u16,
        /// Response body content.
        body: String,
    },

    /// HTTP 429. Retryable, honoring a Retry-After hint when present.
    #[error("rate limited")]
    RateLimited {
        /// Seconds to wait, from the Retry-After header if parseable.
        retry_after_seconds: Option<u64>,
    },

    /// HTTP 5xx. Retryable.
    #[error("server error: HTTP {status_code}")]
    Server {
        /// HTTP status code (5xx).
        status_code: u16,
        /// Response body content.
        body: String,
    },

    /// Payload could not be encoded. Permanent; surfaced to the
    /// producer at submit time when detectable.
    #[error("payload serialization failed: {message}")]
    Serialization {
        /// Description of the encoding failure.
        message: String,
    },

    /// Queue or publish transport unavailable. Retryable in the worker;
    /// surfaced synchronously from `submit_*`.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the transport failure.
        message: String,
    },

    /// No adapter registered for the envelope's task kind. Permanent.
    #[error("no adapter registered for task kind {kind}")]
    AdapterNotRegistered {
        /// The unhandled task kind.
        kind: String,
    },

    /// Invalid adapter or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error description.
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Identifier of the panicked worker.
        worker_id: usize,
        /// Panic description from the join error.
        message: String,
    },

    /// Graceful shutdown did not finish within the allowed time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded.
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client(status_code: u16, body: impl Into<String>) -> Self {
        Self::Client { status_code, body: body.into() }
    }

    /// Creates a rate-limited error with an optional Retry-After hint.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a server error from an HTTP response.
    pub fn server(status_code: u16, body: impl Into<String>) -> Self {
        Self::Server { status_code, body: body.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a broker transport error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the retry policy should be consulted for this failure.
    ///
    /// Network trouble, timeouts, 5xx, 429, and broker outages are
    /// transient. Client errors, serialization failures, and missing
    /// adapters cannot be fixed by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Broker { .. } => true,

            Self::Client { .. }
            | Self::Serialization { .. }
            | Self::AdapterNotRegistered { .. }
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Retry delay requested by the failure itself, if any.
    ///
    /// Only rate limits carry one; everything else uses the policy's
    /// exponential backoff.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }
}
