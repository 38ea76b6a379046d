//! Adapter seam between the worker loop and concrete transports.
//!
//! Workers never know how an envelope reaches its destination; they
//! hand it to whatever [`DeliveryAdapter`] the registry maps to the
//! envelope's task kind and interpret the classified result.

use std::time::Duration;

use async_trait::async_trait;
use fanout_core::{Envelope, TaskKind};

use crate::error::Result;

/// Evidence of a completed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// HTTP status code, for adapters that speak HTTP.
    pub status_code: Option<u16>,
    /// Wall time the attempt took.
    pub duration: Duration,
}

impl DeliveryReceipt {
    /// Receipt for an HTTP delivery.
    pub fn http(status_code: u16, duration: Duration) -> Self {
        Self { status_code: Some(status_code), duration }
    }

    /// Receipt for a non-HTTP delivery.
    pub fn published(duration: Duration) -> Self {
        Self { status_code: None, duration }
    }
}

/// One destination protocol.
///
/// Implementations classify every failure into the [`DeliveryError`]
/// taxonomy; a returned error is the retry policy's only input, so a
/// misclassified error either retry-loops a permanent failure or drops
/// a transient one.
///
/// [`DeliveryError`]: crate::error::DeliveryError
#[async_trait]
pub trait DeliveryAdapter: Send + Sync + std::fmt::Debug {
    /// The task kind this adapter handles.
    fn kind(&self) -> TaskKind;

    /// Attempts to deliver one envelope to its destination.
    async fn deliver(&self, envelope: &Envelope) -> Result<DeliveryReceipt>;
}
