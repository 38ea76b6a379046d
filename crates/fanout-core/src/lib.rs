//! Core domain types for the fanout event-delivery system.
//!
//! Provides the task envelope model, the observation hook for delivery
//! outcomes, error types, and the clock abstraction. The delivery crate
//! builds on these foundational types; producers only ever see the
//! envelope identifiers defined here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod observe;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Destination, Envelope, EnvelopeId, EnvelopeStatus, TaskKind};
pub use observe::{
    AttemptStarted, DeliveryFailed, DeliverySucceeded, MulticastSink, NoOpSink, Observation,
    ObservationSink, RetryScheduled, TracingSink,
};
pub use time::{Clock, RealClock, TestClock};
