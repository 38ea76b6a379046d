//! Error types for core domain operations.
//!
//! Covers envelope state-machine violations and producer input problems.
//! Delivery-time failures (network, HTTP, broker) live in the delivery
//! crate; this crate only knows about the domain model itself.

use thiserror::Error;

use crate::models::EnvelopeStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain model operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// An envelope status transition violated the monotone state machine.
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Status the envelope was in.
        from: EnvelopeStatus,
        /// Status the caller tried to move it to.
        to: EnvelopeStatus,
    },

    /// Producer-supplied input was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let error = CoreError::InvalidTransition {
            from: EnvelopeStatus::Succeeded,
            to: EnvelopeStatus::InFlight,
        };
        let rendered = error.to_string();
        assert!(rendered.contains("Succeeded"));
        assert!(rendered.contains("InFlight"));
    }
}
