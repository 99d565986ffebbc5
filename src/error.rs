//! Error types for triggerhub.
//!
//! All errors are strongly typed using thiserror. Per-event and
//! per-subscription failures are contained where they happen; these types
//! surface at the registration boundary, the delivery pool and the transport.

use thiserror::Error;

/// Validation errors raised while accepting a registration or an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Listener id cannot be empty")]
    EmptyListenerId,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid base address '{address}': {reason}")]
    InvalidBaseAddress {
        address: String,
        reason: String,
    },

    #[error("Pattern kind '{kind}' requires a value")]
    MissingPatternValue {
        kind: String,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },
}

/// Failures of a single outbound delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Delivery request to {url} failed: {message}")]
    Request {
        url: String,
        message: String,
    },

    #[error("Delivery to {url} returned status {status}")]
    Status {
        url: String,
        status: u16,
    },

    #[error("Delivery to {url} timed out")]
    Timeout {
        url: String,
    },
}

/// Execution errors inside the hub runtime.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Queue '{queue}' is full")]
    QueueFull {
        queue: String,
    },

    #[error("Channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Failed to spawn {what}: {message}")]
    Spawn {
        what: String,
        message: String,
    },
}

/// Frame encoding errors of the gRPC transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to serialize payload: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize payload: {message}")]
    DeserializationFailed {
        message: String,
    },

    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        size: usize,
        limit: usize,
    },
}

/// Top-level error type for triggerhub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HubError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the caller may reasonably retry the same request.
    ///
    /// Only a full queue is transient; everything else fails the same way again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::QueueFull { .. }))
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;
