//! Error taxonomy for the Service Bus source.
//!
//! Errors fall into four groups with different consequences:
//!
//! | Error | Scope | Consequence |
//! |-------|-------|-------------|
//! | [`ConfigError`] | startup | fatal; the process never starts listening |
//! | [`ProcessingError`] | one message | message left for redelivery |
//! | [`SendError`] / [`ErrorBatch`] | one event | collected; message left for redelivery |
//! | [`HandleError::Acknowledgment`] | one message | broker rejected completion; surfaced |
//!
//! None of the per-message errors stop the listener. Only configuration errors
//! and termination of the broker connection do.

use thiserror::Error;

use crate::MessageId;

// ---------------------------------------------------------------------------
// Startup errors
// ---------------------------------------------------------------------------

/// Invalid configuration detected before the listener starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The resource identifier could not be parsed into its structured form.
    #[error("invalid resource ID {resource_id:?}: {reason}")]
    InvalidResourceId {
        /// The identifier as supplied.
        resource_id: String,
        /// What made it unparseable.
        reason: String,
    },

    /// The resource identifier parsed but does not name a queue or a topic
    /// subscription in a Service Bus namespace.
    #[error("resource ID {resource_id:?} does not refer to a Service Bus entity")]
    UnsupportedEntity {
        /// The identifier as supplied.
        resource_id: String,
    },

    /// The configured message processor name is not registered.
    #[error("unsupported message processor {name:?}")]
    UnknownProcessor {
        /// The configured name.
        name: String,
    },

    /// Any other invalid configuration value.
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Per-message errors
// ---------------------------------------------------------------------------

/// A message processor could not interpret a broker message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("processing Service Bus message with ID {message_id}: {reason}")]
pub struct ProcessingError {
    /// ID of the message that failed.
    pub message_id: MessageId,
    /// Human-readable cause.
    pub reason: String,
}

impl ProcessingError {
    /// Creates a [`ProcessingError`] for the given message.
    pub fn new(message_id: MessageId, reason: impl Into<String>) -> Self {
        Self {
            message_id,
            reason: reason.into(),
        }
    }
}

/// Failure reported by an [`crate::EventSender`] for a single event.
///
/// Anything other than a positive acknowledgment from the sink is a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The sink answered, but not with a success status.
    #[error("sink responded with status {status}")]
    Nack {
        /// HTTP status returned by the sink.
        status: u16,
    },

    /// The sink did not answer in time.
    #[error("timeout")]
    Timeout,

    /// The request never reached the sink, or the response was unreadable.
    #[error("{0}")]
    Transport(String),
}

impl SendError {
    /// Whether another delivery attempt could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Nack { status } => *status == 429 || *status >= 500,
            Self::Timeout | Self::Transport(_) => true,
        }
    }
}

/// One event that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to send event with ID {event_id}: {cause}")]
pub struct SendFailure {
    /// `id` attribute of the undelivered event.
    pub event_id: String,
    /// What the sender reported.
    pub cause: SendError,
}

/// Ordered collection of every [`SendFailure`] for one broker message.
///
/// An empty batch means every event derived from the message was acknowledged
/// by the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBatch(Vec<SendFailure>);

impl ErrorBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a failure, preserving dispatch order.
    pub fn push(&mut self, failure: SendFailure) {
        self.0.push(failure);
    }

    /// Returns `true` if no event failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failed events.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The failures in dispatch order.
    pub fn failures(&self) -> &[SendFailure] {
        &self.0
    }
}

impl std::fmt::Display for ErrorBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{rendered:?}")
    }
}

impl std::error::Error for ErrorBatch {}

impl FromIterator<SendFailure> for ErrorBatch {
    fn from_iter<T: IntoIterator<Item = SendFailure>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Failure reported by the message broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not serve the request right now; retrying later may work.
    #[error("broker request failed: {0}")]
    Transient(String),

    /// The broker refused the request in a way retrying cannot fix
    /// (authorization failure, entity not found, expired lock).
    #[error("broker rejected the request: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Returns `true` if the error cannot be resolved by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Outcome of handling one broker message, when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The message processor rejected the message. Nothing was sent.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// At least one derived event was not acknowledged by the sink.
    #[error("sending events to the sink: {0}")]
    Delivery(ErrorBatch),

    /// Every event was delivered but the broker refused the completion call.
    #[error("completing Service Bus message with ID {message_id}: {source}")]
    Acknowledgment {
        /// ID of the message whose completion failed.
        message_id: MessageId,
        /// Error returned by the completion handle.
        source: BrokerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, cause: SendError) -> SendFailure {
        SendFailure {
            event_id: id.to_string(),
            cause,
        }
    }

    #[test]
    fn test_error_batch_display_lists_every_failure_in_order() {
        let batch: ErrorBatch = vec![
            failure("a", SendError::Timeout),
            failure("b", SendError::Nack { status: 503 }),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            batch.to_string(),
            r#"["failed to send event with ID a: timeout", "failed to send event with ID b: sink responded with status 503"]"#
        );
    }

    #[test]
    fn test_empty_error_batch() {
        let batch = ErrorBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.to_string(), "[]");
    }

    #[test]
    fn test_send_error_retryability() {
        assert!(SendError::Timeout.is_retryable());
        assert!(SendError::Transport("connection reset".into()).is_retryable());
        assert!(SendError::Nack { status: 429 }.is_retryable());
        assert!(SendError::Nack { status: 502 }.is_retryable());
        assert!(!SendError::Nack { status: 400 }.is_retryable());
    }

    #[test]
    fn test_processing_error_mentions_message_id() {
        let id = MessageId::new("m1").unwrap();
        let err = ProcessingError::new(id, "body is not JSON");
        assert_eq!(
            err.to_string(),
            "processing Service Bus message with ID m1: body is not JSON"
        );
    }

    #[test]
    fn test_delivery_error_wraps_batch() {
        let batch: ErrorBatch = std::iter::once(failure("e2", SendError::Timeout)).collect();
        let err = HandleError::Delivery(batch);
        assert_eq!(
            err.to_string(),
            r#"sending events to the sink: ["failed to send event with ID e2: timeout"]"#
        );
    }
}
