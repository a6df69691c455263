//! Delivery of events to the sink.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{sanitize, ErrorBatch, EventEnvelope, SendError, SendFailure};

/// Delivers one event to the downstream receiver.
///
/// `Ok(())` means the sink positively acknowledged the event. Retry and
/// back-off, if any, happen inside the implementation. Implementations are
/// shared by every concurrent message handler.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, event: &EventEnvelope) -> Result<(), SendError>;
}

/// Validates, sanitizes and sends the events derived from one message.
#[derive(Clone)]
pub struct Dispatcher {
    sender: Arc<dyn EventSender>,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn EventSender>) -> Self {
        Self { sender }
    }

    /// Sends every event in order and collects the failures.
    ///
    /// An event that fails validation is sanitized once and sent regardless of
    /// whether the fix was sufficient. A failed send does not stop the
    /// remaining events from being sent.
    pub async fn dispatch(&self, events: Vec<EventEnvelope>) -> ErrorBatch {
        let mut errors = ErrorBatch::new();

        for event in events {
            let event = match event.validate() {
                Ok(()) => event,
                Err(failure) => {
                    debug!(event_id = %event.id, %failure, "event failed validation, sanitizing");
                    sanitize(&failure, event)
                }
            };

            if let Err(cause) = self.sender.send(&event).await {
                warn!(event_id = %event.id, error = %cause, "failed to send event");
                errors.push(SendFailure {
                    event_id: event.id,
                    cause,
                });
            }
        }

        errors
    }
}
