//! Inbound broker messages.
//!
//! A [`RawMessage`] is the content of one Service Bus message. A [`Delivery`]
//! pairs it with the [`CompletionHandle`] that removes it from the entity once
//! it has been fully handled. Messages are never mutated by the pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{BrokerError, MessageId};

/// Content and broker metadata of one Service Bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Message ID.
    pub id: MessageId,
    /// Opaque message body.
    pub body: Vec<u8>,
    /// Content type declared by the sender.
    pub content_type: Option<String>,
    /// Application-defined correlation identifier.
    pub correlation_id: Option<String>,
    /// Application-defined label (a.k.a. subject).
    pub label: Option<String>,
    /// Session the message belongs to, for session-enabled entities.
    pub session_id: Option<String>,
    /// Number of times the broker has delivered this message, this delivery included.
    pub delivery_count: u32,
    /// Broker-assigned sequence number.
    pub sequence_number: Option<i64>,
    /// Time the broker accepted the message.
    pub enqueued_time: Option<DateTime<Utc>>,
    /// Application properties set by the sender.
    pub user_properties: BTreeMap<String, serde_json::Value>,
}

impl RawMessage {
    /// Creates a message with the given ID and body and no metadata.
    pub fn new(id: MessageId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            body: body.into(),
            content_type: None,
            correlation_id: None,
            label: None,
            session_id: None,
            delivery_count: 1,
            sequence_number: None,
            enqueued_time: None,
            user_properties: BTreeMap::new(),
        }
    }
}

/// Capability to mark a delivered message as processed.
///
/// Supplied by the broker connector alongside every message it hands out.
/// Completing removes the message from the entity; a message that is never
/// completed becomes available again once its lock expires.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CompletionHandle: Send + Sync {
    /// Settles the message as successfully processed.
    async fn complete(&self) -> Result<(), BrokerError>;
}

/// A message as handed out by the broker, together with its completion handle.
pub struct Delivery {
    /// The locked message.
    pub message: RawMessage,
    /// Settles `message`; called at most once, after every event was acknowledged.
    pub completion: Box<dyn CompletionHandle>,
}

impl Delivery {
    pub fn new(message: RawMessage, completion: Box<dyn CompletionHandle>) -> Self {
        Self {
            message,
            completion,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
