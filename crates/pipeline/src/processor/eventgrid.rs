use serde::Deserialize;

use super::{event_time, MessageProcessor};
use crate::{CloudEventJson, EventEnvelope, ProcessingError, RawMessage};

/// Unwraps CloudEvents that Azure Event Grid delivered to the entity.
///
/// The body is a single event or a batch (JSON array) in the CloudEvents JSON
/// format. Events are forwarded as they are; `source` falls back to the
/// entity's resource ID and `time` to the message's enqueued time. Any
/// malformed event fails the whole message, so nothing is forwarded twice
/// once the message is redelivered.
#[derive(Debug, Clone)]
pub struct EventGridMessageProcessor {
    source: String,
}

impl EventGridMessageProcessor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Body {
    Batch(Vec<CloudEventJson>),
    Single(Box<CloudEventJson>),
}

impl MessageProcessor for EventGridMessageProcessor {
    fn process(&self, message: &RawMessage) -> Result<Vec<EventEnvelope>, ProcessingError> {
        let fail = |reason: String| ProcessingError::new(message.id.clone(), reason);

        let body: Body = serde_json::from_slice(&message.body)
            .map_err(|e| fail(format!("body is not a CloudEvent or a batch of CloudEvents: {e}")))?;
        let events = match body {
            Body::Batch(events) => events,
            Body::Single(event) => vec![*event],
        };

        let default_time = event_time(message);
        events
            .into_iter()
            .enumerate()
            .map(|(idx, event)| {
                event
                    .into_envelope(&self.source, default_time)
                    .map_err(|e| fail(format!("event at index {idx}: {e}")))
            })
            .collect()
    }
}
