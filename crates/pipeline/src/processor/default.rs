use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::Value;

use super::{event_time, MessageProcessor};
use crate::{EventData, EventEnvelope, ProcessingError, RawMessage};

/// `type` attribute of events produced by [`DefaultMessageProcessor`].
pub const SERVICE_BUS_MESSAGE_EVENT_TYPE: &str = "com.microsoft.azure.servicebus.message";

const CONTENT_TYPE_JSON: &str = "application/json";

/// Produces one event per message, carrying the message body and its broker
/// metadata as a JSON object.
///
/// The body is embedded as JSON when it parses as JSON, as a string when it is
/// valid UTF-8, and base64-encoded otherwise.
#[derive(Debug, Clone)]
pub struct DefaultMessageProcessor {
    source: String,
}

impl DefaultMessageProcessor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// JSON representation of a message inside the event payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MessagePayload<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    content_type: Option<&'a str>,
    #[serde(rename = "CorrelationID")]
    correlation_id: Option<&'a str>,
    label: Option<&'a str>,
    #[serde(rename = "SessionID")]
    session_id: Option<&'a str>,
    delivery_count: u32,
    sequence_number: Option<i64>,
    enqueued_time: Option<String>,
    user_properties: &'a std::collections::BTreeMap<String, Value>,
    data: Value,
}

fn body_to_value(body: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(STANDARD.encode(body)),
    }
}

impl MessageProcessor for DefaultMessageProcessor {
    fn process(&self, message: &RawMessage) -> Result<Vec<EventEnvelope>, ProcessingError> {
        let payload = MessagePayload {
            id: message.id.as_str(),
            content_type: message.content_type.as_deref(),
            correlation_id: message.correlation_id.as_deref(),
            label: message.label.as_deref(),
            session_id: message.session_id.as_deref(),
            delivery_count: message.delivery_count,
            sequence_number: message.sequence_number,
            enqueued_time: message.enqueued_time.map(|t| t.to_rfc3339()),
            user_properties: &message.user_properties,
            data: body_to_value(&message.body),
        };
        let data = serde_json::to_value(&payload)
            .map_err(|e| ProcessingError::new(message.id.clone(), format!("encoding payload: {e}")))?;

        let mut event = EventEnvelope::new(
            message.id.as_str(),
            self.source.as_str(),
            SERVICE_BUS_MESSAGE_EVENT_TYPE,
        )
        .with_time(event_time(message))
        .with_data(CONTENT_TYPE_JSON, EventData::Json(data));

        if let Some(label) = message.label.as_deref().filter(|l| !l.is_empty()) {
            event = event.with_subject(label);
        }

        Ok(vec![event])
    }
}
