//! Outbound event envelopes (CloudEvents 1.0).
//!
//! An [`EventEnvelope`] is created by a message processor and is immutable
//! afterwards, except for the single-field corrections applied by the
//! [sanitizer](crate::sanitize).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// CloudEvents specification version produced and accepted by this crate.
pub const SPEC_VERSION: &str = "1.0";

const MAX_EXTENSION_NAME_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Payload of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// Structured JSON payload.
    Json(serde_json::Value),
    /// Opaque binary payload.
    Binary(Vec<u8>),
}

impl EventData {
    /// Serialised payload bytes, as they go on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            // Serialising a Value cannot fail: keys are always strings.
            Self::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Self::Binary(bytes) => bytes.clone(),
        }
    }
}

/// A CloudEvents 1.0 event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// CloudEvents version, always [`SPEC_VERSION`] for events built here.
    pub specversion: String,
    /// Event ID; unique together with `source`.
    pub id: String,
    /// URI reference of the event producer.
    pub source: String,
    /// The `type` attribute.
    pub event_type: String,
    /// When the occurrence happened.
    pub time: DateTime<Utc>,
    /// Subject of the event within the context of `source`.
    pub subject: Option<String>,
    /// URI of the schema `data` adheres to. Cleared by the sanitizer when invalid.
    pub dataschema: Option<String>,
    /// Media type of `data`.
    pub datacontenttype: Option<String>,
    /// Event payload.
    pub data: Option<EventData>,
    /// Extension context attributes, by lowercase name.
    pub extensions: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Creates an event with the required attributes, stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            time: Utc::now(),
            subject: None,
            dataschema: None,
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Sets the payload together with its content type.
    pub fn with_data(mut self, content_type: impl Into<String>, data: EventData) -> Self {
        self.datacontenttype = Some(content_type.into());
        self.data = Some(data);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Checks every context attribute and reports all that violate the
    /// CloudEvents 1.0 rules.
    pub fn validate(&self) -> Result<(), ValidationFailure> {
        let mut failure = ValidationFailure::default();

        if self.specversion != SPEC_VERSION {
            failure.insert("specversion", format!("expected {SPEC_VERSION:?}"));
        }
        if self.id.is_empty() {
            failure.insert("id", "MUST be a non-empty string");
        }
        if self.source.is_empty() {
            failure.insert("source", "MUST be a non-empty URI-reference");
        }
        if self.event_type.is_empty() {
            failure.insert("type", "MUST be a non-empty string");
        }
        if matches!(self.subject.as_deref(), Some("")) {
            failure.insert("subject", "if present, MUST be a non-empty string");
        }
        if matches!(self.datacontenttype.as_deref(), Some("")) {
            failure.insert("datacontenttype", "if present, MUST be a non-empty string");
        }
        if let Some(schema) = &self.dataschema {
            if let Err(e) = url::Url::parse(schema) {
                failure.insert("dataschema", format!("if present, MUST be an absolute URI: {e}"));
            }
        }
        for name in self.extensions.keys() {
            if !is_valid_extension_name(name) {
                failure.insert(
                    name.clone(),
                    "extension attribute names MUST be lowercase alphanumeric, at most 20 characters",
                );
            }
        }

        if failure.is_empty() {
            Ok(())
        } else {
            Err(failure)
        }
    }
}

fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_EXTENSION_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// The set of attributes that failed validation, each with a reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationFailure(BTreeMap<String, String>);

impl ValidationFailure {
    pub fn insert(&mut self, attribute: impl Into<String>, reason: impl Into<String>) {
        self.0.insert(attribute.into(), reason.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.0.contains_key(attribute)
    }

    /// Names of the failing attributes, in lexical order.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        write!(f, "validation error: {}", parts.join("; "))
    }
}

impl std::error::Error for ValidationFailure {}

// ---------------------------------------------------------------------------
// JSON event format
// ---------------------------------------------------------------------------

/// An event in the CloudEvents JSON format, as found in message bodies.
///
/// `source` and `time` may be absent; [`CloudEventJson::into_envelope`] fills
/// them from the caller's defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudEventJson {
    pub specversion: String,
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub dataschema: Option<String>,
    #[serde(default)]
    pub datacontenttype: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub data_base64: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl CloudEventJson {
    /// Converts to an [`EventEnvelope`], using `default_source` and
    /// `default_time` for attributes the event does not carry.
    ///
    /// Attribute values are taken as-is; an invalid `dataschema` survives the
    /// conversion and is left for validation to report.
    pub fn into_envelope(
        self,
        default_source: &str,
        default_time: DateTime<Utc>,
    ) -> Result<EventEnvelope, String> {
        let data = match (self.data, self.data_base64) {
            (Some(_), Some(_)) => {
                return Err("event carries both \"data\" and \"data_base64\"".to_string())
            }
            (Some(value), None) => Some(EventData::Json(value)),
            (None, Some(encoded)) => Some(EventData::Binary(
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| format!("decoding \"data_base64\": {e}"))?,
            )),
            (None, None) => None,
        };

        let mut extensions = BTreeMap::new();
        for (name, value) in self.extensions {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return Err(format!("extension attribute {name:?} is not a scalar")),
            };
            extensions.insert(name, value);
        }

        Ok(EventEnvelope {
            specversion: self.specversion,
            id: self.id,
            source: self
                .source
                .unwrap_or_else(|| default_source.to_string()),
            event_type: self.event_type,
            time: self.time.unwrap_or(default_time),
            subject: self.subject,
            dataschema: self.dataschema,
            datacontenttype: self.datacontenttype,
            data,
            extensions,
        })
    }
}
