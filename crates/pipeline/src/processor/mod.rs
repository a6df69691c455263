//! Message processors: conversion of broker messages into events.
//!
//! A processor is selected by name at startup. Adding a variant means adding a
//! [`ProcessorKind`] and a type implementing [`MessageProcessor`]; dispatch and
//! acknowledgment never need to know which processor produced an event.
//!
//! | Name | Processor | Events per message |
//! |------|-----------|--------------------|
//! | `default` | [`DefaultMessageProcessor`] | exactly one |
//! | `eventgrid` | [`EventGridMessageProcessor`] | zero or more |

mod default;
mod eventgrid;

pub use default::{DefaultMessageProcessor, SERVICE_BUS_MESSAGE_EVENT_TYPE};
pub use eventgrid::EventGridMessageProcessor;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{ConfigError, EventEnvelope, ProcessingError, RawMessage};

/// Converts one broker message into the events to deliver.
///
/// Implementations are pure: the same message always yields the same events
/// and is never modified. Malformed content is reported as a
/// [`ProcessingError`] rather than a panic.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait MessageProcessor: Send + Sync {
    fn process(&self, message: &RawMessage) -> Result<Vec<EventEnvelope>, ProcessingError>;
}

/// Registered processor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessorKind {
    /// Wraps each message, metadata included, into one event.
    #[default]
    Default,
    /// Unwraps CloudEvents delivered by Azure Event Grid.
    EventGrid,
}

impl ProcessorKind {
    /// Configuration name of the variant.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::EventGrid => "eventgrid",
        }
    }
}

impl FromStr for ProcessorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "eventgrid" => Ok(Self::EventGrid),
            other => Err(ConfigError::UnknownProcessor {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `time` of events derived from `message` that carry no time of their own.
///
/// The receiver stamps every broker message with an enqueued time, so the
/// epoch only shows up for messages built without one.
pub(crate) fn event_time(message: &RawMessage) -> DateTime<Utc> {
    message.enqueued_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Instantiates the processor of the given kind. `source` is the value of the
/// `source` attribute stamped on produced events.
pub fn build_processor(kind: ProcessorKind, source: impl Into<String>) -> Arc<dyn MessageProcessor> {
    let source = source.into();
    match kind {
        ProcessorKind::Default => Arc::new(DefaultMessageProcessor::new(source)),
        ProcessorKind::EventGrid => Arc::new(EventGridMessageProcessor::new(source)),
    }
}
