//! Core message-handling pipeline of the Service Bus source.
//!
//! Every message received from a Service Bus queue or topic subscription goes
//! through the same steps:
//!
//! ```text
//! RawMessage ──► MessageProcessor ──► [EventEnvelope; 0..N] ──► Dispatcher ──► EventSender
//!                                                                    │
//!                                              ErrorBatch ◄──────────┘
//!                                                  │
//!                                                  ▼
//!                                      finalize: complete or leave for redelivery
//! ```
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! The broker connection ([`CompletionHandle`]) and the sink
//! ([`EventSender`]) are traits implemented by the `listener` and `sink`
//! crates.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`MessageId`, `EntityPath`) |
//! | [`resource`] | Resource ID parsing and Service Bus entity validation |
//! | [`message`] | Inbound messages and their completion handles |
//! | [`envelope`] | CloudEvents envelopes and their validation |
//! | [`sanitize`](mod@sanitize) | Known fixes for invalid events |
//! | [`processor`] | Message processors and their registry |
//! | [`dispatch`] | Event delivery with failure collection |
//! | [`ack`] | Message settlement |
//! | [`handler`] | The per-message chain and its observer |
//! | [`errors`] | Error taxonomy |

pub mod ack;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod identifiers;
pub mod message;
pub mod processor;
pub mod resource;
pub mod sanitize;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use ack::finalize;
pub use dispatch::{Dispatcher, EventSender};
pub use envelope::{CloudEventJson, EventData, EventEnvelope, ValidationFailure, SPEC_VERSION};
pub use errors::{
    BrokerError, ConfigError, ErrorBatch, HandleError, ProcessingError, SendError, SendFailure,
};
pub use handler::{HandlingObserver, HandlingOutcome, LoggingObserver, MessageHandler};
pub use identifiers::{EmptyIdentifier, EntityPath, MessageId};
pub use message::{CompletionHandle, Delivery, RawMessage};
pub use processor::{
    build_processor, DefaultMessageProcessor, EventGridMessageProcessor, MessageProcessor,
    ProcessorKind, SERVICE_BUS_MESSAGE_EVENT_TYPE,
};
pub use resource::{AzureResourceId, EntityKind, ServiceBusEntityId, RESOURCE_PROVIDER_SERVICE_BUS};
pub use sanitize::sanitize;

#[cfg(any(test, feature = "testing"))]
pub use dispatch::MockEventSender;
#[cfg(any(test, feature = "testing"))]
pub use handler::MockHandlingObserver;
#[cfg(any(test, feature = "testing"))]
pub use message::MockCompletionHandle;
#[cfg(any(test, feature = "testing"))]
pub use processor::MockMessageProcessor;
