//! Event sink adapter.
//!
//! Implements the [`pipeline::EventSender`] trait for an HTTP endpoint that
//! accepts CloudEvents in binary content mode (the `K_SINK` address of the
//! source).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, attribute-to-header mapping, timeouts
//! and retry back-off live here. The [`pipeline`] crate sees only
//! [`pipeline::EventSender`] and [`pipeline::SendError`].

pub mod http;

pub use http::{
    binary_headers, HttpEventSender, SenderConfig, SinkError, DEFAULT_SEND_TIMEOUT,
    INITIAL_RETRY_BACKOFF,
};
