//! Service Bus side of the source: connecting, receiving, and the listen loop.
//!
//! - [`auth`] picks an authentication method for the entity's namespace
//!   (shared access signature first, then an AAD service principal).
//! - [`servicebus`] receives messages in peek-lock mode over the Service Bus
//!   HTTPS surface and completes them by deleting their lock.
//! - [`listener`] drives the receive loop and hands each delivery to the
//!   [`pipeline::MessageHandler`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport details, credentials and broker metadata
//! decoding all live here. The [`pipeline`] crate sees only
//! [`pipeline::Delivery`] and [`pipeline::CompletionHandle`].
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start──► Listening ──cancel / fatal broker error──► Stopped
//!                    │  ▲
//!                    ▼  │ (per message, concurrently)
//!          process ► dispatch ► finalize
//! ```

pub mod auth;
pub mod listener;
pub mod servicebus;
pub mod token;

pub use auth::{
    bind, AuthAttempt, AuthMethod, Binding, ConnectError, ConnectionString, ConnectionStringError,
    Credentials, SERVICE_BUS_ENDPOINT_SUFFIX,
};
pub use listener::{
    Listener, ListenerConfig, ListenerError, ListenerState, MessageReceiver, DEFAULT_DRAIN_TIMEOUT,
};
pub use servicebus::{
    broker_http_client, ReceiverOptions, RestCompletion, ServiceBusReceiver, DEFAULT_RECEIVE_TIMEOUT,
};
pub use token::{
    AadTokenProvider, SasTokenProvider, ServicePrincipal, StaticTokenProvider, TokenProvider,
    DEFAULT_AAD_AUTHORITY, SERVICE_BUS_AAD_SCOPE,
};

#[cfg(any(test, feature = "testing"))]
pub use listener::MockMessageReceiver;
#[cfg(any(test, feature = "testing"))]
pub use token::MockTokenProvider;
