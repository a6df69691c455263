//! Peek-lock receiver over the Service Bus HTTPS surface.
//!
//! A receive is `POST {entity}/messages/head?timeout=N`, which locks the
//! message at the head of the entity and returns it. The lock is released by
//! `DELETE`-ing the lock URI once the message has been handled; a message that
//! is never completed becomes visible again when its lock expires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline::{
    BrokerError, CompletionHandle, Delivery, EntityPath, MessageId, RawMessage, ServiceBusEntityId,
};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{bind, Binding, ConnectError, Credentials};
use crate::listener::MessageReceiver;
use crate::token::TokenProvider;

/// Name of the header carrying the broker's message metadata.
const BROKER_PROPERTIES_HEADER: &str = "brokerproperties";

/// Headers that are part of the HTTP exchange rather than application
/// properties of the message.
const STANDARD_HEADERS: &[&str] = &[
    "brokerproperties",
    "cache-control",
    "connection",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "expires",
    "location",
    "pragma",
    "server",
    "strict-transport-security",
    "transfer-encoding",
    "vary",
];

/// Default long-poll duration of a single receive request.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning for [`ServiceBusReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// How long the broker holds a receive request open waiting for a message.
    pub receive_timeout: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

/// Slack on top of the long-poll duration before a broker request is given up.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

impl ReceiverOptions {
    /// Client-side deadline of one broker request. Longer than the long poll
    /// so an idle entity is not mistaken for a hung connection.
    pub fn request_timeout(&self) -> Duration {
        self.receive_timeout + REQUEST_TIMEOUT_MARGIN
    }
}

/// HTTP client for broker traffic, bounded by [`ReceiverOptions::request_timeout`].
pub fn broker_http_client(options: &ReceiverOptions) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(options.request_timeout())
        .build()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    message_id: Option<String>,
    lock_token: Option<String>,
    sequence_number: Option<i64>,
    delivery_count: Option<u32>,
    label: Option<String>,
    correlation_id: Option<String>,
    session_id: Option<String>,
    enqueued_time_utc: Option<String>,
}

/// Receives messages from one queue or topic subscription.
pub struct ServiceBusReceiver {
    http: reqwest::Client,
    endpoint: Url,
    entity_path: EntityPath,
    tokens: Arc<dyn TokenProvider>,
    options: ReceiverOptions,
}

impl ServiceBusReceiver {
    pub fn new(
        http: reqwest::Client,
        binding: Binding,
        entity_path: EntityPath,
        options: ReceiverOptions,
    ) -> Self {
        Self {
            http,
            endpoint: binding.endpoint,
            entity_path,
            tokens: binding.tokens,
            options,
        }
    }

    /// Binds a receiver to `entity` with the first usable authentication
    /// method. No network traffic happens until the first receive.
    pub fn connect(
        entity: &ServiceBusEntityId,
        credentials: &Credentials,
        http: reqwest::Client,
        options: ReceiverOptions,
    ) -> Result<Self, ConnectError> {
        let binding = bind(entity, credentials, &http)?;
        Ok(Self::new(http, binding, entity.entity_path(), options))
    }

    /// URI of the entity, also the audience of its SAS tokens.
    pub fn entity_uri(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            self.entity_path
        )
    }

    fn receive_url(&self) -> String {
        format!(
            "{}/messages/head?timeout={}",
            self.entity_uri(),
            self.options.receive_timeout.as_secs()
        )
    }

    fn decode(
        &self,
        headers: &HeaderMap,
        body: Vec<u8>,
        fallback_uri: impl FnOnce(&str, &str) -> String,
    ) -> Result<(RawMessage, String), BrokerError> {
        let properties: BrokerProperties = match headers.get(BROKER_PROPERTIES_HEADER) {
            Some(value) => serde_json::from_slice(value.as_bytes()).map_err(|e| {
                BrokerError::Transient(format!("malformed BrokerProperties header: {e}"))
            })?,
            None => BrokerProperties::default(),
        };

        let lock_token = properties
            .lock_token
            .as_deref()
            .and_then(|t| Uuid::parse_str(t).ok());

        let id = properties
            .message_id
            .as_deref()
            .and_then(MessageId::new)
            .or_else(|| lock_token.and_then(|t| MessageId::new(t.to_string())))
            .ok_or_else(|| {
                BrokerError::Transient("received message has neither ID nor lock token".to_string())
            })?;

        let lock_uri = match headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
            Some(location) => location.to_string(),
            None => {
                let token = lock_token.ok_or_else(|| {
                    BrokerError::Transient(format!("message {id} has no lock token"))
                })?;
                fallback_uri(id.as_str(), &token.to_string())
            }
        };

        let mut message = RawMessage::new(id, body);
        message.content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        message.correlation_id = properties.correlation_id;
        message.label = properties.label;
        message.session_id = properties.session_id;
        message.delivery_count = properties.delivery_count.unwrap_or(1);
        message.sequence_number = properties.sequence_number;
        // Events need a time; without a broker timestamp the receipt time stands in.
        let enqueued_time = properties
            .enqueued_time_utc
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc2822(t).ok())
            .map(|t| t.with_timezone(&Utc));
        message.enqueued_time = Some(enqueued_time.unwrap_or_else(Utc::now));
        message.user_properties = user_properties(headers);

        Ok((message, lock_uri))
    }
}

fn user_properties(headers: &HeaderMap) -> BTreeMap<String, serde_json::Value> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !STANDARD_HEADERS.contains(&name) && !name.starts_with("x-ms-")
        })
        .filter_map(|(name, value)| {
            let raw = value.to_str().ok()?;
            let parsed = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            Some((name.as_str().to_string(), parsed))
        })
        .collect()
}

fn status_error(status: StatusCode, action: &str) -> BrokerError {
    let message = format!("{action}: Service Bus responded with status {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            BrokerError::Fatal(message)
        }
        _ => BrokerError::Transient(message),
    }
}

#[async_trait]
impl MessageReceiver for ServiceBusReceiver {
    #[instrument(skip_all, fields(entity = %self.entity_path))]
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let entity_uri = self.entity_uri();
        let authorization = self.tokens.authorization(&entity_uri).await?;

        let response = self
            .http
            .post(self.receive_url())
            .header(AUTHORIZATION, authorization)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("receiving message: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::NO_CONTENT => return Ok(None),
            StatusCode::OK | StatusCode::CREATED => {}
            _ => return Err(status_error(status, "receiving message")),
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| BrokerError::Transient(format!("reading message body: {e}")))?
            .to_vec();

        let (message, lock_uri) = self.decode(&headers, body, |id, token| {
            format!("{entity_uri}/messages/{id}/{token}")
        })?;
        debug!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            "received message"
        );

        let completion = RestCompletion {
            http: self.http.clone(),
            lock_uri,
            entity_uri,
            tokens: Arc::clone(&self.tokens),
        };
        Ok(Some(Delivery::new(message, Box::new(completion))))
    }
}

/// Completes a peek-locked message by deleting its lock.
pub struct RestCompletion {
    http: reqwest::Client,
    lock_uri: String,
    entity_uri: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for RestCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCompletion")
            .field("lock_uri", &self.lock_uri)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CompletionHandle for RestCompletion {
    async fn complete(&self) -> Result<(), BrokerError> {
        let authorization = self.tokens.authorization(&self.entity_uri).await?;
        let response = self
            .http
            .delete(&self.lock_uri)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("completing message: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        warn!(lock_uri = %self.lock_uri, status = %status, "message completion rejected");
        Err(status_error(status, "completing message"))
    }
}
