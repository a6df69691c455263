//! CloudEvents HTTP binary-mode sender.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use pipeline::{EventEnvelope, EventSender, SendError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

/// Default per-request timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Back-off before the first retry; doubles on every further attempt.
pub const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// The sender could not be constructed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid sink URL {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Settings of an [`HttpEventSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Where events are posted.
    pub target: Url,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    /// Timeout of a single attempt.
    pub timeout: Duration,
    /// Pause before the first retry; doubles on every further retry.
    pub initial_backoff: Duration,
}

impl SenderConfig {
    pub fn new(target: &str) -> Result<Self, SinkError> {
        let target = Url::parse(target).map_err(|e| SinkError::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            target,
            retries: 0,
            timeout: DEFAULT_SEND_TIMEOUT,
            initial_backoff: INITIAL_RETRY_BACKOFF,
        })
    }
}

/// Posts events to an HTTP endpoint in CloudEvents binary content mode.
///
/// Attributes travel as `ce-*` headers, `datacontenttype` as `Content-Type`
/// and the data as the request body. Only a 2xx response acknowledges an
/// event.
#[derive(Debug, Clone)]
pub struct HttpEventSender {
    http: reqwest::Client,
    config: SenderConfig,
}

impl HttpEventSender {
    pub fn new(config: SenderConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn target(&self) -> &Url {
        &self.config.target
    }

    async fn attempt(&self, event: &EventEnvelope, headers: HeaderMap, body: Vec<u8>) -> Result<(), SendError> {
        let response = self
            .http
            .post(self.config.target.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout
                } else {
                    SendError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(event_id = %event.id, status = status.as_u16(), "event accepted");
            Ok(())
        } else {
            Err(SendError::Nack {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    #[instrument(skip_all, fields(event_id = %event.id, event_type = %event.event_type))]
    async fn send(&self, event: &EventEnvelope) -> Result<(), SendError> {
        let headers = binary_headers(event)?;
        let body = event.data.as_ref().map(|d| d.to_bytes()).unwrap_or_default();

        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            match self.attempt(event, headers.clone(), body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, backoff = ?backoff, "retrying event delivery");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Maps an event onto binary-mode HTTP headers.
pub fn binary_headers(event: &EventEnvelope) -> Result<HeaderMap, SendError> {
    let mut headers = HeaderMap::new();
    let mut put = |name: &str, value: &str| -> Result<(), SendError> {
        let name = HeaderName::from_bytes(format!("ce-{name}").as_bytes())
            .map_err(|e| SendError::Transport(format!("invalid attribute name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(&percent_encode(value))
            .map_err(|e| SendError::Transport(format!("invalid attribute value for {name}: {e}")))?;
        headers.insert(name, value);
        Ok(())
    };

    put("specversion", &event.specversion)?;
    put("id", &event.id)?;
    put("source", &event.source)?;
    put("type", &event.event_type)?;
    put("time", &event.time.to_rfc3339_opts(SecondsFormat::AutoSi, true))?;
    if let Some(subject) = &event.subject {
        put("subject", subject)?;
    }
    if let Some(dataschema) = &event.dataschema {
        put("dataschema", dataschema)?;
    }
    for (name, value) in &event.extensions {
        put(name, value)?;
    }

    if let Some(content_type) = &event.datacontenttype {
        let value = HeaderValue::from_str(content_type)
            .map_err(|e| SendError::Transport(format!("invalid content type: {e}")))?;
        headers.insert(CONTENT_TYPE, value);
    }
    Ok(headers)
}

/// Percent-encodes space, `"`, `%` and everything outside printable ASCII.
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b' ' | b'"' | b'%' => encoded.push_str(&format!("%{byte:02X}")),
            0x21..=0x7E => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
