//! Authorization tokens for the Service Bus REST surface.
//!
//! Two kinds of credentials are supported:
//!
//! - **Shared access signatures**: either signed locally from a key
//!   ([`SasTokenProvider`]) or supplied ready-made in a connection string
//!   ([`StaticTokenProvider`]).
//! - **Azure Active Directory**: OAuth2 client-credentials tokens for a
//!   service principal ([`AadTokenProvider`]), cached until shortly before
//!   they expire.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use pipeline::BrokerError;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;
use url::form_urlencoded;

/// Validity of locally signed SAS tokens.
const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// AAD tokens are refreshed this long before they expire.
const AAD_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// OAuth2 scope granting access to Service Bus data operations.
pub const SERVICE_BUS_AAD_SCOPE: &str = "https://servicebus.azure.net/.default";

/// Default Azure AD authority (public cloud).
pub const DEFAULT_AAD_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Produces the value of the `Authorization` header for requests to a
/// Service Bus resource.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn authorization(&self, resource_uri: &str) -> Result<String, BrokerError>;
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Shared access signatures
// ---------------------------------------------------------------------------

/// Signs SAS tokens with a shared access key.
pub struct SasTokenProvider {
    key_name: String,
    key: String,
}

impl SasTokenProvider {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    /// Builds a token for `resource_uri` that expires at `expiry` (Unix seconds).
    pub fn sign(&self, resource_uri: &str, expiry: i64) -> String {
        let audience = encode(resource_uri);
        let string_to_sign = format!("{audience}\n{expiry}");

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        format!(
            "SharedAccessSignature sr={audience}&sig={}&se={expiry}&skn={}",
            encode(&signature),
            self.key_name
        )
    }
}

impl std::fmt::Debug for SasTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasTokenProvider")
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for SasTokenProvider {
    async fn authorization(&self, resource_uri: &str) -> Result<String, BrokerError> {
        let expiry = chrono::Utc::now().timestamp() + SAS_TOKEN_TTL.as_secs() as i64;
        Ok(self.sign(resource_uri, expiry))
    }
}

/// Hands out a pre-signed shared access signature.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn authorization(&self, _resource_uri: &str) -> Result<String, BrokerError> {
        Ok(self.token.clone())
    }
}

// ---------------------------------------------------------------------------
// Azure Active Directory
// ---------------------------------------------------------------------------

/// Service principal credentials.
#[derive(Clone)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    /// Never logged; the `Debug` impl redacts it.
    pub client_secret: String,
}

impl std::fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Obtains and caches AAD access tokens with the client-credentials grant.
pub struct AadTokenProvider {
    http: reqwest::Client,
    authority: String,
    principal: ServicePrincipal,
    cached: Mutex<Option<CachedToken>>,
}

impl AadTokenProvider {
    pub fn new(http: reqwest::Client, principal: ServicePrincipal) -> Self {
        Self::with_authority(http, DEFAULT_AAD_AUTHORITY, principal)
    }

    /// Uses a non-default authority (sovereign clouds, tests).
    pub fn with_authority(
        http: reqwest::Client,
        authority: impl Into<String>,
        principal: ServicePrincipal,
    ) -> Self {
        Self {
            http,
            authority: authority.into().trim_end_matches('/').to_string(),
            principal,
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse, BrokerError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority, self.principal.tenant_id
        );
        let body: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.principal.client_id)
            .append_pair("client_secret", &self.principal.client_secret)
            .append_pair("scope", SERVICE_BUS_AAD_SCOPE)
            .finish();

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("requesting AAD token: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("AAD token endpoint responded with status {status}");
            return Err(if status.is_client_error() {
                BrokerError::Fatal(message)
            } else {
                BrokerError::Transient(message)
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| BrokerError::Transient(format!("decoding AAD token response: {e}")))
    }
}

#[async_trait]
impl TokenProvider for AadTokenProvider {
    async fn authorization(&self, _resource_uri: &str) -> Result<String, BrokerError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(format!("Bearer {}", token.value));
        }

        let response = self.fetch().await?;
        debug!(expires_in = response.expires_in, "acquired AAD token");
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(AAD_REFRESH_MARGIN);
        let header = format!("Bearer {}", response.access_token);
        *cached = Some(CachedToken {
            value: response.access_token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(header)
    }
}
