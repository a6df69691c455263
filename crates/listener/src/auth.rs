//! Authentication against a Service Bus namespace.
//!
//! Authentication methods are tried in a fixed order and the first one that
//! can be set up wins:
//!
//! 1. **SAS**: a connection string. When a shared access key name or value is
//!    configured, a connection string is composed from it for the entity's
//!    namespace and takes precedence over any configured connection string.
//! 2. **AAD**: a service principal (tenant ID, client ID, client secret).
//!
//! If neither can be set up, the error names every attempt and why it failed.

use std::str::FromStr;
use std::sync::Arc;

use pipeline::ServiceBusEntityId;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::token::{
    AadTokenProvider, SasTokenProvider, ServicePrincipal, StaticTokenProvider, TokenProvider,
};

/// DNS suffix of Service Bus namespaces in the public Azure cloud.
pub const SERVICE_BUS_ENDPOINT_SUFFIX: &str = "servicebus.windows.net";

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Credentials available to the connector. Every field is optional; which
/// ones are set decides which methods can succeed.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Name of a shared access policy. Used with `key_value`.
    pub key_name: Option<String>,
    /// Key of the `key_name` policy.
    pub key_value: Option<String>,
    /// Full namespace connection string. A key pair, when set, overrides the
    /// one embedded here.
    pub connection_string: Option<String>,
    /// Azure AD tenant of the service principal.
    pub tenant_id: Option<String>,
    /// Application (client) ID of the service principal.
    pub client_id: Option<String>,
    /// Secret of the service principal.
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_name", &self.key_name)
            .field("key_value", &self.key_value.as_ref().map(|_| "<redacted>"))
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Why a connection string could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionStringError {
    #[error("connection string is empty")]
    Empty,
    #[error("malformed connection string segment {0:?}")]
    Malformed(String),
    #[error("connection string has no {0}")]
    Missing(&'static str),
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...` string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// HTTPS endpoint of the namespace, with a trailing slash.
    pub endpoint: Url,
    /// `SharedAccessKeyName`.
    pub key_name: Option<String>,
    /// `SharedAccessKey`.
    pub key: Option<String>,
    /// A pre-signed `SharedAccessSignature` token.
    pub shared_access_signature: Option<String>,
    /// `EntityPath`, present in entity-scoped connection strings.
    pub entity_path: Option<String>,
}

impl ConnectionString {
    /// Composes a connection string from a shared access key pair.
    pub fn compose(namespace: &str, entity_path: &str, key_name: &str, key_value: &str) -> String {
        format!(
            "Endpoint=sb://{namespace}.{SERVICE_BUS_ENDPOINT_SUFFIX}/;SharedAccessKeyName={key_name};SharedAccessKey={key_value};EntityPath={entity_path}"
        )
    }

    /// Token provider matching the credentials in this connection string.
    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        match (&self.shared_access_signature, &self.key_name, &self.key) {
            (Some(sas), _, _) => Arc::new(StaticTokenProvider::new(sas.clone())),
            (None, Some(name), Some(key)) => Arc::new(SasTokenProvider::new(name.clone(), key.clone())),
            // Parsing guarantees one of the two forms.
            _ => Arc::new(StaticTokenProvider::new(String::new())),
        }
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ConnectionStringError::Empty);
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut shared_access_signature = None;
        let mut entity_path = None;

        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Malformed(segment.to_string()))?;
            let value = Some(value.to_string()).filter(|v| !v.is_empty());
            match name.to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = value,
                "sharedaccesskeyname" => key_name = value,
                "sharedaccesskey" => key = value,
                "sharedaccesssignature" => shared_access_signature = value,
                "entitypath" => entity_path = value,
                _ => {}
            }
        }

        let raw_endpoint = endpoint.ok_or(ConnectionStringError::Missing("Endpoint"))?;
        let invalid = |reason: String| ConnectionStringError::InvalidEndpoint {
            endpoint: raw_endpoint.clone(),
            reason,
        };
        let parsed = Url::parse(&raw_endpoint).map_err(|e| invalid(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("no host".to_string()))?;
        let endpoint = Url::parse(&format!("https://{host}/")).map_err(|e| invalid(e.to_string()))?;

        if shared_access_signature.is_none() {
            if key_name.is_none() {
                return Err(ConnectionStringError::Missing("SharedAccessKeyName"));
            }
            if key.is_none() {
                return Err(ConnectionStringError::Missing("SharedAccessKey"));
            }
        }

        Ok(Self {
            endpoint,
            key_name,
            key,
            shared_access_signature,
            entity_path,
        })
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_name", &self.key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Authentication methods
// ---------------------------------------------------------------------------

/// A way of authenticating against the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Shared access signature, from a connection string or key pair.
    SharedAccessSignature,
    /// Azure Active Directory service principal.
    ServicePrincipal,
}

impl AuthMethod {
    /// Order in which methods are attempted.
    pub const PRECEDENCE: [AuthMethod; 2] = [AuthMethod::SharedAccessSignature, AuthMethod::ServicePrincipal];
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedAccessSignature => f.write_str("SAS"),
            Self::ServicePrincipal => f.write_str("AAD"),
        }
    }
}

/// One failed authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub method: AuthMethod,
    /// Why the method could not be used.
    pub reason: String,
}

/// The broker connection could not be set up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("no usable authentication method ({})", render_attempts(.attempts))]
    NoUsableAuthentication { attempts: Vec<AuthAttempt> },
}

fn render_attempts(attempts: &[AuthAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} error: {}", a.method, a.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Endpoint and token source for a namespace.
#[derive(Clone)]
pub struct Binding {
    /// The method that succeeded.
    pub method: AuthMethod,
    /// HTTPS endpoint of the namespace, with a trailing slash.
    pub endpoint: Url,
    /// Source of `Authorization` header values for requests to the namespace.
    pub tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

/// Sets up authentication for `entity`, trying each [`AuthMethod`] in
/// [`AuthMethod::PRECEDENCE`] order.
pub fn bind(
    entity: &ServiceBusEntityId,
    credentials: &Credentials,
    http: &reqwest::Client,
) -> Result<Binding, ConnectError> {
    let mut attempts = Vec::new();

    for method in AuthMethod::PRECEDENCE {
        let attempt = match method {
            AuthMethod::SharedAccessSignature => bind_sas(entity, credentials),
            AuthMethod::ServicePrincipal => bind_aad(entity, credentials, http),
        };
        match attempt {
            Ok(binding) => {
                info!(method = %method, endpoint = %binding.endpoint, "authenticating to Service Bus");
                return Ok(binding);
            }
            Err(reason) => {
                debug!(method = %method, reason = %reason, "authentication method unavailable");
                attempts.push(AuthAttempt { method, reason });
            }
        }
    }

    Err(ConnectError::NoUsableAuthentication { attempts })
}

fn bind_sas(entity: &ServiceBusEntityId, credentials: &Credentials) -> Result<Binding, String> {
    let key_name = non_empty(&credentials.key_name);
    let key_value = non_empty(&credentials.key_value);

    let raw = if key_name.is_some() || key_value.is_some() {
        ConnectionString::compose(
            entity.namespace(),
            entity.entity_path().as_str(),
            key_name.unwrap_or_default(),
            key_value.unwrap_or_default(),
        )
    } else {
        non_empty(&credentials.connection_string)
            .ok_or("no connection string or shared access key configured")?
            .to_string()
    };

    let connection_string: ConnectionString = raw.parse().map_err(|e: ConnectionStringError| e.to_string())?;
    Ok(Binding {
        method: AuthMethod::SharedAccessSignature,
        tokens: connection_string.token_provider(),
        endpoint: connection_string.endpoint,
    })
}

fn bind_aad(
    entity: &ServiceBusEntityId,
    credentials: &Credentials,
    http: &reqwest::Client,
) -> Result<Binding, String> {
    let tenant_id = non_empty(&credentials.tenant_id).ok_or("tenant ID not set")?;
    let client_id = non_empty(&credentials.client_id).ok_or("client ID not set")?;
    let client_secret = non_empty(&credentials.client_secret).ok_or("client secret not set")?;

    let endpoint = Url::parse(&format!(
        "https://{}.{SERVICE_BUS_ENDPOINT_SUFFIX}/",
        entity.namespace()
    ))
    .map_err(|e| format!("invalid namespace endpoint: {e}"))?;

    let principal = ServicePrincipal {
        tenant_id: tenant_id.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    };
    Ok(Binding {
        method: AuthMethod::ServicePrincipal,
        endpoint,
        tokens: Arc::new(AadTokenProvider::new(http.clone(), principal)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_ID: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns1/queues/q1";

    fn entity() -> ServiceBusEntityId {
        ServiceBusEntityId::parse(QUEUE_ID).unwrap()
    }

    #[test]
    fn test_parse_key_connection_string() {
        let cs: ConnectionString =
            "Endpoint=sb://ns1.servicebus.windows.net/;SharedAccessKeyName=Root;SharedAccessKey=abc==;EntityPath=q1"
                .parse()
                .unwrap();

        assert_eq!(cs.endpoint.as_str(), "https://ns1.servicebus.windows.net/");
        assert_eq!(cs.key_name.as_deref(), Some("Root"));
        assert_eq!(cs.key.as_deref(), Some("abc=="));
        assert_eq!(cs.entity_path.as_deref(), Some("q1"));
    }

    #[test]
    fn test_parse_signature_connection_string() {
        let cs: ConnectionString =
            "endpoint=sb://ns1.servicebus.windows.net;SharedAccessSignature=SharedAccessSignature sr=a&sig=b&se=1&skn=c"
                .parse()
                .unwrap();

        assert_eq!(
            cs.shared_access_signature.as_deref(),
            Some("SharedAccessSignature sr=a&sig=b&se=1&skn=c")
        );
    }

    #[test]
    fn test_connection_string_errors() {
        assert_eq!("".parse::<ConnectionString>(), Err(ConnectionStringError::Empty));
        assert_eq!(
            "SharedAccessKeyName=a;SharedAccessKey=b".parse::<ConnectionString>(),
            Err(ConnectionStringError::Missing("Endpoint"))
        );
        assert_eq!(
            "Endpoint=sb://ns1.servicebus.windows.net/;SharedAccessKey=b".parse::<ConnectionString>(),
            Err(ConnectionStringError::Missing("SharedAccessKeyName"))
        );
        assert_eq!(
            "Endpoint=sb://ns1.servicebus.windows.net/;SharedAccessKeyName=a".parse::<ConnectionString>(),
            Err(ConnectionStringError::Missing("SharedAccessKey"))
        );
        assert!(matches!(
            "Endpoint".parse::<ConnectionString>(),
            Err(ConnectionStringError::Malformed(_))
        ));
        assert!(matches!(
            "Endpoint=not a url;SharedAccessKeyName=a;SharedAccessKey=b".parse::<ConnectionString>(),
            Err(ConnectionStringError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_compose_connection_string() {
        assert_eq!(
            ConnectionString::compose("ns1", "t1/Subscriptions/s1", "Root", "abc"),
            "Endpoint=sb://ns1.servicebus.windows.net/;SharedAccessKeyName=Root;SharedAccessKey=abc;EntityPath=t1/Subscriptions/s1"
        );
    }

    #[test]
    fn test_key_pair_takes_precedence_over_connection_string() {
        let credentials = Credentials {
            key_name: Some("Root".to_string()),
            key_value: Some("abc".to_string()),
            connection_string: Some(
                "Endpoint=sb://other.servicebus.windows.net/;SharedAccessKeyName=x;SharedAccessKey=y".to_string(),
            ),
            ..Default::default()
        };

        let binding = bind(&entity(), &credentials, &reqwest::Client::new()).unwrap();

        assert_eq!(binding.method, AuthMethod::SharedAccessSignature);
        assert_eq!(binding.endpoint.as_str(), "https://ns1.servicebus.windows.net/");
    }

    #[test]
    fn test_connection_string_used_without_key_pair() {
        let credentials = Credentials {
            connection_string: Some(
                "Endpoint=sb://other.servicebus.windows.net/;SharedAccessKeyName=x;SharedAccessKey=y".to_string(),
            ),
            ..Default::default()
        };

        let binding = bind(&entity(), &credentials, &reqwest::Client::new()).unwrap();

        assert_eq!(binding.endpoint.as_str(), "https://other.servicebus.windows.net/");
    }

    #[test]
    fn test_falls_back_to_service_principal() {
        let credentials = Credentials {
            tenant_id: Some("t".to_string()),
            client_id: Some("c".to_string()),
            client_secret: Some("s".to_string()),
            ..Default::default()
        };

        let binding = bind(&entity(), &credentials, &reqwest::Client::new()).unwrap();

        assert_eq!(binding.method, AuthMethod::ServicePrincipal);
        assert_eq!(binding.endpoint.as_str(), "https://ns1.servicebus.windows.net/");
    }

    #[test]
    fn test_invalid_connection_string_falls_back_to_service_principal() {
        let credentials = Credentials {
            connection_string: Some("garbage".to_string()),
            tenant_id: Some("t".to_string()),
            client_id: Some("c".to_string()),
            client_secret: Some("s".to_string()),
            ..Default::default()
        };

        let binding = bind(&entity(), &credentials, &reqwest::Client::new()).unwrap();
        assert_eq!(binding.method, AuthMethod::ServicePrincipal);
    }

    #[test]
    fn test_no_usable_method_names_every_attempt() {
        let credentials = Credentials {
            tenant_id: Some("t".to_string()),
            ..Default::default()
        };

        let err = bind(&entity(), &credentials, &reqwest::Client::new()).unwrap_err();

        let ConnectError::NoUsableAuthentication { attempts } = &err;
        let methods: Vec<AuthMethod> = attempts.iter().map(|a| a.method).collect();
        assert_eq!(methods, AuthMethod::PRECEDENCE.to_vec());
        assert_eq!(
            err.to_string(),
            "no usable authentication method (SAS error: no connection string or shared access key configured, AAD error: client ID not set)"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let credentials = Credentials {
            key_value: Some("topsecret".to_string()),
            client_secret: Some("alsosecret".to_string()),
            ..Default::default()
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("alsosecret"));
    }
}
