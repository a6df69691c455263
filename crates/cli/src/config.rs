//! Process configuration, read once from the environment at startup.

use std::time::Duration;

use config::{Config, ConfigError, Environment};
use listener::{Credentials, ListenerConfig, ReceiverOptions};
use pipeline::{ProcessorKind, ServiceBusEntityId};
use serde::Deserialize;
use sink::{SenderConfig, SinkError};

use crate::telemetry::TelemetryConfig;

#[derive(Clone, Deserialize)]
pub struct AppConfig {
    /// Resource ID of the queue or topic subscription to read from.
    pub servicebus_entity_resource_id: String,

    #[serde(default = "default_message_processor")]
    pub servicebus_message_processor: String,

    // Shared access key pair; takes precedence over the connection string.
    #[serde(default)]
    pub servicebus_key_name: Option<String>,
    #[serde(default)]
    pub servicebus_key_value: Option<String>,
    #[serde(default)]
    pub servicebus_connection_string: Option<String>,

    // Service principal
    #[serde(default)]
    pub azure_tenant_id: Option<String>,
    #[serde(default)]
    pub azure_client_id: Option<String>,
    #[serde(default)]
    pub azure_client_secret: Option<String>,

    /// Address events are delivered to.
    pub k_sink: String,

    #[serde(default = "default_max_concurrent_calls")]
    pub servicebus_max_concurrent_calls: usize,

    #[serde(default = "default_receive_timeout_secs")]
    pub servicebus_receive_timeout_secs: u64,

    #[serde(default)]
    pub sink_retries: u32,

    #[serde(default = "default_sink_timeout_secs")]
    pub sink_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_message_processor() -> String {
    ProcessorKind::default().as_str().to_string()
}

fn default_max_concurrent_calls() -> usize {
    1
}

fn default_receive_timeout_secs() -> u64 {
    listener::DEFAULT_RECEIVE_TIMEOUT.as_secs()
}

fn default_sink_timeout_secs() -> u64 {
    sink::DEFAULT_SEND_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "sbsource".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    fn load(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn entity(&self) -> Result<ServiceBusEntityId, pipeline::ConfigError> {
        ServiceBusEntityId::parse(&self.servicebus_entity_resource_id)
    }

    pub fn processor_kind(&self) -> Result<ProcessorKind, pipeline::ConfigError> {
        self.servicebus_message_processor.parse()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            key_name: self.servicebus_key_name.clone(),
            key_value: self.servicebus_key_value.clone(),
            connection_string: self.servicebus_connection_string.clone(),
            tenant_id: self.azure_tenant_id.clone(),
            client_id: self.azure_client_id.clone(),
            client_secret: self.azure_client_secret.clone(),
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            max_concurrent_calls: self.servicebus_max_concurrent_calls,
            ..ListenerConfig::default()
        }
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            receive_timeout: Duration::from_secs(self.servicebus_receive_timeout_secs),
        }
    }

    pub fn sender_config(&self) -> Result<SenderConfig, SinkError> {
        let mut config = SenderConfig::new(&self.k_sink)?;
        config.retries = self.sink_retries;
        config.timeout = Duration::from_secs(self.sink_timeout_secs);
        Ok(config)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("servicebus_entity_resource_id", &self.servicebus_entity_resource_id)
            .field("servicebus_message_processor", &self.servicebus_message_processor)
            .field("credentials", &self.credentials())
            .field("k_sink", &self.k_sink)
            .field("servicebus_max_concurrent_calls", &self.servicebus_max_concurrent_calls)
            .field("servicebus_receive_timeout_secs", &self.servicebus_receive_timeout_secs)
            .field("sink_retries", &self.sink_retries)
            .field("sink_timeout_secs", &self.sink_timeout_secs)
            .field("log_level", &self.log_level)
            .field("otel_enabled", &self.otel_enabled)
            .field("otel_endpoint", &self.otel_endpoint)
            .field("otel_service_name", &self.otel_service_name)
            .finish()
    }
}
