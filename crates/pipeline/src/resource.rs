//! Azure resource identifiers and the Service Bus entity they name.
//!
//! [`AzureResourceId`] is the generic structured form of an Azure Resource
//! Manager ID. [`ServiceBusEntityId`] narrows it to the two entity shapes the
//! source can listen on:
//!
//! ```text
//! /subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.ServiceBus/namespaces/{ns}/queues/{queue}
//! /subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.ServiceBus/namespaces/{ns}/topics/{topic}/subscriptions/{subscription}
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, EntityPath};

/// Resource provider namespace of Azure Service Bus.
pub const RESOURCE_PROVIDER_SERVICE_BUS: &str = "Microsoft.ServiceBus";

const RESOURCE_TYPE_QUEUES: &str = "queues";
const RESOURCE_TYPE_TOPICS: &str = "topics";
const RESOURCE_TYPE_SUBSCRIPTIONS: &str = "subscriptions";

// ---------------------------------------------------------------------------
// Generic resource ID
// ---------------------------------------------------------------------------

/// Structured form of an Azure resource ID.
///
/// Only namespaced resources are representable, which covers every Service
/// Bus entity. `sub_resource_type` and `sub_resource_name` are empty for
/// resources without a child segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AzureResourceId {
    pub subscription_id: String,
    pub resource_group: String,
    /// e.g. `Microsoft.ServiceBus`.
    pub resource_provider: String,
    /// Name of the namespace resource, the segment after the provider.
    pub namespace: String,
    /// `queues` or `topics` for Service Bus entities.
    pub resource_type: String,
    pub resource_name: String,
    /// `subscriptions` for a topic subscription.
    pub sub_resource_type: String,
    pub sub_resource_name: String,
}

impl FromStr for AzureResourceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidResourceId {
            resource_id: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;
        let segments: Vec<&str> = rest.split('/').collect();

        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(invalid("contains an empty segment"));
        }
        if segments.len() != 10 && segments.len() != 12 {
            return Err(invalid("unexpected number of segments"));
        }

        let keyword = |idx: usize, expected: &str| -> Result<(), ConfigError> {
            if segments[idx].eq_ignore_ascii_case(expected) {
                Ok(())
            } else {
                Err(invalid(&format!("expected {expected:?} at segment {}", idx + 1)))
            }
        };
        keyword(0, "subscriptions")?;
        keyword(2, "resourceGroups")?;
        keyword(4, "providers")?;
        keyword(6, "namespaces")?;

        let (sub_resource_type, sub_resource_name) = match segments.get(10..12) {
            Some([t, n]) => (t.to_string(), n.to_string()),
            _ => (String::new(), String::new()),
        };

        Ok(Self {
            subscription_id: segments[1].to_string(),
            resource_group: segments[3].to_string(),
            resource_provider: segments[5].to_string(),
            namespace: segments[7].to_string(),
            resource_type: segments[8].to_string(),
            resource_name: segments[9].to_string(),
            sub_resource_type,
            sub_resource_name,
        })
    }
}

impl TryFrom<String> for AzureResourceId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AzureResourceId> for String {
    fn from(id: AzureResourceId) -> Self {
        id.to_string()
    }
}

impl std::fmt::Display for AzureResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}/namespaces/{}/{}/{}",
            self.subscription_id,
            self.resource_group,
            self.resource_provider,
            self.namespace,
            self.resource_type,
            self.resource_name,
        )?;
        if !self.sub_resource_type.is_empty() {
            write!(f, "/{}/{}", self.sub_resource_type, self.sub_resource_name)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service Bus entity
// ---------------------------------------------------------------------------

/// The kind of Service Bus entity messages are received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A queue.
    Queue {
        /// Queue name.
        name: String,
    },
    /// A subscription of a topic.
    Subscription {
        /// Topic name.
        topic: String,
        /// Subscription name.
        subscription: String,
    },
}

/// A validated reference to a Service Bus queue or topic subscription.
///
/// Constructed once at startup; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceBusEntityId {
    resource_id: AzureResourceId,
    raw: String,
    kind: EntityKind,
}

impl ServiceBusEntityId {
    /// Parses `raw` and validates that it refers to a Service Bus entity.
    ///
    /// Valid iff the provider is `Microsoft.ServiceBus`, the namespace is set,
    /// and either the resource type is `queues` with no child segment, or it is
    /// `topics` with a `subscriptions` child segment.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let resource_id: AzureResourceId = raw.parse()?;

        let unsupported = || ConfigError::UnsupportedEntity {
            resource_id: raw.to_string(),
        };

        if resource_id.resource_provider != RESOURCE_PROVIDER_SERVICE_BUS
            || resource_id.namespace.is_empty()
        {
            return Err(unsupported());
        }

        let kind = match (
            resource_id.resource_type.as_str(),
            resource_id.sub_resource_type.as_str(),
        ) {
            (RESOURCE_TYPE_QUEUES, "") => EntityKind::Queue {
                name: resource_id.resource_name.clone(),
            },
            (RESOURCE_TYPE_TOPICS, RESOURCE_TYPE_SUBSCRIPTIONS)
                if !resource_id.sub_resource_name.is_empty() =>
            {
                EntityKind::Subscription {
                    topic: resource_id.resource_name.clone(),
                    subscription: resource_id.sub_resource_name.clone(),
                }
            }
            _ => return Err(unsupported()),
        };

        Ok(Self {
            resource_id,
            raw: raw.to_string(),
            kind,
        })
    }

    /// The structured resource ID.
    pub fn resource_id(&self) -> &AzureResourceId {
        &self.resource_id
    }

    /// The identifier exactly as configured. Used as the `source` of every
    /// event produced from this entity.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Service Bus namespace name (without the `.servicebus.windows.net` suffix).
    pub fn namespace(&self) -> &str {
        &self.resource_id.namespace
    }

    /// Queue or topic subscription.
    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    /// Path of the entity relative to the namespace endpoint.
    pub fn entity_path(&self) -> EntityPath {
        let path = match &self.kind {
            EntityKind::Queue { name } => name.clone(),
            EntityKind::Subscription {
                topic,
                subscription,
            } => format!("{topic}/Subscriptions/{subscription}"),
        };
        // Segments are non-empty by construction.
        EntityPath(path)
    }
}

impl FromStr for ServiceBusEntityId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ServiceBusEntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/my-rg/providers";

    fn id(tail: &str) -> String {
        format!("{PREFIX}/{tail}")
    }

    #[test]
    fn test_queue_entity_path_is_queue_name() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/queues/q1");
        let entity = ServiceBusEntityId::parse(&raw).unwrap();

        assert_eq!(entity.entity_path().as_str(), "q1");
        assert_eq!(entity.namespace(), "ns1");
        assert_eq!(entity.as_str(), raw);
        assert_eq!(
            entity.kind(),
            &EntityKind::Queue {
                name: "q1".to_string()
            }
        );
    }

    #[test]
    fn test_subscription_entity_path() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/topics/t1/subscriptions/s1");
        let entity = ServiceBusEntityId::parse(&raw).unwrap();

        assert_eq!(entity.entity_path().as_str(), "t1/Subscriptions/s1");
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let raw = "/SUBSCRIPTIONS/s/resourcegroups/rg/Providers/Microsoft.ServiceBus/Namespaces/ns/queues/q";
        let entity = ServiceBusEntityId::parse(raw).unwrap();
        assert_eq!(entity.entity_path().as_str(), "q");
        // Source stays verbatim.
        assert_eq!(entity.to_string(), raw);
    }

    #[test]
    fn test_queue_with_sub_resource_is_rejected() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/queues/q1/subscriptions/s1");
        assert!(matches!(
            ServiceBusEntityId::parse(&raw),
            Err(ConfigError::UnsupportedEntity { .. })
        ));
    }

    #[test]
    fn test_topic_without_subscription_is_rejected() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/topics/t1");
        assert!(matches!(
            ServiceBusEntityId::parse(&raw),
            Err(ConfigError::UnsupportedEntity { .. })
        ));
    }

    #[test]
    fn test_topic_with_other_sub_resource_is_rejected() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/topics/t1/authorizationRules/r1");
        assert!(matches!(
            ServiceBusEntityId::parse(&raw),
            Err(ConfigError::UnsupportedEntity { .. })
        ));
    }

    #[test]
    fn test_other_resource_types_are_rejected() {
        for tail in [
            "Microsoft.ServiceBus/namespaces/ns1/eventhubs/e1",
            "Microsoft.ServiceBus/namespaces/ns1/authorizationRules/r1",
        ] {
            assert!(
                matches!(
                    ServiceBusEntityId::parse(&id(tail)),
                    Err(ConfigError::UnsupportedEntity { .. })
                ),
                "{tail} should be rejected"
            );
        }
    }

    #[test]
    fn test_other_provider_is_rejected() {
        let raw = id("Microsoft.EventHub/namespaces/ns1/queues/q1");
        assert!(matches!(
            ServiceBusEntityId::parse(&raw),
            Err(ConfigError::UnsupportedEntity { .. })
        ));
    }

    #[test]
    fn test_malformed_ids_fail_to_parse() {
        for raw in [
            "",
            "not-a-resource-id",
            "subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns/queues/q",
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns/queues",
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns/queues/q/",
            "/subscriptions/s/resourceGroups//providers/Microsoft.ServiceBus/namespaces/ns/queues/q",
            "/subscriptions/s/groups/rg/providers/Microsoft.ServiceBus/namespaces/ns/queues/q",
        ] {
            assert!(
                matches!(
                    ServiceBusEntityId::parse(raw),
                    Err(ConfigError::InvalidResourceId { .. })
                ),
                "{raw:?} should not parse"
            );
        }
    }

    #[test]
    fn test_resource_id_serde_uses_string_form() {
        let raw = id("Microsoft.ServiceBus/namespaces/ns1/topics/t1/subscriptions/s1");
        let parsed: AzureResourceId =
            serde_json::from_value(serde_json::Value::String(raw.clone())).unwrap();

        assert_eq!(parsed.sub_resource_name, "s1");
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }
}
