//! Newtype identifiers.
//!
//! Broker-assigned names are wrapped in distinct newtypes so a message ID can
//! never be passed where an entity path is expected, even though both are
//! strings under the hood.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An identifier was given an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} must not be empty")]
pub struct EmptyIdentifier {
    /// Name of the identifier type.
    pub kind: &'static str,
}

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display, and
// String conversions that serde goes through so empty values never decode.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub(crate) String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = EmptyIdentifier;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value).ok_or(EmptyIdentifier {
                    kind: stringify!($name),
                })
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id! {
    /// Identifies a Service Bus message.
    ///
    /// Assigned by the sender of the message (or by the broker when the sender
    /// did not set one). Redelivered messages keep their ID.
    MessageId
}

string_id! {
    /// Path of a Service Bus entity relative to its namespace endpoint.
    ///
    /// `"{queue}"` for queues, `"{topic}/Subscriptions/{subscription}"` for
    /// topic subscriptions.
    EntityPath
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_identifier_is_rejected() {
        assert!(MessageId::new("").is_none());
        assert!(EntityPath::new(String::new()).is_none());
    }

    #[test]
    fn test_identifier_display_matches_value() {
        let id = MessageId::new("m1").unwrap();
        assert_eq!(id.as_str(), "m1");
        assert_eq!(id.to_string(), "m1");
    }

    #[test]
    fn test_empty_identifier_does_not_deserialize() {
        let err = serde_json::from_str::<MessageId>(r#""""#).unwrap_err();
        assert!(err.to_string().contains("MessageId must not be empty"));
        assert!(serde_json::from_str::<EntityPath>(r#""""#).is_err());
    }

    #[test]
    fn test_identifier_serializes_as_plain_string() {
        let id: MessageId = serde_json::from_str(r#""m1""#).unwrap();
        assert_eq!(id.as_str(), "m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""m1""#);
    }
}
