//! Best-effort correction of known event defects.
//!
//! Azure Event Grid emits CloudEvents with `"dataschema": "#"`, which is not an
//! absolute URI and fails validation. Such events are still worth delivering,
//! so the attribute is dropped rather than the event.

use tracing::debug;

use crate::{EventEnvelope, ValidationFailure};

/// Applies every known fix for the attributes listed in `failure` and returns
/// the corrected event.
///
/// Attributes without a known fix are left untouched; the result is not
/// validated again.
pub fn sanitize(failure: &ValidationFailure, mut event: EventEnvelope) -> EventEnvelope {
    for attribute in failure.attributes() {
        if attribute == "dataschema" {
            debug!(event_id = %event.id, "clearing invalid dataschema attribute");
            event.dataschema = None;
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_dataschema_is_cleared() {
        let event = EventEnvelope::new("e1", "/s", "t").with_dataschema("#");
        let failure = event.validate().unwrap_err();

        let fixed = sanitize(&failure, event.clone());

        assert_eq!(fixed.dataschema, None);
        assert_eq!(fixed.id, event.id);
        assert_eq!(fixed.validate(), Ok(()));
    }

    #[test]
    fn test_attributes_without_fix_are_left_alone() {
        let event = EventEnvelope::new("", "/s", "t").with_dataschema("#");
        let failure = event.validate().unwrap_err();

        let fixed = sanitize(&failure, event);

        assert_eq!(fixed.dataschema, None);
        assert_eq!(fixed.id, "");
        assert!(fixed.validate().unwrap_err().contains("id"));
    }

    #[test]
    fn test_valid_dataschema_is_kept_when_not_reported() {
        let event = EventEnvelope::new("", "/s", "t")
            .with_dataschema("https://example.com/schema");
        let failure = event.validate().unwrap_err();

        let fixed = sanitize(&failure, event);
        assert_eq!(fixed.dataschema.as_deref(), Some("https://example.com/schema"));
    }
}
