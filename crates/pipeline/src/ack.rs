//! Settlement of a message once its events have been dispatched.
//!
//! A message is completed only when every event derived from it reached the
//! sink. Otherwise it is left locked; the broker makes it available again when
//! the lock expires, which gives at-least-once delivery without an explicit
//! abandon call.

use tracing::debug;

use crate::{Delivery, ErrorBatch, HandleError};

/// Completes the message if `errors` is empty, or reports the send failures.
///
/// A missing delivery is a no-op.
pub async fn finalize(delivery: Option<&Delivery>, errors: ErrorBatch) -> Result<(), HandleError> {
    let Some(delivery) = delivery else {
        return Ok(());
    };

    if !errors.is_empty() {
        debug!(
            message_id = %delivery.message.id,
            failed_events = errors.len(),
            "leaving message unsettled for redelivery"
        );
        return Err(HandleError::Delivery(errors));
    }

    delivery
        .completion
        .complete()
        .await
        .map_err(|source| HandleError::Acknowledgment {
            message_id: delivery.message.id.clone(),
            source,
        })?;

    debug!(message_id = %delivery.message.id, "message completed");
    Ok(())
}
