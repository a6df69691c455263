//! Per-message handling: process, dispatch, finalize.

use std::sync::Arc;

use tracing::{debug, error, instrument, Span};

use crate::{finalize, Delivery, Dispatcher, EventSender, HandleError, MessageId, MessageProcessor};

/// Runs one message through the processor, the dispatcher and the
/// acknowledgment step, strictly in that order.
///
/// Holds no per-message state; one handler serves every concurrent delivery.
#[derive(Clone)]
pub struct MessageHandler {
    processor: Arc<dyn MessageProcessor>,
    dispatcher: Dispatcher,
}

impl MessageHandler {
    pub fn new(processor: Arc<dyn MessageProcessor>, sender: Arc<dyn EventSender>) -> Self {
        Self {
            processor,
            dispatcher: Dispatcher::new(sender),
        }
    }

    /// Handles one delivery.
    ///
    /// A processing error returns immediately and leaves the message
    /// unsettled. Otherwise the events are dispatched and the message is
    /// finalized whatever the dispatch outcome. `None` (an empty notification
    /// from the broker) is a no-op.
    #[instrument(skip_all, fields(message_id = tracing::field::Empty))]
    pub async fn handle(&self, delivery: Option<Delivery>) -> Result<(), HandleError> {
        let Some(delivery) = delivery else {
            return Ok(());
        };
        Span::current().record("message_id", delivery.message.id.as_str());

        debug!(
            body_size = delivery.message.body.len(),
            delivery_count = delivery.message.delivery_count,
            "processing message"
        );
        let events = self.processor.process(&delivery.message)?;

        debug!(event_count = events.len(), "dispatching events");
        let errors = self.dispatcher.dispatch(events).await;

        debug!(failed_events = errors.len(), "finalizing message");
        finalize(Some(&delivery), errors).await
    }
}

/// Result of handling one delivery, as reported to a [`HandlingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandlingOutcome {
    /// ID of the handled message; `None` for an empty notification.
    pub message_id: Option<MessageId>,
    /// What [`MessageHandler::handle`] returned.
    pub result: Result<(), HandleError>,
}

/// Receives the outcome of every handled delivery.
///
/// Per-message failures never stop the listener; this is where they surface.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait HandlingObserver: Send + Sync {
    fn on_handled(&self, outcome: &HandlingOutcome);
}

/// Logs failed deliveries at error level and successful ones at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl HandlingObserver for LoggingObserver {
    fn on_handled(&self, outcome: &HandlingOutcome) {
        let message_id = outcome
            .message_id
            .as_ref()
            .map(MessageId::as_str)
            .unwrap_or_default();
        match &outcome.result {
            Ok(()) => debug!(message_id, "message handled"),
            Err(e) => error!(message_id, error = %e, "error handling message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DefaultMessageProcessor, EventEnvelope, MockCompletionHandle, MockEventSender,
        MockMessageProcessor, ProcessingError, RawMessage, SendError,
    };
    use mockall::predicate::function;

    const SOURCE: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns1/queues/q1";

    fn delivery(id: &str, body: &[u8], completion: MockCompletionHandle) -> Delivery {
        Delivery::new(
            RawMessage::new(MessageId::new(id).unwrap(), body.to_vec()),
            Box::new(completion),
        )
    }

    #[tokio::test]
    async fn test_default_processor_end_to_end() {
        let mut sender = MockEventSender::new();
        sender
            .expect_send()
            .with(function(|e: &EventEnvelope| e.id == "m1" && e.source == SOURCE))
            .times(1)
            .returning(|_| Ok(()));
        let mut completion = MockCompletionHandle::new();
        completion.expect_complete().times(1).returning(|| Ok(()));
        let handler = MessageHandler::new(
            Arc::new(DefaultMessageProcessor::new(SOURCE)),
            Arc::new(sender),
        );

        let result = handler
            .handle(Some(delivery("m1", br#"{"x":1}"#, completion)))
            .await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_one_failed_send_prevents_completion() {
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().returning(|_| {
            Ok(vec![
                EventEnvelope::new("e1", SOURCE, "t"),
                EventEnvelope::new("e2", SOURCE, "t"),
            ])
        });
        let mut sender = MockEventSender::new();
        sender.expect_send().times(2).returning(|e| {
            if e.id == "e2" {
                Err(SendError::Transport("timeout".to_string()))
            } else {
                Ok(())
            }
        });
        let mut completion = MockCompletionHandle::new();
        completion.expect_complete().never();
        let handler = MessageHandler::new(Arc::new(processor), Arc::new(sender));

        let result = handler.handle(Some(delivery("m1", b"", completion))).await;

        match result {
            Err(HandleError::Delivery(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors.failures()[0].event_id, "e2");
                assert_eq!(errors.failures()[0].cause.to_string(), "timeout");
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_processing_error_skips_dispatch_and_completion() {
        let mut processor = MockMessageProcessor::new();
        processor
            .expect_process()
            .returning(|m| Err(ProcessingError::new(m.id.clone(), "unsupported content")));
        let mut sender = MockEventSender::new();
        sender.expect_send().never();
        let mut completion = MockCompletionHandle::new();
        completion.expect_complete().never();
        let handler = MessageHandler::new(Arc::new(processor), Arc::new(sender));

        let result = handler.handle(Some(delivery("m1", b"?", completion))).await;

        assert!(matches!(result, Err(HandleError::Processing(e)) if e.message_id.as_str() == "m1"));
    }

    #[tokio::test]
    async fn test_message_without_events_is_completed() {
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().returning(|_| Ok(Vec::new()));
        let mut sender = MockEventSender::new();
        sender.expect_send().never();
        let mut completion = MockCompletionHandle::new();
        completion.expect_complete().times(1).returning(|| Ok(()));
        let handler = MessageHandler::new(Arc::new(processor), Arc::new(sender));

        let result = handler.handle(Some(delivery("m1", b"[]", completion))).await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_empty_notification_has_no_side_effects() {
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().never();
        let mut sender = MockEventSender::new();
        sender.expect_send().never();
        let handler = MessageHandler::new(Arc::new(processor), Arc::new(sender));

        assert_eq!(handler.handle(None).await, Ok(()));
    }

    /// Log sink shared between the subscriber and the assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_logging_observer_logs_failures_as_errors() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let observer = LoggingObserver;
            observer.on_handled(&HandlingOutcome {
                message_id: MessageId::new("m0"),
                result: Ok(()),
            });
            observer.on_handled(&HandlingOutcome {
                message_id: MessageId::new("m1"),
                result: Err(HandleError::Delivery(Default::default())),
            });
        });

        let output = logs.contents();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("DEBUG"));
        assert!(lines[0].contains("message handled"));
        assert!(lines[0].contains("m0"));
        assert!(lines[1].contains("ERROR"));
        assert!(lines[1].contains("error handling message"));
        assert!(lines[1].contains("m1"));
    }
}
