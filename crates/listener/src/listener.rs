//! The receive loop.
//!
//! [`Listener::start`] pulls deliveries from a [`MessageReceiver`] and runs
//! each one through the [`MessageHandler`] on its own task, with at most
//! `max_concurrent_calls` handlers in flight. Per-message failures go to the
//! [`HandlingObserver`] and never stop the loop. The loop ends when the
//! cancellation token fires or the receiver reports a fatal broker error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{BrokerError, Delivery, HandlingObserver, HandlingOutcome, MessageHandler};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace, warn};

/// Source of broker deliveries.
///
/// `Ok(None)` means the broker had nothing to hand out this time.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError>;
}

/// Error that ended the receive loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("broker connection terminated: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Upper bound on messages handled at the same time. Zero is treated as one.
    pub max_concurrent_calls: usize,
    /// Pause after a transient receive error.
    pub error_backoff: Duration,
    /// How long a stopping listener waits for in-flight handlers before
    /// aborting them. Aborted messages are not completed.
    pub drain_timeout: Duration,
}

/// Grace period for in-flight handlers on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            error_backoff: Duration::from_secs(1),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Lifecycle of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, [`Listener::start`] not called yet.
    Idle,
    /// Receiving messages.
    Listening,
    /// The loop has ended and in-flight handlers have finished or been aborted.
    Stopped,
}

pub struct Listener {
    receiver: Arc<dyn MessageReceiver>,
    handler: MessageHandler,
    observer: Arc<dyn HandlingObserver>,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    pub fn new(
        receiver: Arc<dyn MessageReceiver>,
        handler: MessageHandler,
        observer: Arc<dyn HandlingObserver>,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            receiver,
            handler,
            observer,
            config,
            state,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watches state transitions; stays valid after [`Listener::start`]
    /// consumes the listener.
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Runs the receive loop until `shutdown` is cancelled (returns `Ok`) or
    /// the broker connection fails for good (returns the error). Handlers
    /// already in flight get `drain_timeout` to finish; the rest are aborted
    /// and their messages stay uncompleted.
    #[instrument(name = "listener", skip_all)]
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), ListenerError> {
        self.state.send_replace(ListenerState::Listening);
        let concurrency = self.config.max_concurrent_calls.max(1);
        info!(max_concurrent_calls = concurrency, "listening for messages");

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        let result = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_failure(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                received = self.receiver.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let handler = self.handler.clone();
                    let observer = Arc::clone(&self.observer);
                    tasks.spawn(async move {
                        let message_id = Some(delivery.message.id.clone());
                        let result = handler.handle(Some(delivery)).await;
                        observer.on_handled(&HandlingOutcome { message_id, result });
                        drop(permit);
                    });
                }
                Ok(None) => trace!("no message available"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "broker connection failed");
                    break Err(ListenerError::Broker(e));
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?self.config.error_backoff, "receive failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        };

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight messages");
        }
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                log_join_failure(joined);
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
            warn!(
                aborted = tasks.len(),
                drain_timeout = ?self.config.drain_timeout,
                "in-flight messages did not finish in time, aborting"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                log_join_failure(joined);
            }
        }

        self.state.send_replace(ListenerState::Stopped);
        info!("listener stopped");
        result
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => trace!("message handler aborted"),
        Err(e) => error!(error = %e, "message handler task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{
        DefaultMessageProcessor, EventEnvelope, EventSender, MessageId, MockCompletionHandle,
        MockEventSender, MockHandlingObserver, RawMessage, SendError,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SOURCE: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns1/queues/q1";

    fn handler() -> MessageHandler {
        let mut sender = MockEventSender::new();
        sender.expect_send().returning(|_| Ok(()));
        MessageHandler::new(Arc::new(DefaultMessageProcessor::new(SOURCE)), Arc::new(sender))
    }

    fn delivery(id: &str) -> Delivery {
        let mut completion = MockCompletionHandle::new();
        completion.expect_complete().times(1).returning(|| Ok(()));
        Delivery::new(
            RawMessage::new(MessageId::new(id).unwrap(), b"{}".to_vec()),
            Box::new(completion),
        )
    }

    fn fast() -> ListenerConfig {
        ListenerConfig {
            max_concurrent_calls: 2,
            error_backoff: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Hands out one message, then blocks until the listener stops asking.
    struct SingleDelivery {
        delivered: AtomicBool,
    }

    #[async_trait]
    impl MessageReceiver for SingleDelivery {
        async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
            if self.delivered.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let mut completion = MockCompletionHandle::new();
            completion.expect_complete().never();
            Ok(Some(Delivery::new(
                RawMessage::new(MessageId::new("stuck").unwrap(), b"{}".to_vec()),
                Box::new(completion),
            )))
        }
    }

    struct HangingSender;

    #[async_trait]
    impl EventSender for HangingSender {
        async fn send(&self, _event: &EventEnvelope) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fatal_broker_error_stops_listener() {
        let mut receiver = MockMessageReceiver::new();
        receiver
            .expect_receive()
            .returning(|| Err(BrokerError::Fatal("unauthorized".to_string())));
        let mut observer = MockHandlingObserver::new();
        observer.expect_on_handled().never();
        let listener = Listener::new(Arc::new(receiver), handler(), Arc::new(observer), fast());
        let states = listener.subscribe_state();

        let result = listener.start(CancellationToken::new()).await;

        assert_eq!(
            result,
            Err(ListenerError::Broker(BrokerError::Fatal("unauthorized".to_string())))
        );
        assert_eq!(*states.borrow(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_transient_errors_and_empty_receives_keep_listening() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let mut receiver = MockMessageReceiver::new();
        {
            let calls = Arc::clone(&calls);
            let shutdown = shutdown.clone();
            receiver.expect_receive().returning(move || {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(BrokerError::Transient("busy".to_string())),
                    1 => Ok(None),
                    2 => Ok(Some(delivery("m1"))),
                    _ => {
                        shutdown.cancel();
                        Ok(None)
                    }
                }
            });
        }
        let mut observer = MockHandlingObserver::new();
        observer
            .expect_on_handled()
            .withf(|o| o.message_id.as_ref().map(MessageId::as_str) == Some("m1") && o.result.is_ok())
            .times(1)
            .return_const(());
        let listener = Listener::new(Arc::new(receiver), handler(), Arc::new(observer), fast());

        let result = listener.start(shutdown).await;

        assert_eq!(result, Ok(()));
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_returns_immediately() {
        let mut receiver = MockMessageReceiver::new();
        receiver.expect_receive().never();
        let listener = Listener::new(
            Arc::new(receiver),
            handler(),
            Arc::new(MockHandlingObserver::new()),
            fast(),
        );
        assert_eq!(listener.state(), ListenerState::Idle);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(listener.start(shutdown).await, Ok(()));
    }

    #[tokio::test]
    async fn test_stop_aborts_handlers_that_outlive_the_drain_timeout() {
        let receiver = SingleDelivery {
            delivered: AtomicBool::new(false),
        };
        let handler = MessageHandler::new(
            Arc::new(DefaultMessageProcessor::new(SOURCE)),
            Arc::new(HangingSender),
        );
        let mut observer = MockHandlingObserver::new();
        observer.expect_on_handled().never();
        let config = ListenerConfig {
            drain_timeout: Duration::from_millis(200),
            ..fast()
        };
        let listener = Listener::new(Arc::new(receiver), handler, Arc::new(observer), config);
        let states = listener.subscribe_state();

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(3), listener.start(shutdown)).await;

        assert_eq!(result, Ok(Ok(())));
        assert_eq!(*states.borrow(), ListenerState::Stopped);
    }

    #[test]
    fn test_default_config_handles_one_message_at_a_time() {
        let config = ListenerConfig::default();
        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }
}
