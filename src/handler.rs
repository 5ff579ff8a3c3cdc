use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info_span, trace, warn, Instrument, Span};

use crate::broker::{Channel, Delivery, DeliveryCallback};
use crate::config::{ConsumersConfig, RejectPolicy};
use crate::consumer::ConsumerState;

/// Failure reported by a message handler.
///
/// The variant carries the requeue intent: transient failures go back on the
/// queue, permanent ones are rejected without requeueing so the broker can
/// dead-letter them.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Transient error (will requeue): {0}")]
    Transient(anyhow::Error),
    #[error("Permanent error (will not requeue): {0}")]
    Permanent(anyhow::Error),
}

impl HandlerError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        HandlerError::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        HandlerError::Permanent(error.into())
    }

    pub fn requeue(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Plain errors raised with `?` are treated as permanent
impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Permanent(error)
    }
}

/// Everything a handler gets besides the decoded payload
pub struct MessageContext<C> {
    /// Queue the message was consumed from
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Span carrying `queue` and `delivery_tag`; events emitted while the
    /// handler runs are recorded inside it
    pub span: Span,
    /// Shared application context passed to `AppBuilder::build`
    pub context: Arc<C>,
}

impl<C> MessageContext<C> {
    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[derive(Debug)]
pub(crate) enum ProcessingError {
    Decode(serde_json::Error),
    Handler(HandlerError),
}

pub(crate) type ErasedHandler<C> = Arc<
    dyn Fn(Vec<u8>, MessageContext<C>) -> BoxFuture<'static, Result<(), ProcessingError>>
        + Send
        + Sync,
>;

/// A queue name paired with the handler that processes its messages
pub struct QueueDefinition<C> {
    queue: String,
    handler: ErasedHandler<C>,
}

impl<C: Send + Sync + 'static> QueueDefinition<C> {
    /// Register `handler` for `queue`. Payloads are decoded from JSON into `T`
    /// before the handler runs; the handler's success value is ignored.
    pub fn new<T, R, F, Fut>(queue: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Send + 'static,
        F: Fn(T, MessageContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler<C> = Arc::new(move |payload: Vec<u8>, ctx: MessageContext<C>| {
            let handler = handler.clone();
            Box::pin(async move {
                let decoded: T =
                    serde_json::from_slice(&payload).map_err(ProcessingError::Decode)?;
                handler(decoded, ctx)
                    .await
                    .map(|_| ())
                    .map_err(ProcessingError::Handler)
            }) as BoxFuture<'static, Result<(), ProcessingError>>
        });

        Self {
            queue: queue.into(),
            handler: erased,
        }
    }
}

impl<C> QueueDefinition<C> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn into_parts(self) -> (String, ErasedHandler<C>) {
        (self.queue, self.handler)
    }
}

impl<C> std::fmt::Debug for QueueDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Reject policies for failures that carry no requeue intent of their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub decode_failure: RejectPolicy,
    pub handler_panic: RejectPolicy,
}

impl From<&ConsumersConfig> for FailurePolicy {
    fn from(config: &ConsumersConfig) -> Self {
        Self {
            decode_failure: config.decode_failure,
            handler_panic: config.handler_panic,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::from(&ConsumersConfig::default())
    }
}

/// Acknowledgment decision for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Wrap `handler` into the callback handed to the broker for `queue`.
///
/// Every `Some(delivery)` is counted as in flight before the callback returns
/// and stays counted until the ack or reject has been sent, whatever the
/// handler does. `None` means the broker ended the consumer and is not work.
pub(crate) fn with_message_handling<C: Send + Sync + 'static>(
    queue: String,
    handler: ErasedHandler<C>,
    context: Arc<C>,
    state: Arc<ConsumerState>,
    channel: Arc<dyn Channel>,
    policy: FailurePolicy,
) -> DeliveryCallback {
    Arc::new(move |delivery: Option<Delivery>| {
        let Some(delivery) = delivery else {
            if state.is_shutting_down() {
                debug!(queue = %queue, "Consumer ended");
            } else {
                warn!(queue = %queue, "Consumer cancelled by broker");
            }
            return futures::future::ready(()).boxed();
        };

        let guard = state.track_message();

        let span = info_span!("message", queue = %queue, delivery_tag = delivery.delivery_tag);
        let ctx = MessageContext {
            queue: queue.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            routing_key: delivery.routing_key.clone(),
            span: span.clone(),
            context: context.clone(),
        };
        let handler = handler.clone();
        let channel = channel.clone();

        async move {
            let _guard = guard;
            let delivery_tag = delivery.delivery_tag;
            let start_time = Instant::now();

            let outcome = AssertUnwindSafe(async move { handler(delivery.payload, ctx).await })
                .catch_unwind()
                .await;

            let disposition = decide(outcome, policy);
            trace!(
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                ?disposition,
                "Message processed"
            );

            settle(channel.as_ref(), delivery_tag, disposition).await;
        }
        .instrument(span)
        .boxed()
    })
}

/// Turn a handler outcome into an acknowledgment decision, logging failures
fn decide(
    outcome: Result<Result<(), ProcessingError>, Box<dyn Any + Send>>,
    policy: FailurePolicy,
) -> Disposition {
    match outcome {
        Ok(Ok(())) => Disposition::Ack,
        Ok(Err(ProcessingError::Decode(e))) => {
            warn!(error = %e, "Failed to decode message payload");
            Disposition::Reject {
                requeue: policy.decode_failure.requeue(),
            }
        }
        Ok(Err(ProcessingError::Handler(e))) => {
            error!(error = %e, "Message handler failed");
            Disposition::Reject {
                requeue: e.requeue(),
            }
        }
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "Message handler panicked");
            Disposition::Reject {
                requeue: policy.handler_panic.requeue(),
            }
        }
    }
}

async fn settle(channel: &dyn Channel, delivery_tag: u64, disposition: Disposition) {
    match disposition {
        Disposition::Ack => match channel.ack(delivery_tag).await {
            Ok(()) => trace!("Message acknowledged"),
            Err(e) => error!(error = %e, "Failed to acknowledge message"),
        },
        Disposition::Reject { requeue } => match channel.reject(delivery_tag, requeue).await {
            Ok(()) => debug!(requeue, "Message rejected"),
            Err(e) => error!(error = %e, requeue, "Failed to reject message"),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockChannel;
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u32,
    }

    fn delivery(tag: u64, payload: &str) -> Delivery {
        Delivery {
            delivery_tag: tag,
            payload: payload.as_bytes().to_vec(),
            redelivered: false,
            routing_key: "orders.created".to_string(),
        }
    }

    fn wrap(
        definition: QueueDefinition<()>,
        state: Arc<ConsumerState>,
        channel: MockChannel,
        policy: FailurePolicy,
    ) -> DeliveryCallback {
        let (queue, handler) = definition.into_parts();
        with_message_handling(queue, handler, Arc::new(()), state, Arc::new(channel), policy)
    }

    #[tokio::test]
    async fn test_success_acknowledges_and_releases_slot() {
        let mut channel = MockChannel::new();
        channel.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        channel.expect_reject().times(0);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let definition = QueueDefinition::new("orders", move |order: Order, ctx: MessageContext<()>| {
            let seen = seen_clone.clone();
            async move {
                assert_eq!(ctx.queue, "orders");
                assert_eq!(ctx.delivery_tag, 7);
                assert_eq!(ctx.routing_key, "orders.created");
                seen.store(order.id as usize, Ordering::SeqCst);
                Ok::<_, HandlerError>("ignored")
            }
        });

        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(Some(delivery(7, r#"{"id": 42}"#))).await;

        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_slot_taken_before_future_is_polled() {
        let mut channel = MockChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));

        let definition =
            QueueDefinition::new("orders", |_: Order, _: MessageContext<()>| async { Ok::<_, HandlerError>(()) });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        let pending = callback(Some(delivery(1, r#"{"id": 1}"#)));
        assert_eq!(state.in_flight_messages(), 1);

        pending.await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_requeues() {
        let mut channel = MockChannel::new();
        channel.expect_ack().times(0);
        channel
            .expect_reject()
            .with(eq(3), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let definition = QueueDefinition::new("orders", |_: Order, _: MessageContext<()>| async {
            Err::<(), _>(HandlerError::transient(anyhow!("database unavailable")))
        });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(Some(delivery(3, r#"{"id": 1}"#))).await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_requeued() {
        let mut channel = MockChannel::new();
        channel
            .expect_reject()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let definition = QueueDefinition::new("orders", |_: Order, _: MessageContext<()>| async {
            Err::<(), _>(HandlerError::from(anyhow!("invalid order")))
        });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(Some(delivery(4, r#"{"id": 1}"#))).await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_follows_policy() {
        let mut channel = MockChannel::new();
        channel
            .expect_reject()
            .with(eq(5), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let definition = QueueDefinition::new("orders", move |_: Order, _: MessageContext<()>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        });
        let policy = FailurePolicy {
            decode_failure: RejectPolicy::Requeue,
            handler_panic: RejectPolicy::DeadLetter,
        };
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, policy);

        callback(Some(delivery(5, "not json"))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_rejected() {
        let mut channel = MockChannel::new();
        channel
            .expect_reject()
            .with(eq(6), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let definition = QueueDefinition::new("orders", |order: Order, _: MessageContext<()>| async move {
            if order.id > 0 {
                panic!("unexpected order {}", order.id);
            }
            Ok::<_, HandlerError>(())
        });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(Some(delivery(6, r#"{"id": 9}"#))).await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_panic_while_creating_future_is_contained() {
        let mut channel = MockChannel::new();
        channel
            .expect_reject()
            .with(eq(8), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let definition = QueueDefinition::new(
            "orders",
            |_: Order, _: MessageContext<()>| -> futures::future::Ready<Result<(), HandlerError>> {
                panic!("handler refused to start")
            },
        );
        let policy = FailurePolicy {
            decode_failure: RejectPolicy::DeadLetter,
            handler_panic: RejectPolicy::Requeue,
        };
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, policy);

        callback(Some(delivery(8, r#"{"id": 1}"#))).await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_failed_ack_still_releases_slot() {
        let mut channel = MockChannel::new();
        channel
            .expect_ack()
            .times(1)
            .returning(|_| Err(crate::broker::BrokerError::ChannelClosed));

        let definition =
            QueueDefinition::new("orders", |_: Order, _: MessageContext<()>| async { Ok::<_, HandlerError>(()) });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(Some(delivery(1, r#"{"id": 1}"#))).await;
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_signal_is_not_work() {
        let mut channel = MockChannel::new();
        channel.expect_ack().times(0);
        channel.expect_reject().times(0);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let definition = QueueDefinition::new("orders", move |_: Order, _: MessageContext<()>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        callback(None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_are_counted() {
        let mut channel = MockChannel::new();
        channel.expect_ack().times(3).returning(|_| Ok(()));

        let definition = QueueDefinition::new("orders", |_: Order, _: MessageContext<()>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, HandlerError>(())
        });
        let state = Arc::new(ConsumerState::new());
        let callback = wrap(definition, state.clone(), channel, FailurePolicy::default());

        let handles: Vec<_> = (1..=3)
            .map(|tag| tokio::spawn(callback(Some(delivery(tag, r#"{"id": 1}"#)))))
            .collect();
        assert_eq!(state.in_flight_messages(), 3);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(state.in_flight_messages(), 0);
    }

    #[test]
    fn test_handler_error_requeue_intent() {
        assert!(HandlerError::transient(anyhow!("retry me")).requeue());
        assert!(!HandlerError::permanent(anyhow!("poison")).requeue());
        assert!(!HandlerError::from(anyhow!("plain")).requeue());
    }

    #[test]
    fn test_panic_message_extraction() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(17u8);

        assert_eq!(panic_message(from_str.as_ref()), "boom");
        assert_eq!(panic_message(from_string.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_queue_definition_exposes_name() {
        let definition =
            QueueDefinition::new("invoices", |_: serde_json::Value, _: MessageContext<()>| async {
                Ok::<_, HandlerError>(())
            });
        assert_eq!(definition.queue(), "invoices");
    }
}
