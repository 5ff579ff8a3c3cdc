//! In-process broker used by tests and local demos.
//!
//! Every operation is appended to a timestamped journal so callers can assert
//! on the order in which the app talked to the broker.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerError, Channel, Connection, ConsumerTag, Delivery, DeliveryCallback, QueueOptions,
};

/// Something the app asked the broker to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    ChannelCreated {
        channel: usize,
    },
    PrefetchSet {
        channel: usize,
        count: u16,
    },
    QueueAsserted {
        channel: usize,
        queue: String,
        durable: bool,
    },
    ConsumeStarted {
        channel: usize,
        queue: String,
        consumer_tag: ConsumerTag,
    },
    ConsumerCancelled {
        channel: usize,
        consumer_tag: ConsumerTag,
    },
    Acked {
        channel: usize,
        delivery_tag: u64,
    },
    Rejected {
        channel: usize,
        delivery_tag: u64,
        requeue: bool,
    },
    ChannelClosed {
        channel: usize,
    },
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub at: Instant,
    pub event: BrokerEvent,
}

struct ActiveConsumer {
    channel: usize,
    queue: String,
    callback: DeliveryCallback,
    buffer: mpsc::UnboundedSender<Delivery>,
    pump: JoinHandle<()>,
}

impl ActiveConsumer {
    /// Stop accepting buffered deliveries and wait until the ones already
    /// buffered have been handed to the callback
    async fn finish(self) -> Result<(), BrokerError> {
        let ActiveConsumer { buffer, pump, .. } = self;
        drop(buffer);
        pump.await
            .map_err(|e| BrokerError::Other(format!("Delivery pump failed: {}", e)))
    }
}

#[derive(Default)]
struct MemoryInner {
    journal: Mutex<Vec<JournalEntry>>,
    queues: Mutex<HashSet<String>>,
    consumers: Mutex<HashMap<ConsumerTag, ActiveConsumer>>,
    failing_queues: Mutex<HashSet<String>>,
    fail_connect: AtomicBool,
    delivery_lag: Mutex<Duration>,
    next_channel: AtomicUsize,
    next_delivery_tag: AtomicU64,
}

impl MemoryInner {
    fn record(&self, event: BrokerEvent) {
        debug!(?event, "Memory broker event");
        lock(&self.journal).push(JournalEntry {
            at: Instant::now(),
            event,
        });
    }

    fn take_consumer(&self, tag: &ConsumerTag) -> Option<ActiveConsumer> {
        lock(&self.consumers).remove(tag)
    }

    fn next_delivery(&self, queue: &str, payload: Vec<u8>) -> Delivery {
        Delivery {
            delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1,
            payload,
            redelivered: false,
            routing_key: queue.to_string(),
        }
    }

    fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if lock(&self.queues).contains(queue) {
            Ok(())
        } else {
            Err(BrokerError::QueueNotFound(queue.to_string()))
        }
    }
}

/// Hand buffered deliveries to `callback` one by one, like a client library
/// reading frames off the socket. Ends once the buffer is closed and empty.
async fn pump_buffered(
    broker: Arc<MemoryInner>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    callback: DeliveryCallback,
) {
    while let Some(delivery) = deliveries.recv().await {
        let lag = *lock(&broker.delivery_lag);
        if !lag.is_zero() {
            tokio::time::sleep(lag).await;
        }
        tokio::spawn(callback(Some(delivery)));
    }
    callback(None).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn no_consumer(queue: &str) -> BrokerError {
    BrokerError::Other(format!("No active consumer on queue '{}'", queue))
}

/// Broker that keeps queues and consumers in memory
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail
    pub fn fail_connect(&self) {
        self.inner.fail_connect.store(true, Ordering::SeqCst);
    }

    /// Make declarations of `queue` fail
    pub fn fail_queue_declaration(&self, queue: &str) {
        lock(&self.inner.failing_queues).insert(queue.to_string());
    }

    /// Delay applied by each consumer's buffer before handing over a delivery
    /// queued with [`enqueue`](Self::enqueue)
    pub fn set_delivery_lag(&self, lag: Duration) {
        *lock(&self.inner.delivery_lag) = lag;
    }

    /// Deliver `payload` to the consumer of `queue`.
    ///
    /// The delivery callback runs before this returns; the returned handle
    /// resolves once the message has been settled.
    pub fn publish(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<JoinHandle<()>, BrokerError> {
        self.inner.ensure_queue(queue)?;

        let callback = lock(&self.inner.consumers)
            .values()
            .find(|c| c.queue == queue)
            .map(|c| c.callback.clone())
            .ok_or_else(|| no_consumer(queue))?;

        let work = callback(Some(self.inner.next_delivery(queue, payload.into())));
        Ok(tokio::spawn(work))
    }

    /// Put `payload` in the consumer's receive buffer and return its delivery
    /// tag. The callback sees it later, after the configured lag. Cancelling
    /// the consumer flushes the buffer to the callback first.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<u64, BrokerError> {
        self.inner.ensure_queue(queue)?;

        let buffer = lock(&self.inner.consumers)
            .values()
            .find(|c| c.queue == queue)
            .map(|c| c.buffer.clone())
            .ok_or_else(|| no_consumer(queue))?;

        let delivery = self.inner.next_delivery(queue, payload.into());
        let delivery_tag = delivery.delivery_tag;
        buffer.send(delivery).map_err(|_| no_consumer(queue))?;
        Ok(delivery_tag)
    }

    /// Serialize `message` as JSON and publish it
    pub fn publish_json<T: Serialize>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<JoinHandle<()>, BrokerError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| BrokerError::Other(e.to_string()))?;
        self.publish(queue, payload)
    }

    /// End the consumer of `queue` from the broker side, as when the queue is
    /// deleted. Returns false if no consumer was attached.
    pub async fn end_consumer(&self, queue: &str) -> bool {
        let tag = lock(&self.inner.consumers)
            .iter()
            .find(|(_, c)| c.queue == queue)
            .map(|(tag, _)| tag.clone());

        match tag.and_then(|tag| self.inner.take_consumer(&tag)) {
            Some(consumer) => {
                if let Err(e) = consumer.finish().await {
                    debug!(queue = %queue, error = %e, "Consumer ended with an error");
                }
                true
            }
            None => false,
        }
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.inner.journal).clone()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.journal().into_iter().map(|entry| entry.event).collect()
    }

    /// Time at which the first event matching `predicate` was recorded
    pub fn first_at(&self, predicate: impl Fn(&BrokerEvent) -> bool) -> Option<Instant> {
        self.journal()
            .into_iter()
            .find(|entry| predicate(&entry.event))
            .map(|entry| entry.at)
    }

    /// Delivery tags acknowledged so far
    pub fn acked(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Acked { delivery_tag, .. } => Some(delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Delivery tags rejected so far, with their requeue flag
    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Rejected {
                    delivery_tag,
                    requeue,
                    ..
                } => Some((delivery_tag, requeue)),
                _ => None,
            })
            .collect()
    }

    /// Number of consumers currently attached to any queue
    pub fn active_consumers(&self) -> usize {
        lock(&self.inner.consumers).len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Other(format!("Connection refused: {}", url)));
        }
        self.inner.record(BrokerEvent::Connected);
        Ok(Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryInner>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = self.broker.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.broker.record(BrokerEvent::ChannelCreated { channel: id });
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.broker.record(BrokerEvent::ConnectionClosed);
        Ok(())
    }
}

struct MemoryChannel {
    id: usize,
    broker: Arc<MemoryInner>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.record(BrokerEvent::PrefetchSet {
            channel: self.id,
            count,
        });
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if lock(&self.broker.failing_queues).contains(queue) {
            return Err(BrokerError::Other(format!(
                "PRECONDITION_FAILED - cannot declare queue '{}'",
                queue
            )));
        }
        lock(&self.broker.queues).insert(queue.to_string());
        self.broker.record(BrokerEvent::QueueAsserted {
            channel: self.id,
            queue: queue.to_string(),
            durable: options.durable,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<ConsumerTag, BrokerError> {
        self.ensure_open()?;
        self.broker.ensure_queue(queue)?;
        let tag = ConsumerTag::new(format!("ctag-{}", Uuid::new_v4()));
        let (buffer, deliveries) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_buffered(self.broker.clone(), deliveries, callback.clone()));
        lock(&self.broker.consumers).insert(
            tag.clone(),
            ActiveConsumer {
                channel: self.id,
                queue: queue.to_string(),
                callback,
                buffer,
                pump,
            },
        );
        self.broker.record(BrokerEvent::ConsumeStarted {
            channel: self.id,
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
        });
        Ok(tag)
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let consumer = self
            .broker
            .take_consumer(tag)
            .ok_or_else(|| BrokerError::UnknownConsumer(tag.to_string()))?;
        self.broker.record(BrokerEvent::ConsumerCancelled {
            channel: self.id,
            consumer_tag: tag.clone(),
        });
        consumer.finish().await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.record(BrokerEvent::Acked {
            channel: self.id,
            delivery_tag,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.record(BrokerEvent::Rejected {
            channel: self.id,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        lock(&self.broker.consumers).retain(|_, consumer| consumer.channel != self.id);
        self.broker.record(BrokerEvent::ChannelClosed { channel: self.id });
        Ok(())
    }
}
