use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a broker implementation
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Connection is closed")]
    ConnectionClosed,
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
    #[error("Unknown consumer tag: {0}")]
    UnknownConsumer(String),
    #[error("Broker error: {0}")]
    Other(String),
}

/// Opaque identifier assigned by the broker when delivery starts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options used when declaring a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive a broker restart
    pub durable: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self { durable: true }
    }
}

/// A message handed to a consumer by the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub routing_key: String,
}

/// Callback invoked for every delivery on a consumer.
///
/// `None` signals that the broker ended the consumer. Implementations must
/// call the callback synchronously for each delivery and may then drive the
/// returned future however they like; the callback does its bookkeeping
/// before returning the future.
pub type DeliveryCallback = Arc<dyn Fn(Option<Delivery>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Entry point of a broker client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection to the broker at `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A broker session shared by all channels created from it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel multiplexed over this connection
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session used by exactly one consumer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Limit the number of unacknowledged deliveries on this channel
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Declare a queue, creating it if it does not exist
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Start delivering messages from `queue` to `callback`
    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<ConsumerTag, BrokerError>;

    /// Stop the consumer identified by `tag`. Deliveries already handed out keep processing.
    /// Must not resolve before every delivery received ahead of the cancel has
    /// gone through the callback.
    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError>;

    /// Acknowledge a delivery, removing it from the queue
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery, either returning it to the queue or dead-lettering it
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel
    async fn close(&self) -> Result<(), BrokerError>;
}
