use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerError, Channel, Connection, ConsumerTag, Delivery, DeliveryCallback, QueueOptions,
};

const REPLY_SUCCESS: u16 = 200;

/// [`Broker`] backed by a real AMQP 0-9-1 server through lapin
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    client_name: String,
}

impl AmqpBroker {
    /// `client_name` is shown in the broker management UI, suffixed with a unique id
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let name = format!("{}-{}", self.client_name, Uuid::new_v4());
        let properties = ConnectionProperties::default().with_connection_name(name.clone().into());
        let connection = lapin::Connection::connect(url, properties).await?;
        info!(connection_name = %name, "AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            pumps: Mutex::new(HashMap::new()),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    /// Delivery pump per consumer; it ends once the broker confirms the cancel
    pumps: Mutex<HashMap<ConsumerTag, JoinHandle<()>>>,
}

impl AmqpChannel {
    fn pumps(&self) -> std::sync::MutexGuard<'_, HashMap<ConsumerTag, JoinHandle<()>>> {
        self.pumps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<ConsumerTag, BrokerError> {
        let tag = ConsumerTag::new(format!("ctag-{}", Uuid::new_v4()));
        let consumer = self
            .inner
            .basic_consume(
                queue,
                tag.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let pump = tokio::spawn(pump_deliveries(queue.to_string(), consumer, callback));
        self.pumps().insert(tag.clone(), pump);
        Ok(tag)
    }

    /// Returns once every delivery received before the cancel-ok has been
    /// handed to the callback.
    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        self.inner
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await?;

        let pump = self.pumps().remove(tag);
        if let Some(pump) = pump {
            pump.await
                .map_err(|e| BrokerError::Other(format!("Delivery pump for {} failed: {}", tag, e)))?;
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// Forward deliveries from a lapin consumer stream to `callback` until the
/// stream ends, then signal the end with `None`.
async fn pump_deliveries(queue: String, mut consumer: lapin::Consumer, callback: DeliveryCallback) {
    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => {
                let work = callback(Some(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                    routing_key: delivery.routing_key.as_str().to_string(),
                }));
                tokio::spawn(work);
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Consumer stream failed");
                break;
            }
        }
    }

    debug!(queue = %queue, "Consumer stream ended");
    callback(None).await;
}
