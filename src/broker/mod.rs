//! Message broker client
//!
//! Jobs travel through a durable queue. Consumers receive [`Delivery`]
//! values one at a time (bounded by the prefetch count) and must settle each
//! of them with an explicit ack or nack.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Default exchange; routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Summary returned by a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message. With `requeue` the broker delivers it again;
    /// without, it is dropped or dead-lettered.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a durable queue. Re-declaring with the same properties is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo>;

    /// Bound the number of unacknowledged deliveries to this consumer.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a persistent message. No broker-side transaction.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start consuming `queue`. The stream ends only when the broker closes.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel and connection.
    async fn close(&self) -> Result<()>;
}
