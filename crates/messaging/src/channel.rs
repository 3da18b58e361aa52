//! Broker abstraction: publishing with confirms, consuming with explicit
//! settlement.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ChannelError, Result};
use crate::events::Event;
use crate::topology::Topology;

/// Why the broker dead-lettered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// Rejected or nacked without requeue.
    Rejected,
    /// Exceeded the queue's message TTL.
    Expired,
    /// Nacked again after reaching the queue's delivery limit.
    DeliveryLimit,
}

impl DeathReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::DeliveryLimit => "delivery_limit",
        }
    }
}

impl std::fmt::Display for DeathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attached by the broker to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub reason: DeathReason,
    /// Queue the message died in.
    pub queue: String,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Routing key the message was originally published with.
    pub routing_key: String,
    /// How many times this message has been dead-lettered.
    pub count: u32,
    pub time: DateTime<Utc>,
}

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Uuid,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
    pub death: Option<DeathRecord>,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        correlation_id: Uuid,
        payload: Vec<u8>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id,
            payload,
            published_at,
            death: None,
        }
    }

    /// Decodes the JSON payload.
    pub fn decode<E: Event>(&self) -> serde_json::Result<E> {
        serde_json::from_slice(&self.payload)
    }

    /// Payload as text, for logging.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack { cause: String },
}

/// A mandatory message the broker could not route to any queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// The broker's answer to a single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfirm {
    pub correlation_id: Uuid,
    pub outcome: ConfirmOutcome,
    pub returned: Option<ReturnedMessage>,
}

/// Publisher confirm that resolves once the broker has decided.
#[derive(Debug)]
pub struct PendingConfirm {
    rx: oneshot::Receiver<BrokerConfirm>,
}

impl PendingConfirm {
    /// Returns a pending confirm and the sender the broker resolves it with.
    pub fn channel() -> (oneshot::Sender<BrokerConfirm>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Returns an already resolved confirm.
    pub fn resolved(confirm: BrokerConfirm) -> Self {
        let (tx, pending) = Self::channel();
        // The receiver is alive in `pending`, so the send cannot fail.
        let _ = tx.send(confirm);
        pending
    }

    /// Waits for the broker's answer.
    pub async fn wait(self) -> Result<BrokerConfirm> {
        self.rx.await.map_err(|_| ChannelError::ConfirmLost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject,
}

/// Settles deliveries on behalf of a channel.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, queue: &str, delivery_tag: u64, settlement: Settlement) -> Result<()>;
}

/// A message handed to a consumer.
///
/// Settlement methods take `self`, so each delivery is settled at most once.
/// A delivery that is dropped unsettled stays unacknowledged.
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub message: Message,
    /// Number of times this message has been handed out, this one included.
    pub delivery_count: u32,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        queue: impl Into<String>,
        message: Message,
        delivery_count: u32,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            message,
            delivery_count,
            acker,
        }
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub async fn ack(self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Nack { requeue }).await
    }

    pub async fn reject(self) -> Result<()> {
        self.settle(Settlement::Reject).await
    }

    async fn settle(self, settlement: Settlement) -> Result<()> {
        self.acker
            .settle(&self.queue, self.delivery_tag, settlement)
            .await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("message", &self.message)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Connection to a message broker.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Declares exchanges, queues and bindings. Redeclaring is a no-op.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Publishes a message. The returned confirm resolves with the broker's
    /// ack or nack and reports an unroutable return, if any.
    async fn publish(&self, message: Message) -> Result<PendingConfirm>;

    /// Starts consuming a queue. The stream ends when the channel closes.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}

#[async_trait]
impl<C: MessageChannel + ?Sized> MessageChannel for Arc<C> {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        (**self).declare(topology).await
    }

    async fn publish(&self, message: Message) -> Result<PendingConfirm> {
        (**self).publish(message).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        (**self).consume(queue).await
    }
}
