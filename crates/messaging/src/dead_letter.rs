//! Terminal sink for messages the broker gave up on.
//!
//! The processor logs every dead letter with its correlation key and death
//! record, hands it to a [`DeadLetterHandler`] and acks it. It never
//! re-publishes to the original queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Clock;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use uuid::Uuid;

use crate::channel::{DeathRecord, Delivery, Message, MessageChannel};
use crate::error::{ConsumeError, HandlerError};
use crate::events::{
    BalanceChangeEvent, Event, EventClass, NotificationEvent, TransactionEvent,
};

/// Payload of a dead letter, decoded according to the queue it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetteredEvent {
    Transaction(TransactionEvent),
    BalanceChange(BalanceChangeEvent),
    Notification(NotificationEvent),
    Undecodable { raw: String, error: String },
}

impl DeadLetteredEvent {
    fn decode(class: EventClass, message: &Message) -> Self {
        let decoded = match class {
            EventClass::Transaction => message.decode().map(DeadLetteredEvent::Transaction),
            EventClass::BalanceChange => message.decode().map(DeadLetteredEvent::BalanceChange),
            EventClass::Notification => message.decode().map(DeadLetteredEvent::Notification),
        };
        decoded.unwrap_or_else(|error| DeadLetteredEvent::Undecodable {
            raw: message.payload_text(),
            error: error.to_string(),
        })
    }

    /// Business key of the payload, if it decoded.
    pub fn correlation_key(&self) -> Option<String> {
        match self {
            DeadLetteredEvent::Transaction(event) => Some(event.correlation_key()),
            DeadLetteredEvent::BalanceChange(event) => Some(event.correlation_key()),
            DeadLetteredEvent::Notification(event) => Some(event.correlation_key()),
            DeadLetteredEvent::Undecodable { .. } => None,
        }
    }
}

/// A message that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub class: EventClass,
    pub correlation_id: Uuid,
    pub event: DeadLetteredEvent,
    pub death: Option<DeathRecord>,
    pub received_at: DateTime<Utc>,
}

/// Extension point for alerting or manual reconciliation.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle(&self, letter: &DeadLetter) -> Result<(), HandlerError>;
}

/// Keeps the most recent dead letters in memory for operators to inspect.
///
/// Once `capacity` letters are parked the oldest is dropped for each new one.
#[derive(Debug, Clone)]
pub struct DeadLetterParkingLot {
    letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    capacity: usize,
}

impl Default for DeadLetterParkingLot {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl DeadLetterParkingLot {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            letters: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Parked letters, oldest first.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterHandler for DeadLetterParkingLot {
    async fn handle(&self, letter: &DeadLetter) -> Result<(), HandlerError> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        if letters.len() >= self.capacity {
            letters.pop_front();
            metrics::counter!("dead_letters_dropped_total").increment(1);
            tracing::warn!(capacity = self.capacity, "parking lot full, dropping oldest dead letter");
        }
        letters.push_back(letter.clone());
        Ok(())
    }
}

/// Consumes the transaction, account-balance and notification dead-letter
/// queues.
pub struct DeadLetterProcessor<C, H> {
    channel: C,
    handler: H,
    clock: Arc<dyn Clock>,
}

impl<C: MessageChannel, H: DeadLetterHandler> DeadLetterProcessor<C, H> {
    pub fn new(channel: C, handler: H, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            handler,
            clock,
        }
    }

    /// Consumes all three dead-letter queues until the channel closes.
    /// Returns the number of dead letters processed.
    pub async fn run(&self) -> Result<u64, ConsumeError> {
        let mut streams: Vec<BoxStream<'static, (EventClass, Delivery)>> = Vec::new();
        for class in EventClass::ALL {
            let deliveries = self.channel.consume(class.dead_letter_queue()).await?;
            streams.push(deliveries.map(move |delivery| (class, delivery)).boxed());
        }

        tracing::info!("dead-letter processor started");
        let mut merged = stream::select_all(streams);
        let mut processed = 0;
        while let Some((class, delivery)) = merged.next().await {
            self.process(class, delivery).await?;
            processed += 1;
        }

        tracing::info!(processed, "dead-letter processor stopped");
        Ok(processed)
    }

    /// Logs, hands off and acks one dead letter.
    pub async fn process(&self, class: EventClass, delivery: Delivery) -> Result<DeadLetter, ConsumeError> {
        let letter = DeadLetter {
            queue: delivery.queue.clone(),
            class,
            correlation_id: delivery.message.correlation_id,
            event: DeadLetteredEvent::decode(class, &delivery.message),
            death: delivery.message.death.clone(),
            received_at: self.clock.now(),
        };

        let correlation_key = letter.correlation_key_or_unknown();
        match &letter.death {
            Some(death) => tracing::error!(
                queue = %letter.queue,
                %class,
                %correlation_key,
                correlation_id = %letter.correlation_id,
                reason = %death.reason,
                source_queue = %death.queue,
                routing_key = %death.routing_key,
                count = death.count,
                "DEAD LETTER: {class} event failed permanently"
            ),
            None => tracing::error!(
                queue = %letter.queue,
                %class,
                %correlation_key,
                correlation_id = %letter.correlation_id,
                "DEAD LETTER: {class} event failed permanently"
            ),
        }
        if let DeadLetteredEvent::Undecodable { raw, error } = &letter.event {
            tracing::error!(queue = %letter.queue, %error, %raw, "dead letter payload could not be decoded");
        }
        metrics::counter!("dead_letters_total", "queue" => letter.queue.clone()).increment(1);

        if let Err(error) = self.handler.handle(&letter).await {
            tracing::error!(queue = %letter.queue, %correlation_key, %error, "dead-letter handler failed");
        }

        delivery.ack().await?;
        Ok(letter)
    }
}

impl DeadLetter {
    fn correlation_key_or_unknown(&self) -> String {
        self.event
            .correlation_key()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryMessageChannel;
    use crate::topology::{QueueSettings, TRANSACTION_DLQ, TRANSACTION_EXCHANGE, Topology};
    use common::SystemClock;

    struct AlwaysFails;

    #[async_trait]
    impl DeadLetterHandler for AlwaysFails {
        async fn handle(&self, _letter: &DeadLetter) -> Result<(), HandlerError> {
            Err(HandlerError::new("pager offline"))
        }
    }

    async fn channel() -> InMemoryMessageChannel {
        let channel = InMemoryMessageChannel::new();
        channel
            .declare(&Topology::standard(QueueSettings::default()))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_parked_and_acked() {
        let channel = channel().await;
        channel
            .publish(Message::new(
                TRANSACTION_EXCHANGE,
                "transaction.failed",
                Uuid::new_v4(),
                b"not json".to_vec(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let parking = DeadLetterParkingLot::new();
        let processor = DeadLetterProcessor::new(channel.clone(), parking.clone(), Arc::new(SystemClock));
        let delivery = channel.try_get(TRANSACTION_DLQ).await.unwrap().unwrap();
        let letter = processor.process(EventClass::Transaction, delivery).await.unwrap();

        assert!(matches!(letter.event, DeadLetteredEvent::Undecodable { .. }));
        assert!(letter.event.correlation_key().is_none());
        assert_eq!(parking.len(), 1);
        assert_eq!(channel.unacked_count(TRANSACTION_DLQ).await, 0);
    }

    #[tokio::test]
    async fn test_handler_failure_still_acks() {
        let channel = channel().await;
        channel
            .publish(Message::new(
                TRANSACTION_EXCHANGE,
                "transaction.failed",
                Uuid::new_v4(),
                b"{}".to_vec(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let processor = DeadLetterProcessor::new(channel.clone(), AlwaysFails, Arc::new(SystemClock));
        let delivery = channel.try_get(TRANSACTION_DLQ).await.unwrap().unwrap();
        processor.process(EventClass::Transaction, delivery).await.unwrap();

        assert_eq!(channel.queue_depth(TRANSACTION_DLQ).await, 0);
        assert_eq!(channel.unacked_count(TRANSACTION_DLQ).await, 0);
    }

    #[tokio::test]
    async fn test_parking_lot_drops_oldest_when_full() {
        let parking = DeadLetterParkingLot::with_capacity(2);
        for queue in ["first", "second", "third"] {
            let letter = DeadLetter {
                queue: queue.to_string(),
                class: EventClass::Notification,
                correlation_id: Uuid::new_v4(),
                event: DeadLetteredEvent::Undecodable {
                    raw: String::new(),
                    error: "empty".to_string(),
                },
                death: None,
                received_at: Utc::now(),
            };
            parking.handle(&letter).await.unwrap();
        }

        let queues: Vec<String> = parking.letters().into_iter().map(|l| l.queue).collect();
        assert_eq!(queues, vec!["second", "third"]);
    }
}
