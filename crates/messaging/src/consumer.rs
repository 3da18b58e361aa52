//! Typed queue consumer.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::channel::{Delivery, MessageChannel};
use crate::error::{ConsumeError, HandlerError};
use crate::events::Event;

/// Application logic invoked for each decoded event.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Handles one event. An error requeues the message; the queue's
    /// delivery limit decides when it is dead-lettered.
    async fn handle(&self, event: E, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Acked,
    Requeued,
    Rejected,
}

/// Per-run settlement counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: ConsumeOutcome) {
        match outcome {
            ConsumeOutcome::Acked => self.acked += 1,
            ConsumeOutcome::Requeued => self.requeued += 1,
            ConsumeOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Consumes one queue, decoding each message as `E`.
///
/// Handler success acks, handler failure nacks with requeue, and a payload
/// that does not decode is rejected straight to the dead-letter exchange.
pub struct EventConsumer<C, E, H> {
    channel: C,
    queue: String,
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<C, E, H> EventConsumer<C, E, H>
where
    C: MessageChannel,
    E: Event,
    H: EventHandler<E>,
{
    pub fn new(channel: C, queue: impl Into<String>, handler: H) -> Self {
        Self {
            channel,
            queue: queue.into(),
            handler,
            _event: PhantomData,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consumes until the channel closes.
    pub async fn run(&self) -> Result<ConsumerStats, ConsumeError> {
        let mut stream = self.channel.consume(&self.queue).await?;
        let mut stats = ConsumerStats::default();
        tracing::info!(queue = %self.queue, "consumer started");

        while let Some(delivery) = stream.next().await {
            stats.record(self.process(delivery).await?);
        }

        tracing::info!(queue = %self.queue, ?stats, "consumer stopped");
        Ok(stats)
    }

    /// Handles and settles a single delivery.
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            queue = %delivery.queue,
            correlation_id = %delivery.message.correlation_id,
            delivery_count = delivery.delivery_count
        )
    )]
    pub async fn process(&self, delivery: Delivery) -> Result<ConsumeOutcome, ConsumeError> {
        let event = match delivery.message.decode::<E>() {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, payload = %delivery.message.payload_text(), "undecodable message rejected");
                delivery.reject().await?;
                return Ok(ConsumeOutcome::Rejected);
            }
        };

        match self.handler.handle(event, &delivery).await {
            Ok(()) => {
                delivery.ack().await?;
                Ok(ConsumeOutcome::Acked)
            }
            Err(error) => {
                tracing::warn!(%error, "handler failed, requeueing");
                delivery.nack(true).await?;
                Ok(ConsumeOutcome::Requeued)
            }
        }
    }
}
