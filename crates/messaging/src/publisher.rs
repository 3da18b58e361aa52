//! Reliable event publishing with publisher confirms and linear backoff.

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use uuid::Uuid;

use crate::channel::{ConfirmOutcome, Message, MessageChannel};
use crate::error::{AttemptError, PublishError};
use crate::events::Event;

/// Retry configuration for [`EventPublisher`].
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second (the wait after attempt `n` is `n * base_delay`)
/// - `confirm_timeout`: 5 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub confirm_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// State of one publish call. Lives only for the duration of the call.
#[derive(Debug, Clone)]
pub struct PublishAttempt {
    pub correlation_id: Uuid,
    pub attempt: u32,
    pub last_error: Option<AttemptError>,
}

impl PublishAttempt {
    fn first() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            attempt: 1,
            last_error: None,
        }
    }

    fn next(&mut self, error: AttemptError) {
        self.correlation_id = Uuid::new_v4();
        self.attempt += 1;
        self.last_error = Some(error);
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Correlation ID of the confirmed attempt.
    pub correlation_id: Uuid,
    pub attempts: u32,
}

/// Publishes events and waits for the broker to confirm them, retrying
/// failed attempts.
///
/// Each attempt publishes exactly once under a fresh correlation ID. Nacks,
/// unroutable returns, confirm timeouts and transport errors fail the
/// attempt. Backoff sleeps go through the injected [`Clock`].
pub struct EventPublisher<C> {
    channel: C,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl<C: Clone> Clone for EventPublisher<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            clock: Arc::clone(&self.clock),
            policy: self.policy,
        }
    }
}

impl<C: MessageChannel> EventPublisher<C> {
    pub fn new(channel: C, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            channel,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Publishes `event` on its class's standard exchange and routing key.
    pub async fn publish_event<E: Event>(&self, event: &E) -> Result<PublishReceipt, PublishError> {
        self.publish(event, E::CLASS.exchange(), E::CLASS.routing_key())
            .await
    }

    /// Publishes `event` to `exchange` with `routing_key`.
    #[tracing::instrument(
        skip(self, event),
        fields(class = %E::CLASS, correlation_key = %event.correlation_key())
    )]
    pub async fn publish<E: Event>(
        &self,
        event: &E,
        exchange: &str,
        routing_key: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let class = E::CLASS;
        let payload = serde_json::to_vec(event)
            .map_err(|source| PublishError::Serialization { class, source })?;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = PublishAttempt::first();

        loop {
            let result = self
                .attempt(&payload, exchange, routing_key, attempt.correlation_id)
                .await;

            let error = match result {
                Ok(()) => {
                    if attempt.attempt > 1 {
                        tracing::info!(attempt = attempt.attempt, "event published after retry");
                    }
                    metrics::counter!("events_published_total", "class" => class.as_str())
                        .increment(1);
                    return Ok(PublishReceipt {
                        correlation_id: attempt.correlation_id,
                        attempts: attempt.attempt,
                    });
                }
                Err(error) => error,
            };

            tracing::warn!(
                attempt = attempt.attempt,
                max_attempts,
                correlation_id = %attempt.correlation_id,
                error = %error,
                "publish attempt failed"
            );

            if attempt.attempt >= max_attempts {
                tracing::error!(attempts = attempt.attempt, error = %error, "giving up on event");
                metrics::counter!("event_publish_failures_total", "class" => class.as_str())
                    .increment(1);
                return Err(PublishError::RetriesExhausted {
                    class,
                    correlation_key: event.correlation_key(),
                    attempts: attempt.attempt,
                    last_error: error,
                });
            }

            metrics::counter!("event_publish_retries_total", "class" => class.as_str())
                .increment(1);
            self.clock.sleep(self.policy.backoff_for(attempt.attempt)).await;
            attempt.next(error);
        }
    }

    async fn attempt(
        &self,
        payload: &[u8],
        exchange: &str,
        routing_key: &str,
        correlation_id: Uuid,
    ) -> Result<(), AttemptError> {
        let message = Message::new(
            exchange,
            routing_key,
            correlation_id,
            payload.to_vec(),
            self.clock.now(),
        );
        let pending = self.channel.publish(message).await?;

        let confirm = tokio::select! {
            biased;
            confirm = pending.wait() => confirm?,
            _ = self.clock.sleep(self.policy.confirm_timeout) => {
                return Err(AttemptError::ConfirmTimeout(self.policy.confirm_timeout));
            }
        };

        if confirm.correlation_id != correlation_id {
            return Err(AttemptError::CorrelationMismatch {
                expected: correlation_id,
                actual: confirm.correlation_id,
            });
        }

        if let Some(returned) = confirm.returned {
            tracing::error!(
                %correlation_id,
                reply_code = returned.reply_code,
                reply_text = %returned.reply_text,
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                "message returned"
            );
            return Err(AttemptError::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text,
            });
        }

        match confirm.outcome {
            ConfirmOutcome::Ack => {
                tracing::debug!(%correlation_id, "message confirmed");
                Ok(())
            }
            ConfirmOutcome::Nack { cause } => {
                tracing::error!(%correlation_id, %cause, "message not confirmed");
                Err(AttemptError::Nacked { cause })
            }
        }
    }
}
