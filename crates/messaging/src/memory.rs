use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use futures_util::stream;
use tokio::sync::{Mutex, Notify, oneshot};

use crate::channel::{
    Acker, BrokerConfirm, ConfirmOutcome, DeathReason, DeathRecord, Delivery, DeliveryStream,
    Message, MessageChannel, PendingConfirm, ReturnedMessage, Settlement,
};
use crate::error::{ChannelError, Result};
use crate::topology::{BindingDeclaration, QueueArguments, Topology, topic_matches};

const NO_ROUTE: u16 = 312;

/// How many recently published messages the broker keeps for inspection.
pub const PUBLISHED_LOG_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Enqueued {
    message: Message,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<Enqueued>,
    unacked: HashMap<u64, Enqueued>,
}

#[derive(Debug, Default)]
struct Faults {
    transport_failures: u32,
    nacks: u32,
    withheld_confirms: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingDeclaration>,
    next_tag: u64,
    closed: bool,
    faults: Faults,
    published: VecDeque<Message>,
    withheld: Vec<oneshot::Sender<BrokerConfirm>>,
}

impl BrokerState {
    /// Enqueues `message` on every queue bound to its exchange with a
    /// matching pattern. Returns the number of queues reached.
    fn route(&mut self, message: &Message, now: DateTime<Utc>) -> usize {
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && topic_matches(&b.pattern, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Enqueued {
                    message: message.clone(),
                    enqueued_at: now,
                    delivery_count: 0,
                });
            }
        }
        targets.len()
    }

    fn dead_letter(&mut self, queue: &str, mut message: Message, reason: DeathReason, now: DateTime<Utc>) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            tracing::warn!(
                queue,
                %reason,
                correlation_id = %message.correlation_id,
                "message discarded, queue has no dead-letter exchange"
            );
            return;
        };

        let (original_exchange, original_key, count) = match &message.death {
            Some(death) => (death.exchange.clone(), death.routing_key.clone(), death.count + 1),
            None => (message.exchange.clone(), message.routing_key.clone(), 1),
        };
        message.death = Some(DeathRecord {
            reason,
            queue: queue.to_string(),
            exchange: original_exchange,
            routing_key: original_key,
            count,
            time: now,
        });
        if let Some(key) = arguments.dead_letter_routing_key {
            message.routing_key = key;
        }
        message.exchange = exchange;

        if self.route(&message, now) == 0 {
            tracing::warn!(
                queue,
                %reason,
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "dead letter unroutable, discarded"
            );
        } else {
            tracing::debug!(queue, %reason, routing_key = %message.routing_key, "message dead-lettered");
        }
    }

    /// Dead-letters every ready message of `queue` older than its TTL.
    fn expire(&mut self, queue: &str, now: DateTime<Utc>) -> usize {
        let Some(state) = self.queues.get_mut(queue) else {
            return 0;
        };
        let Some(ttl) = state.arguments.message_ttl else {
            return 0;
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);

        let mut expired = Vec::new();
        state.ready.retain(|entry| {
            if now - entry.enqueued_at >= ttl {
                expired.push(entry.message.clone());
                false
            } else {
                true
            }
        });

        let count = expired.len();
        for message in expired {
            self.dead_letter(queue, message, DeathReason::Expired, now);
        }
        count
    }

    fn take(&mut self, queue: &str, now: DateTime<Utc>) -> Result<(Option<(u64, Message, u32)>, usize)> {
        let expired = self.expire(queue, now);
        let tag = self.next_tag + 1;
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| ChannelError::QueueNotFound(queue.to_string()))?;

        let Some(mut entry) = state.ready.pop_front() else {
            return Ok((None, expired));
        };
        entry.delivery_count += 1;
        let taken = (tag, entry.message.clone(), entry.delivery_count);
        state.unacked.insert(tag, entry);
        self.next_tag = tag;
        Ok((Some(taken), expired))
    }

    fn settle(&mut self, queue: &str, tag: u64, settlement: Settlement, now: DateTime<Utc>) -> Result<()> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| ChannelError::QueueNotFound(queue.to_string()))?;
        let entry = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| ChannelError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag,
            })?;
        let limit_reached = state
            .arguments
            .delivery_limit
            .is_some_and(|limit| entry.delivery_count >= limit);

        match settlement {
            Settlement::Ack => {}
            Settlement::Nack { requeue: true } if limit_reached => {
                self.dead_letter(queue, entry.message, DeathReason::DeliveryLimit, now);
            }
            Settlement::Nack { requeue: true } => {
                if let Some(state) = self.queues.get_mut(queue) {
                    state.ready.push_front(entry);
                }
            }
            Settlement::Nack { requeue: false } | Settlement::Reject => {
                self.dead_letter(queue, entry.message, DeathReason::Rejected, now);
            }
        }
        Ok(())
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

/// Single-process broker with topic exchanges, publisher confirms,
/// unroutable returns and dead-lettering.
///
/// Message age is measured with the injected clock, so TTL expiry can be
/// driven from tests. Expiry is applied when a queue is read and by
/// [`expire_messages`](Self::expire_messages).
#[derive(Clone)]
pub struct InMemoryMessageChannel {
    inner: Arc<Inner>,
}

impl Default for InMemoryMessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageChannel {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                clock,
            }),
        }
    }

    /// Takes the next ready message off `queue` without waiting.
    pub async fn try_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let (taken, expired) = state.take(queue, now)?;
        drop(state);

        if expired > 0 {
            self.inner.notify.notify_waiters();
        }
        Ok(taken.map(|(tag, message, count)| {
            Delivery::new(tag, queue, message, count, Arc::new(self.clone()))
        }))
    }

    async fn next_delivery(&self, queue: &str) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_get(queue).await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(_) => return None,
            }
            notified.await;
        }
    }

    /// Dead-letters expired messages in every queue. Returns how many expired.
    pub async fn expire_messages(&self) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let names: Vec<String> = state.queues.keys().cloned().collect();
        let expired: usize = names.iter().map(|name| state.expire(name, now)).sum();
        drop(state);

        if expired > 0 {
            self.inner.notify.notify_waiters();
        }
        expired
    }

    /// Closes the channel. Publishing fails and every consumer stream ends.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        state.withheld.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Number of ready (undelivered) messages in `queue`.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of delivered but unsettled messages in `queue`.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// The most recent messages that reached the broker, oldest first. At
    /// most [`PUBLISHED_LOG_CAPACITY`] are kept.
    pub async fn published(&self) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .await
            .published
            .iter()
            .cloned()
            .collect()
    }

    /// Fails the next `count` publishes with a transport error.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.inner.state.lock().await.faults.transport_failures = count;
    }

    /// Nacks the next `count` publishes.
    pub async fn nack_next_publishes(&self, count: u32) {
        self.inner.state.lock().await.faults.nacks = count;
    }

    /// Accepts the next `count` publishes but never confirms them.
    pub async fn withhold_next_confirms(&self, count: u32) {
        self.inner.state.lock().await.faults.withheld_confirms = count;
    }
}

#[async_trait]
impl MessageChannel for InMemoryMessageChannel {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        for exchange in &topology.exchanges {
            state.exchanges.insert(exchange.clone());
        }
        for queue in &topology.queues {
            state
                .queues
                .entry(queue.name.clone())
                .or_insert_with(|| QueueState {
                    arguments: queue.arguments.clone(),
                    ..QueueState::default()
                });
        }
        for binding in &topology.bindings {
            if !state.exchanges.contains(&binding.exchange) {
                return Err(ChannelError::ExchangeNotFound(binding.exchange.clone()));
            }
            if !state.queues.contains_key(&binding.queue) {
                return Err(ChannelError::QueueNotFound(binding.queue.clone()));
            }
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }

        tracing::debug!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology declared"
        );
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<PendingConfirm> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.faults.transport_failures > 0 {
            state.faults.transport_failures -= 1;
            return Err(ChannelError::Transport("connection reset".to_string()));
        }

        if state.published.len() >= PUBLISHED_LOG_CAPACITY {
            state.published.pop_front();
        }
        state.published.push_back(message.clone());
        let correlation_id = message.correlation_id;

        if state.faults.withheld_confirms > 0 {
            state.faults.withheld_confirms -= 1;
            let (tx, pending) = PendingConfirm::channel();
            state.withheld.push(tx);
            return Ok(pending);
        }

        let confirm = if state.faults.nacks > 0 {
            state.faults.nacks -= 1;
            BrokerConfirm {
                correlation_id,
                outcome: ConfirmOutcome::Nack {
                    cause: "internal error".to_string(),
                },
                returned: None,
            }
        } else if !state.exchanges.contains(&message.exchange) {
            BrokerConfirm {
                correlation_id,
                outcome: ConfirmOutcome::Nack {
                    cause: format!("NOT_FOUND - no exchange '{}'", message.exchange),
                },
                returned: None,
            }
        } else {
            let routed = state.route(&message, now);
            BrokerConfirm {
                correlation_id,
                outcome: ConfirmOutcome::Ack,
                returned: (routed == 0).then(|| ReturnedMessage {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                }),
            }
        };
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(PendingConfirm::resolved(confirm))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if !state.queues.contains_key(queue) {
                return Err(ChannelError::QueueNotFound(queue.to_string()));
            }
        }

        let seed = (self.clone(), queue.to_string());
        Ok(Box::pin(stream::unfold(seed, |(channel, queue)| async move {
            let delivery = channel.next_delivery(&queue).await?;
            Some((delivery, (channel, queue)))
        })))
    }
}

#[async_trait]
impl Acker for InMemoryMessageChannel {
    async fn settle(&self, queue: &str, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let now = self.inner.clock.now();
        self.inner
            .state
            .lock()
            .await
            .settle(queue, delivery_tag, settlement, now)?;
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
