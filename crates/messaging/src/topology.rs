//! Exchange, queue and binding declarations.
//!
//! Each primary queue dead-letters into its own exchange under a `*.failed`
//! routing key, where a parallel dead-letter queue is bound:
//!
//! ```text
//! transaction.exchange ──transaction.created──► transaction.queue ──(ttl / limit / reject)──┐
//!          │    └──────transaction.*──────────► audit.queue                                 │
//!          └──────────transaction.failed──────► transaction.dlq ◄───────────────────────────┘
//! ```

use std::time::Duration;

pub const TRANSACTION_EXCHANGE: &str = "transaction.exchange";
pub const ACCOUNT_EXCHANGE: &str = "account.exchange";
pub const NOTIFICATION_EXCHANGE: &str = "notification.exchange";

pub const TRANSACTION_QUEUE: &str = "transaction.queue";
pub const ACCOUNT_BALANCE_QUEUE: &str = "account.balance.queue";
pub const NOTIFICATION_QUEUE: &str = "notification.queue";
pub const AUDIT_QUEUE: &str = "audit.queue";

pub const TRANSACTION_DLQ: &str = "transaction.dlq";
pub const ACCOUNT_BALANCE_DLQ: &str = "account.balance.dlq";
pub const NOTIFICATION_DLQ: &str = "notification.dlq";

pub const TRANSACTION_ROUTING_KEY: &str = "transaction.created";
pub const BALANCE_ROUTING_KEY: &str = "account.balance.updated";
pub const NOTIFICATION_ROUTING_KEY: &str = "notification.send";

pub const TRANSACTION_FAILED_KEY: &str = "transaction.failed";
pub const ACCOUNT_FAILED_KEY: &str = "account.failed";
pub const NOTIFICATION_FAILED_KEY: &str = "notification.failed";

const AUDIT_PATTERN: &str = "transaction.*";

/// Broker-side delivery policy applied to every primary queue.
///
/// This budget is independent of the publisher's retry loop: the publisher
/// retries getting a message *into* the broker, the queue settings govern
/// how long and how often the broker tries to get it *out* to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Messages older than this are dead-lettered.
    pub message_ttl: Duration,
    /// Messages delivered this many times and nacked again are dead-lettered.
    pub delivery_limit: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_millis(300_000),
            delivery_limit: 5,
        }
    }
}

/// Arguments attached to a queue at declaration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub delivery_limit: Option<u32>,
}

impl QueueArguments {
    /// Arguments for a primary queue that dead-letters into `exchange`
    /// under `routing_key`.
    pub fn dead_lettering(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.into()),
            dead_letter_routing_key: Some(routing_key.into()),
            message_ttl: Some(settings.message_ttl),
            delivery_limit: Some(settings.delivery_limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDeclaration {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

/// A set of declarations applied to a channel in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<String>,
    pub queues: Vec<QueueDeclaration>,
    pub bindings: Vec<BindingDeclaration>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a topic exchange.
    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchanges.push(name.into());
        self
    }

    /// Declares a queue.
    pub fn queue(mut self, name: impl Into<String>, arguments: QueueArguments) -> Self {
        self.queues.push(QueueDeclaration {
            name: name.into(),
            arguments,
        });
        self
    }

    /// Binds a queue to an exchange with a topic pattern.
    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingDeclaration {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// The transaction, account-balance and notification topology with its
    /// audit queue and dead-letter queues.
    pub fn standard(settings: QueueSettings) -> Self {
        Self::new()
            .exchange(TRANSACTION_EXCHANGE)
            .exchange(ACCOUNT_EXCHANGE)
            .exchange(NOTIFICATION_EXCHANGE)
            .queue(
                TRANSACTION_QUEUE,
                QueueArguments::dead_lettering(
                    TRANSACTION_EXCHANGE,
                    TRANSACTION_FAILED_KEY,
                    settings,
                ),
            )
            .queue(
                ACCOUNT_BALANCE_QUEUE,
                QueueArguments::dead_lettering(ACCOUNT_EXCHANGE, ACCOUNT_FAILED_KEY, settings),
            )
            .queue(
                NOTIFICATION_QUEUE,
                QueueArguments::dead_lettering(
                    NOTIFICATION_EXCHANGE,
                    NOTIFICATION_FAILED_KEY,
                    settings,
                ),
            )
            .queue(AUDIT_QUEUE, QueueArguments::default())
            .queue(TRANSACTION_DLQ, QueueArguments::default())
            .queue(ACCOUNT_BALANCE_DLQ, QueueArguments::default())
            .queue(NOTIFICATION_DLQ, QueueArguments::default())
            .bind(TRANSACTION_QUEUE, TRANSACTION_EXCHANGE, TRANSACTION_ROUTING_KEY)
            .bind(ACCOUNT_BALANCE_QUEUE, ACCOUNT_EXCHANGE, BALANCE_ROUTING_KEY)
            .bind(NOTIFICATION_QUEUE, NOTIFICATION_EXCHANGE, NOTIFICATION_ROUTING_KEY)
            .bind(AUDIT_QUEUE, TRANSACTION_EXCHANGE, AUDIT_PATTERN)
            .bind(TRANSACTION_DLQ, TRANSACTION_EXCHANGE, TRANSACTION_FAILED_KEY)
            .bind(ACCOUNT_BALANCE_DLQ, ACCOUNT_EXCHANGE, ACCOUNT_FAILED_KEY)
            .bind(NOTIFICATION_DLQ, NOTIFICATION_EXCHANGE, NOTIFICATION_FAILED_KEY)
    }
}

/// Topic-exchange matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            matches_words(&pattern[1..], key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => matches_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => matches_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("transaction.created", "transaction.created"));
        assert!(!topic_matches("transaction.created", "transaction.failed"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("transaction.*", "transaction.created"));
        assert!(topic_matches("transaction.*", "transaction.failed"));
        assert!(!topic_matches("transaction.*", "transaction"));
        assert!(!topic_matches("transaction.*", "transaction.a.b"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        assert!(topic_matches("account.#", "account"));
        assert!(topic_matches("account.#", "account.balance.updated"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.failed", "account.failed"));
        assert!(!topic_matches("#.failed", "account.balance.updated"));
    }

    #[test]
    fn test_standard_topology_dead_letters_primary_queues() {
        let topology = Topology::standard(QueueSettings::default());

        let primary = topology
            .queues
            .iter()
            .find(|q| q.name == TRANSACTION_QUEUE)
            .unwrap();
        assert_eq!(
            primary.arguments.dead_letter_exchange.as_deref(),
            Some(TRANSACTION_EXCHANGE)
        );
        assert_eq!(
            primary.arguments.dead_letter_routing_key.as_deref(),
            Some(TRANSACTION_FAILED_KEY)
        );
        assert_eq!(
            primary.arguments.message_ttl,
            Some(Duration::from_millis(300_000))
        );

        let audit = topology.queues.iter().find(|q| q.name == AUDIT_QUEUE).unwrap();
        assert_eq!(audit.arguments, QueueArguments::default());
    }

    #[test]
    fn test_every_dead_letter_key_has_a_bound_queue() {
        let topology = Topology::standard(QueueSettings::default());
        for queue in &topology.queues {
            if let (Some(exchange), Some(key)) = (
                &queue.arguments.dead_letter_exchange,
                &queue.arguments.dead_letter_routing_key,
            ) {
                assert!(
                    topology
                        .bindings
                        .iter()
                        .any(|b| &b.exchange == exchange && topic_matches(&b.pattern, key)),
                    "no binding for {exchange}/{key}"
                );
            }
        }
    }
}
