//! Messaging for the ledger transfer core.
//!
//! This crate provides:
//! - The `MessageChannel` broker abstraction and an in-memory broker with
//!   topic exchanges, publisher confirms and dead-lettering
//! - Event payloads and their standard routes
//! - `EventPublisher`, which retries unconfirmed publishes with linear backoff
//! - `EventConsumer` and `DeadLetterProcessor`

pub mod channel;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod memory;
pub mod publisher;
pub mod topology;

pub use channel::{
    BrokerConfirm, ConfirmOutcome, DeathReason, DeathRecord, Delivery, DeliveryStream, Message,
    MessageChannel, PendingConfirm, ReturnedMessage,
};
pub use consumer::{ConsumeOutcome, ConsumerStats, EventConsumer, EventHandler};
pub use dead_letter::{
    DeadLetter, DeadLetterHandler, DeadLetterParkingLot, DeadLetterProcessor, DeadLetteredEvent,
};
pub use error::{AttemptError, ChannelError, ConsumeError, HandlerError, PublishError};
pub use events::{
    BalanceChangeEvent, BalanceOperation, Event, EventClass, NotificationEvent, NotificationType,
    TransactionEvent, TransactionStatus, TransactionType,
};
pub use memory::InMemoryMessageChannel;
pub use publisher::{EventPublisher, PublishAttempt, PublishReceipt, RetryPolicy};
pub use topology::{QueueArguments, QueueSettings, Topology};
