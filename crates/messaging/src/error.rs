use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::events::EventClass;

/// Errors raised by a message channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel has been closed.
    #[error("Channel closed")]
    Closed,

    /// The connection to the broker failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The target exchange was never declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// The target queue was never declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The delivery was already settled or never handed out.
    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },

    /// The broker dropped the confirm for a published message.
    #[error("Publisher confirm lost")]
    ConfirmLost,
}

/// Why a single publish attempt failed.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The broker refused the message.
    #[error("Broker nacked message: {cause}")]
    Nacked { cause: String },

    /// The broker accepted the message but no queue was bound for it.
    #[error("Message returned as unroutable: {reply_code} {reply_text}")]
    Returned { reply_code: u16, reply_text: String },

    /// No confirm arrived within the configured wait.
    #[error("No publisher confirm within {0:?}")]
    ConfirmTimeout(Duration),

    /// The confirm belonged to a different message.
    #[error("Confirm correlation mismatch: expected {expected}, got {actual}")]
    CorrelationMismatch { expected: Uuid, actual: Uuid },
}

/// Errors returned by the event publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event could not be encoded. Not retried.
    #[error("Failed to serialize {class} event: {source}")]
    Serialization {
        class: EventClass,
        #[source]
        source: serde_json::Error,
    },

    /// Every attempt failed.
    #[error("Publishing {class} event {correlation_key} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        class: EventClass,
        correlation_key: String,
        attempts: u32,
        last_error: AttemptError,
    },
}

impl PublishError {
    /// Returns the class of the event that could not be published.
    pub fn class(&self) -> EventClass {
        match self {
            PublishError::Serialization { class, .. } => *class,
            PublishError::RetriesExhausted { class, .. } => *class,
        }
    }
}

/// Error returned by an event or dead-letter handler.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Errors that stop a consumer loop.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
