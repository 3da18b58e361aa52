//! Event payloads published to the broker.
//!
//! Payloads carry identifiers and amounts only, never whole aggregates, and
//! serialize as camelCase JSON so downstream consumers in other languages can
//! read them unchanged.

use chrono::{DateTime, Utc};
use common::{AccountNumber, TransactionId, UserId};
use domain::{DistributedTransaction, Money};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::topology::{
    ACCOUNT_BALANCE_DLQ, ACCOUNT_EXCHANGE, BALANCE_ROUTING_KEY, NOTIFICATION_DLQ,
    NOTIFICATION_EXCHANGE, NOTIFICATION_ROUTING_KEY, TRANSACTION_DLQ, TRANSACTION_EXCHANGE,
    TRANSACTION_ROUTING_KEY,
};

/// The three kinds of events and their standard routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Transaction,
    BalanceChange,
    Notification,
}

impl EventClass {
    pub const ALL: [EventClass; 3] = [
        EventClass::Transaction,
        EventClass::BalanceChange,
        EventClass::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Transaction => "transaction",
            EventClass::BalanceChange => "balance_change",
            EventClass::Notification => "notification",
        }
    }

    /// Exchange the class is published to.
    pub fn exchange(&self) -> &'static str {
        match self {
            EventClass::Transaction => TRANSACTION_EXCHANGE,
            EventClass::BalanceChange => ACCOUNT_EXCHANGE,
            EventClass::Notification => NOTIFICATION_EXCHANGE,
        }
    }

    /// Routing key the class is published with.
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventClass::Transaction => TRANSACTION_ROUTING_KEY,
            EventClass::BalanceChange => BALANCE_ROUTING_KEY,
            EventClass::Notification => NOTIFICATION_ROUTING_KEY,
        }
    }

    /// Queue that receives the class's dead letters.
    pub fn dead_letter_queue(&self) -> &'static str {
        match self {
            EventClass::Transaction => TRANSACTION_DLQ,
            EventClass::BalanceChange => ACCOUNT_BALANCE_DLQ,
            EventClass::Notification => NOTIFICATION_DLQ,
        }
    }
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payload the publisher knows how to route.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CLASS: EventClass;

    /// Business key used in logs to tie attempts and dead letters together.
    fn correlation_key(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Transfer,
    DistributedTransferPrepare,
    DistributedTransferCommit,
    DistributedTransferAbort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Preparing,
    Committing,
    Aborting,
}

/// Lifecycle event of a transfer or distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub from_account: AccountNumber,
    pub to_account: AccountNumber,
    pub amount: Money,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TransactionEvent {
    /// Event for a plain transfer identified by `reference`.
    pub fn transfer(
        reference: impl Into<String>,
        from_account: AccountNumber,
        to_account: AccountNumber,
        amount: Money,
        status: TransactionStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: reference.into(),
            from_account,
            to_account,
            amount,
            transaction_type: TransactionType::Transfer,
            status,
            timestamp,
            description: None,
        }
    }

    /// Prepare, commit or abort announcement for a distributed transaction.
    pub fn distributed(
        transaction: &DistributedTransaction,
        transaction_type: TransactionType,
        status: TransactionStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: transaction.transaction_id.to_string(),
            from_account: transaction.from_account.clone(),
            to_account: transaction.to_account.clone(),
            amount: transaction.amount,
            transaction_type,
            status,
            timestamp,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns the distributed transaction ID, if this event belongs to one.
    pub fn distributed_id(&self) -> Option<TransactionId> {
        self.transaction_id
            .starts_with(TransactionId::PREFIX)
            .then(|| TransactionId::new(self.transaction_id.clone()))
    }
}

impl Event for TransactionEvent {
    const CLASS: EventClass = EventClass::Transaction;

    fn correlation_key(&self) -> String {
        self.transaction_id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceOperation {
    Debit,
    Credit,
}

/// A committed change to one account balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChangeEvent {
    pub account_number: AccountNumber,
    pub old_balance: Money,
    pub new_balance: Money,
    pub operation: BalanceOperation,
    pub timestamp: DateTime<Utc>,
}

impl Event for BalanceChangeEvent {
    const CLASS: EventClass = EventClass::BalanceChange;

    fn correlation_key(&self) -> String {
        self.account_number.to_string()
    }
}

/// Delivery channel requested for a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    #[default]
    Email,
    Sms,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub timestamp: DateTime<Utc>,
}

impl Event for NotificationEvent {
    const CLASS: EventClass = EventClass::Notification;

    fn correlation_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_transaction_event_uses_camel_case() {
        let event = TransactionEvent::transfer(
            "REQ-1",
            AccountNumber::new("ACC1"),
            AccountNumber::new("ACC2"),
            Money::new(dec!(100.50)),
            TransactionStatus::Completed,
            Utc::now(),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["transactionId"], json!("REQ-1"));
        assert_eq!(value["fromAccount"], json!("ACC1"));
        assert_eq!(value["toAccount"], json!("ACC2"));
        assert_eq!(value["transactionType"], json!("TRANSFER"));
        assert_eq!(value["status"], json!("COMPLETED"));
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_notification_type_field_is_renamed() {
        let event = NotificationEvent {
            user_id: UserId::new(),
            title: "Transfer completed".into(),
            message: "100 sent".into(),
            notification_type: NotificationType::Email,
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("EMAIL"));
        assert!(value.get("userId").is_some());
    }

    #[test]
    fn test_distributed_event_carries_both_accounts() {
        let tx = DistributedTransaction::new(
            TransactionId::generate(),
            AccountNumber::new("ACC1"),
            AccountNumber::new("ACC2"),
            Money::from_major(10),
            Utc::now(),
        );

        let event = TransactionEvent::distributed(
            &tx,
            TransactionType::DistributedTransferPrepare,
            TransactionStatus::Preparing,
            Utc::now(),
        );

        assert_eq!(event.from_account, AccountNumber::new("ACC1"));
        assert_eq!(event.to_account, AccountNumber::new("ACC2"));
        assert_eq!(event.distributed_id(), Some(tx.transaction_id.clone()));
        assert_eq!(
            serde_json::to_value(&event).unwrap()["transactionType"],
            json!("DISTRIBUTED_TRANSFER_PREPARE")
        );
    }

    #[test]
    fn test_class_routes() {
        assert_eq!(EventClass::Transaction.exchange(), "transaction.exchange");
        assert_eq!(EventClass::BalanceChange.routing_key(), "account.balance.updated");
        assert_eq!(EventClass::Notification.dead_letter_queue(), "notification.dlq");
    }
}
