//! Consumers of the transaction, account-balance and notification queues.

pub mod balances;
pub mod notifications;
pub mod transactions;

pub use balances::BalanceMonitor;
pub use notifications::{LoggingSender, NotificationDispatcher, NotificationSender};
pub use transactions::TransactionProcessor;
