//! Domain layer for the ledger transfer core.
//!
//! This crate provides:
//! - `Money`, an exact fixed-point amount
//! - `Account` and its lifecycle status
//! - `DistributedTransaction` with its prepare/commit/abort state machine

pub mod account;
pub mod error;
pub mod money;
pub mod state;
pub mod transaction;

pub use account::{Account, AccountStatus};
pub use error::DomainError;
pub use money::Money;
pub use state::DistributedTransactionStatus;
pub use transaction::{DistributedTransaction, StatusChange};
