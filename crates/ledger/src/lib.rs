//! Ledger collaborator interfaces.
//!
//! The transfer core never owns account storage; it talks to it through
//! [`LedgerStore`] and records distributed transactions through
//! [`TransactionRepository`]. In-memory implementations back tests and the
//! worker binary.

pub mod error;
pub mod memory;
pub mod store;

pub use error::{LedgerError, Result};
pub use memory::{InMemoryLedgerStore, InMemoryTransactionRepository};
pub use store::{LedgerStore, TransactionRepository};
