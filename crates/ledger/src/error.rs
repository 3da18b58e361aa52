use common::{AccountNumber, TransactionId};
use domain::Money;
use thiserror::Error;

/// Errors that can occur when interacting with the ledger.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// No account exists with this number.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountNumber),

    /// The update would leave the account with a negative balance.
    #[error("Balance of account {account} would become negative: {balance} + ({delta})")]
    NegativeBalance {
        account: AccountNumber,
        balance: Money,
        delta: Money,
    },

    /// The update overflowed the decimal range.
    #[error("Balance overflow on account {0}")]
    Overflow(AccountNumber),

    /// An account with this number already exists.
    #[error("Account already exists: {0}")]
    DuplicateAccount(AccountNumber),

    /// No distributed transaction record exists with this ID.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// A distributed transaction record with this ID already exists.
    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(TransactionId),

    /// The backing store could not serve the request.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
