//! Domain error types.

use thiserror::Error;

use crate::money::Money;
use crate::state::DistributedTransactionStatus;

/// Errors raised by domain invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The state machine does not allow this transition.
    #[error("Invalid transaction state transition: {from} -> {to}")]
    InvalidTransition {
        from: DistributedTransactionStatus,
        to: DistributedTransactionStatus,
    },

    /// Transfer amounts must be strictly positive.
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Money),
}
