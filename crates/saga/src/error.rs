//! Saga, transfer and coordinator error types.

use std::time::Duration;

use common::{AccountNumber, TransactionId};
use domain::{DomainError, Money};
use ledger::LedgerError;
use messaging::{EventClass, PublishError};
use thiserror::Error;

/// Errors raised by a single saga step.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountNumber),

    /// The source account cannot cover the transfer.
    #[error("Insufficient funds in {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountNumber,
        available: Money,
        requested: Money,
    },

    /// The account or amount does not allow this movement.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The ledger store failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors returned by the saga orchestrator.
#[derive(Debug, Clone, Error)]
pub enum SagaError {
    /// A step failed and the committed steps were compensated.
    #[error("Saga step '{step}' failed: {cause}")]
    StepFailed {
        step: String,
        #[source]
        cause: StepError,
        /// Compensations that themselves failed during the sweep.
        compensation_failures: usize,
    },
}

impl SagaError {
    /// The error of the step that failed.
    pub fn cause(&self) -> &StepError {
        match self {
            SagaError::StepFailed { cause, .. } => cause,
        }
    }

    pub fn step(&self) -> &str {
        match self {
            SagaError::StepFailed { step, .. } => step,
        }
    }

    pub fn compensation_failures(&self) -> usize {
        match self {
            SagaError::StepFailed {
                compensation_failures,
                ..
            } => *compensation_failures,
        }
    }
}

/// Errors returned by the transfer service.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The request was rejected before any step ran.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The saga failed and was compensated.
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// The saga committed but a required event could not be published.
    #[error("{class} event for committed transfer not published (rolled back: {rolled_back}): {source}")]
    Publish {
        class: EventClass,
        #[source]
        source: PublishError,
        /// Whether the committed saga was fully compensated afterwards.
        rolled_back: bool,
    },
}

impl TransferError {
    /// The underlying step error, if a saga step failed.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            TransferError::Saga(error) => Some(error.cause()),
            _ => None,
        }
    }
}

/// Error returned by a participant hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ParticipantError(pub String);

impl From<PublishError> for ParticipantError {
    fn from(error: PublishError) -> Self {
        Self(error.to_string())
    }
}

impl From<TransferError> for ParticipantError {
    fn from(error: TransferError) -> Self {
        Self(error.to_string())
    }
}

/// Why a distributed transaction was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A participant voted abort or failed to prepare.
    Rejected { participant: String, reason: String },
    /// Not every vote arrived within the prepare timeout.
    Timeout(Duration),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Rejected {
                participant,
                reason,
            } => write!(f, "participant '{participant}' rejected: {reason}"),
            AbortReason::Timeout(timeout) => write!(f, "prepare timed out after {timeout:?}"),
        }
    }
}

/// Errors returned by the distributed transaction coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The transaction was aborted and its participants told so.
    #[error("Distributed transaction {id} aborted: {reason}")]
    Aborted { id: TransactionId, reason: AbortReason },

    /// The commit or abort decision could not be announced. The record is
    /// left in COMMITTING or ABORTING.
    #[error("Distributed transaction {id} stalled: {source}")]
    Publish {
        id: TransactionId,
        #[source]
        source: PublishError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}
