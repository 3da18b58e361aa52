//! Distributed transaction audit record.

use chrono::{DateTime, Utc};
use common::{AccountNumber, TransactionId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;
use crate::state::DistributedTransactionStatus;

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: DistributedTransactionStatus,
    pub to: DistributedTransactionStatus,
    pub at: DateTime<Utc>,
}

/// A transfer wrapped in a prepare/commit/abort envelope.
///
/// Records are created in `Initiated`, mutated only by the coordinator and
/// never deleted. Every transition is appended to `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedTransaction {
    pub transaction_id: TransactionId,
    pub from_account: AccountNumber,
    pub to_account: AccountNumber,
    pub amount: Money,
    status: DistributedTransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<String>,
    history: Vec<StatusChange>,
}

impl DistributedTransaction {
    /// Creates a new record in `Initiated`.
    pub fn new(
        transaction_id: TransactionId,
        from_account: AccountNumber,
        to_account: AccountNumber,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            from_account,
            to_account,
            amount,
            status: DistributedTransactionStatus::Initiated,
            created_at: now,
            updated_at: now,
            metadata: None,
            history: Vec::new(),
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> DistributedTransactionStatus {
        self.status
    }

    /// Returns the recorded transitions, oldest first.
    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    /// Returns every status the record has been in, starting with `Initiated`.
    pub fn status_path(&self) -> Vec<DistributedTransactionStatus> {
        let mut path = vec![DistributedTransactionStatus::Initiated];
        path.extend(self.history.iter().map(|change| change.to));
        path
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow.
    pub fn transition_to(
        &mut self,
        next: DistributedTransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.history.push(StatusChange {
            from: self.status,
            to: next,
            at,
        });
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Appends a note to the free-form metadata string.
    pub fn annotate(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        self.metadata = Some(match self.metadata.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note.to_string(),
        });
    }
}
