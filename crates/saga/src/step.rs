use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AccountNumber;
use domain::Money;
use messaging::{BalanceChangeEvent, BalanceOperation};

use crate::error::StepError;

/// One reversible unit of work in a saga.
///
/// A step is single-use. `compensate` undoes exactly what a successful
/// `execute` did and is a no-op if `execute` never succeeded.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn execute(&mut self) -> Result<(), StepError>;

    async fn compensate(&mut self) -> Result<(), StepError>;

    /// The balance change this step applied, if it is currently applied.
    fn balance_change(&self) -> Option<BalanceChange> {
        None
    }
}

/// A balance movement applied by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub account: AccountNumber,
    pub old_balance: Money,
    pub new_balance: Money,
    pub operation: BalanceOperation,
}

impl BalanceChange {
    pub fn to_event(&self, timestamp: DateTime<Utc>) -> BalanceChangeEvent {
        BalanceChangeEvent {
            account_number: self.account.clone(),
            old_balance: self.old_balance,
            new_balance: self.new_balance,
            operation: self.operation,
            timestamp,
        }
    }
}
