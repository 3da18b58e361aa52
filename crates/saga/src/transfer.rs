//! Debit and credit steps of a ledger transfer.

use async_trait::async_trait;
use common::AccountNumber;
use domain::{Account, Money};
use ledger::{LedgerError, LedgerStore};
use messaging::BalanceOperation;

use crate::error::StepError;
use crate::orchestrator::BoxedStep;
use crate::step::{BalanceChange, SagaStep};

pub const RESERVE_FROM_ACCOUNT: &str = "ReserveFromAccount";
pub const CREDIT_TO_ACCOUNT: &str = "CreditToAccount";

/// Builds the debit-then-credit step list for a transfer.
pub fn transfer_steps<S>(store: &S, from: &AccountNumber, to: &AccountNumber, amount: Money) -> Vec<BoxedStep>
where
    S: LedgerStore + Clone + 'static,
{
    vec![
        Box::new(ReserveFromAccount::new(store.clone(), from.clone(), amount)),
        Box::new(CreditToAccount::new(store.clone(), to.clone(), amount)),
    ]
}

async fn load_active<S: LedgerStore>(store: &S, number: &AccountNumber) -> Result<Account, StepError> {
    let account = store
        .find_account(number)
        .await?
        .ok_or_else(|| StepError::AccountNotFound(number.clone()))?;

    if !account.status.accepts_movements() {
        return Err(StepError::InvalidTransaction(format!(
            "account {number} is {}",
            account.status
        )));
    }
    Ok(account)
}

fn require_positive(amount: Money) -> Result<(), StepError> {
    amount
        .ensure_positive()
        .map(|_| ())
        .map_err(|e| StepError::InvalidTransaction(e.to_string()))
}

/// Debits the source account.
pub struct ReserveFromAccount<S> {
    store: S,
    account: AccountNumber,
    amount: Money,
    /// Pre- and post-debit balances while the debit is applied.
    applied: Option<BalanceChange>,
}

impl<S: LedgerStore> ReserveFromAccount<S> {
    pub fn new(store: S, account: AccountNumber, amount: Money) -> Self {
        Self {
            store,
            account,
            amount,
            applied: None,
        }
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> SagaStep for ReserveFromAccount<S> {
    fn name(&self) -> &str {
        RESERVE_FROM_ACCOUNT
    }

    async fn execute(&mut self) -> Result<(), StepError> {
        let account = load_active(&self.store, &self.account).await?;
        require_positive(self.amount)?;

        if !account.can_cover(self.amount) {
            return Err(StepError::InsufficientFunds {
                account: self.account.clone(),
                available: account.balance,
                requested: self.amount,
            });
        }

        let new_balance = match self.store.update_balance(&self.account, -self.amount).await {
            Ok(balance) => balance,
            // A concurrent debit got there first.
            Err(LedgerError::NegativeBalance { balance, .. }) => {
                return Err(StepError::InsufficientFunds {
                    account: self.account.clone(),
                    available: balance,
                    requested: self.amount,
                });
            }
            Err(error) => return Err(error.into()),
        };

        self.applied = Some(BalanceChange {
            account: self.account.clone(),
            old_balance: new_balance + self.amount,
            new_balance,
            operation: BalanceOperation::Debit,
        });
        tracing::debug!(account = %self.account, amount = %self.amount, %new_balance, "funds reserved");
        Ok(())
    }

    async fn compensate(&mut self) -> Result<(), StepError> {
        if self.applied.is_none() {
            return Ok(());
        }
        let balance = self.store.update_balance(&self.account, self.amount).await?;
        self.applied = None;
        tracing::info!(account = %self.account, amount = %self.amount, %balance, "reservation released");
        Ok(())
    }

    fn balance_change(&self) -> Option<BalanceChange> {
        self.applied.clone()
    }
}

/// Credits the destination account.
pub struct CreditToAccount<S> {
    store: S,
    account: AccountNumber,
    amount: Money,
    applied: Option<BalanceChange>,
}

impl<S: LedgerStore> CreditToAccount<S> {
    pub fn new(store: S, account: AccountNumber, amount: Money) -> Self {
        Self {
            store,
            account,
            amount,
            applied: None,
        }
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> SagaStep for CreditToAccount<S> {
    fn name(&self) -> &str {
        CREDIT_TO_ACCOUNT
    }

    async fn execute(&mut self) -> Result<(), StepError> {
        load_active(&self.store, &self.account).await?;
        require_positive(self.amount)?;

        let new_balance = self.store.update_balance(&self.account, self.amount).await?;
        self.applied = Some(BalanceChange {
            account: self.account.clone(),
            old_balance: new_balance - self.amount,
            new_balance,
            operation: BalanceOperation::Credit,
        });
        tracing::debug!(account = %self.account, amount = %self.amount, %new_balance, "funds credited");
        Ok(())
    }

    async fn compensate(&mut self) -> Result<(), StepError> {
        if self.applied.is_none() {
            return Ok(());
        }
        let balance = self.store.update_balance(&self.account, -self.amount).await?;
        self.applied = None;
        tracing::info!(account = %self.account, amount = %self.amount, %balance, "credit reversed");
        Ok(())
    }

    fn balance_change(&self) -> Option<BalanceChange> {
        self.applied.clone()
    }
}
