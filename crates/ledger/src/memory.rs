use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{AccountNumber, TransactionId};
use domain::{Account, DistributedTransaction, Money};
use tokio::sync::RwLock;

use crate::store::{LedgerStore, TransactionRepository};
use crate::{LedgerError, Result};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountNumber, Account>,
    failing: HashSet<AccountNumber>,
}

/// In-memory ledger for tests and the worker binary.
///
/// Every balance update holds the write lock for its whole
/// read-modify-write, which gives per-account atomicity.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account to the ledger.
    pub async fn open_account(&self, account: Account) -> Result<()> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.account_number) {
            return Err(LedgerError::DuplicateAccount(account.account_number));
        }
        state
            .accounts
            .insert(account.account_number.clone(), account);
        Ok(())
    }

    /// Returns the current balance of an account, if it exists.
    pub async fn balance_of(&self, account_number: &AccountNumber) -> Option<Money> {
        self.state
            .read()
            .await
            .accounts
            .get(account_number)
            .map(|a| a.balance)
    }

    /// Returns the sum of all balances.
    pub async fn total_balance(&self) -> Money {
        self.state
            .read()
            .await
            .accounts
            .values()
            .fold(Money::zero(), |sum, a| sum + a.balance)
    }

    /// Makes every balance update of `account_number` fail with
    /// [`LedgerError::Unavailable`] until switched off again.
    pub async fn set_fail_on_update(&self, account_number: &AccountNumber, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing.insert(account_number.clone());
        } else {
            state.failing.remove(account_number);
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find_account(&self, account_number: &AccountNumber) -> Result<Option<Account>> {
        Ok(self.state.read().await.accounts.get(account_number).cloned())
    }

    async fn update_balance(&self, account_number: &AccountNumber, delta: Money) -> Result<Money> {
        let mut state = self.state.write().await;

        if state.failing.contains(account_number) {
            return Err(LedgerError::Unavailable(format!(
                "updates to {account_number} are failing"
            )));
        }

        let account = state
            .accounts
            .get_mut(account_number)
            .ok_or_else(|| LedgerError::AccountNotFound(account_number.clone()))?;

        let new_balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::Overflow(account_number.clone()))?;

        if new_balance.is_negative() {
            return Err(LedgerError::NegativeBalance {
                account: account_number.clone(),
                balance: account.balance,
                delta,
            });
        }

        account.balance = new_balance;
        account.updated_at = Utc::now();
        tracing::debug!(account = %account_number, %delta, balance = %new_balance, "balance updated");

        Ok(new_balance)
    }
}

/// In-memory distributed transaction repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionRepository {
    records: Arc<RwLock<HashMap<TransactionId, DistributedTransaction>>>,
}

impl InMemoryTransactionRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn insert(&self, transaction: DistributedTransaction) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&transaction.transaction_id) {
            return Err(LedgerError::DuplicateTransaction(
                transaction.transaction_id,
            ));
        }
        records.insert(transaction.transaction_id.clone(), transaction);
        Ok(())
    }

    async fn save(&self, transaction: &DistributedTransaction) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&transaction.transaction_id) {
            Some(existing) => {
                *existing = transaction.clone();
                Ok(())
            }
            None => Err(LedgerError::TransactionNotFound(
                transaction.transaction_id.clone(),
            )),
        }
    }

    async fn find(&self, transaction_id: &TransactionId) -> Result<Option<DistributedTransaction>> {
        Ok(self.records.read().await.get(transaction_id).cloned())
    }
}
