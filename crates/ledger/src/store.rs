use async_trait::async_trait;
use common::{AccountNumber, TransactionId};
use domain::{Account, DistributedTransaction, Money};

use crate::Result;

/// Account storage as seen by the transfer core.
///
/// Implementations must make `update_balance` atomic per account: two
/// concurrent updates of the same account never lose a write, and an update
/// that would leave the balance negative is rejected without effect.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Looks up an account by number.
    ///
    /// Returns None if no such account exists.
    async fn find_account(&self, account_number: &AccountNumber) -> Result<Option<Account>>;

    /// Atomically adds `delta` (which may be negative) to the balance.
    ///
    /// Returns the new balance.
    async fn update_balance(&self, account_number: &AccountNumber, delta: Money) -> Result<Money>;
}

/// Audit storage for distributed transaction records.
///
/// Records are inserted once and updated in place; they are never deleted.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Stores a new record.
    async fn insert(&self, transaction: DistributedTransaction) -> Result<()>;

    /// Replaces an existing record with its latest state.
    async fn save(&self, transaction: &DistributedTransaction) -> Result<()>;

    /// Retrieves a record by ID.
    async fn find(&self, transaction_id: &TransactionId) -> Result<Option<DistributedTransaction>>;
}
