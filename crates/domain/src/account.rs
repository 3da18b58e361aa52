//! Ledger account.

use chrono::{DateTime, Utc};
use common::{AccountNumber, UserId};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Lifecycle status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Account can be debited and credited.
    #[default]
    Active,

    /// Account is temporarily blocked by an operator.
    Frozen,

    /// Account is suspended pending review.
    Suspended,
}

impl AccountStatus {
    /// Returns true if balance movements are allowed.
    pub fn accepts_movements(&self) -> bool {
        matches!(self, AccountStatus::Active)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A ledger account as seen by the transfer core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_number: AccountNumber,
    pub owner: UserId,
    pub balance: Money,
    pub currency: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Opens an active account with the given starting balance.
    pub fn open(
        account_number: impl Into<AccountNumber>,
        owner: UserId,
        balance: Money,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            account_number: account_number.into(),
            owner,
            balance,
            currency: currency.into(),
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a copy with a different status.
    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true if the account holds at least `amount`.
    pub fn can_cover(&self, amount: Money) -> bool {
        self.balance >= amount
    }
}
