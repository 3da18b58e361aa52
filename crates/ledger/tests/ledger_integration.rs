//! Concurrency tests for the in-memory ledger.

use common::{AccountNumber, UserId};
use domain::{Account, Money};
use futures_util::future::join_all;
use ledger::{InMemoryLedgerStore, LedgerError, LedgerStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let store = InMemoryLedgerStore::new();
    let number = AccountNumber::new("ACC-SHARED");
    store
        .open_account(Account::open(
            number.clone(),
            UserId::new(),
            Money::from_major(100),
            "USD",
        ))
        .await
        .unwrap();

    let tasks = (0..50).map(|_| {
        let store = store.clone();
        let number = number.clone();
        tokio::spawn(async move { store.update_balance(&number, -Money::from_major(3)).await })
    });

    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::NegativeBalance { .. })))
        .count();

    assert_eq!(succeeded, 33);
    assert_eq!(rejected, 17);
    assert_eq!(store.balance_of(&number).await, Some(Money::from_major(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_are_not_lost() {
    let store = InMemoryLedgerStore::new();
    let number = AccountNumber::new("ACC-CREDIT");
    store
        .open_account(Account::open(
            number.clone(),
            UserId::new(),
            Money::zero(),
            "USD",
        ))
        .await
        .unwrap();

    let tasks = (0..100).map(|_| {
        let store = store.clone();
        let number = number.clone();
        tokio::spawn(async move { store.update_balance(&number, Money::from_cents(1)).await })
    });

    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(store.balance_of(&number).await, Some(Money::from_major(1)));
}
