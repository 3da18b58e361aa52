//! Account balance change processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use messaging::{BalanceChangeEvent, BalanceOperation, Delivery, EventHandler, HandlerError};

#[derive(Debug, Default)]
struct Tally {
    debits: AtomicU64,
    credits: AtomicU64,
}

/// Logs committed balance changes and counts them per operation.
#[derive(Debug, Clone, Default)]
pub struct BalanceMonitor {
    tally: Arc<Tally>,
}

impl BalanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debits(&self) -> u64 {
        self.tally.debits.load(Ordering::Relaxed)
    }

    pub fn credits(&self) -> u64 {
        self.tally.credits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler<BalanceChangeEvent> for BalanceMonitor {
    async fn handle(&self, event: BalanceChangeEvent, _delivery: &Delivery) -> Result<(), HandlerError> {
        let operation = match event.operation {
            BalanceOperation::Debit => {
                self.tally.debits.fetch_add(1, Ordering::Relaxed);
                "debit"
            }
            BalanceOperation::Credit => {
                self.tally.credits.fetch_add(1, Ordering::Relaxed);
                "credit"
            }
        };
        tracing::info!(
            account = %event.account_number,
            operation,
            old_balance = %event.old_balance,
            new_balance = %event.new_balance,
            "balance changed"
        );
        metrics::counter!("balance_changes_total", "operation" => operation).increment(1);
        Ok(())
    }
}
