//! Transaction lifecycle processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use messaging::{Delivery, EventHandler, HandlerError, TransactionEvent, TransactionStatus};

#[derive(Debug, Default)]
struct Tally {
    in_progress: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Follows transfers and distributed transactions through their lifecycle
/// events.
#[derive(Debug, Clone, Default)]
pub struct TransactionProcessor {
    tally: Arc<Tally>,
}

impl TransactionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for transactions still under way.
    pub fn in_progress(&self) -> u64 {
        self.tally.in_progress.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.tally.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.tally.failed.load(Ordering::Relaxed)
    }
}

fn status_label(status: TransactionStatus) -> &'static str {
    match status {
        TransactionStatus::Pending => "pending",
        TransactionStatus::Completed => "completed",
        TransactionStatus::Failed => "failed",
        TransactionStatus::Preparing => "preparing",
        TransactionStatus::Committing => "committing",
        TransactionStatus::Aborting => "aborting",
    }
}

#[async_trait]
impl EventHandler<TransactionEvent> for TransactionProcessor {
    async fn handle(&self, event: TransactionEvent, _delivery: &Delivery) -> Result<(), HandlerError> {
        let status = status_label(event.status);
        match event.status {
            TransactionStatus::Completed => {
                self.tally.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    transaction_id = %event.transaction_id,
                    from = %event.from_account,
                    to = %event.to_account,
                    amount = %event.amount,
                    "transaction completed"
                );
            }
            TransactionStatus::Failed => {
                self.tally.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    transaction_id = %event.transaction_id,
                    description = event.description.as_deref().unwrap_or("none"),
                    "transaction failed"
                );
            }
            TransactionStatus::Pending
            | TransactionStatus::Preparing
            | TransactionStatus::Committing
            | TransactionStatus::Aborting => {
                self.tally.in_progress.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    transaction_id = %event.transaction_id,
                    transaction_type = ?event.transaction_type,
                    status,
                    "transaction in progress"
                );
            }
        }
        metrics::counter!("transaction_events_processed_total", "status" => status).increment(1);
        Ok(())
    }
}
