//! Audit trail fed from the audit queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use messaging::{Delivery, EventHandler, HandlerError, TransactionEvent};

/// Logs every transaction event routed to the audit queue and keeps the
/// most recent ones in memory.
///
/// The log line is the durable record; the in-memory trail is capped.
#[derive(Debug, Clone)]
pub struct AuditLog {
    entries: Arc<Mutex<VecDeque<TransactionEvent>>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Retained events in arrival order.
    pub fn entries(&self) -> Vec<TransactionEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventHandler<TransactionEvent> for AuditLog {
    async fn handle(&self, event: TransactionEvent, delivery: &Delivery) -> Result<(), HandlerError> {
        tracing::info!(
            target: "audit",
            transaction_id = %event.transaction_id,
            transaction_type = ?event.transaction_type,
            status = ?event.status,
            from = %event.from_account,
            to = %event.to_account,
            amount = %event.amount,
            redelivered = delivery.redelivered(),
            "transaction audited"
        );
        metrics::counter!("audit_events_total").increment(1);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
        Ok(())
    }
}
