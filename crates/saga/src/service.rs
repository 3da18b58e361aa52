//! Transfer entry point: runs the transfer saga and announces the result.

use std::str::FromStr;
use std::sync::Arc;

use common::{AccountNumber, Clock, UserId};
use domain::{DistributedTransaction, Money};
use ledger::LedgerStore;
use messaging::{
    Event, EventClass, EventPublisher, MessageChannel, NotificationEvent, NotificationType,
    TransactionEvent, TransactionStatus,
};
use uuid::Uuid;

use crate::error::TransferError;
use crate::orchestrator::{CompletedSaga, SagaOrchestrator};
use crate::step::BalanceChange;
use crate::transfer::transfer_steps;

/// Caller identity, passed explicitly into every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
    pub request_id: String,
}

impl RequestContext {
    /// Creates a context with a fresh request ID.
    pub fn new(user_id: UserId) -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self {
            user_id,
            request_id: format!("REQ-{}", simple[..12].to_uppercase()),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// What to do when an event about a committed transfer cannot be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Log and carry on.
    BestEffort,
    /// Return the error. The transfer stays committed.
    Propagate,
    /// Roll the transfer back, then return the error.
    Compensate,
}

impl PublishPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishPolicy::BestEffort => "best_effort",
            PublishPolicy::Propagate => "propagate",
            PublishPolicy::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for PublishPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PublishPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(PublishPolicy::BestEffort),
            "propagate" => Ok(PublishPolicy::Propagate),
            "compensate" => Ok(PublishPolicy::Compensate),
            other => Err(format!(
                "unknown publish policy '{other}' (expected best_effort, propagate or compensate)"
            )),
        }
    }
}

/// One [`PublishPolicy`] per event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicies {
    pub transaction: PublishPolicy,
    pub balance: PublishPolicy,
    pub notification: PublishPolicy,
}

impl Default for PublishPolicies {
    fn default() -> Self {
        Self {
            transaction: PublishPolicy::Propagate,
            balance: PublishPolicy::BestEffort,
            notification: PublishPolicy::BestEffort,
        }
    }
}

impl PublishPolicies {
    pub fn for_class(&self, class: EventClass) -> PublishPolicy {
        match class {
            EventClass::Transaction => self.transaction,
            EventClass::BalanceChange => self.balance,
            EventClass::Notification => self.notification,
        }
    }
}

/// A transfer between two accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from_account: AccountNumber,
    pub to_account: AccountNumber,
    pub amount: Money,
    pub description: Option<String>,
}

impl TransferRequest {
    pub fn new(from_account: impl Into<AccountNumber>, to_account: impl Into<AccountNumber>, amount: Money) -> Self {
        Self {
            from_account: from_account.into(),
            to_account: to_account.into(),
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<&DistributedTransaction> for TransferRequest {
    fn from(transaction: &DistributedTransaction) -> Self {
        Self {
            from_account: transaction.from_account.clone(),
            to_account: transaction.to_account.clone(),
            amount: transaction.amount,
            description: Some(format!("distributed transaction {}", transaction.transaction_id)),
        }
    }
}

/// Result of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Request ID the events were published under.
    pub reference: String,
    pub balance_changes: Vec<BalanceChange>,
    /// Event classes that failed to publish under a best-effort policy.
    pub unpublished: Vec<EventClass>,
}

/// Runs transfers as debit-then-credit sagas and publishes balance,
/// transaction and notification events once they commit.
pub struct TransferService<S, C> {
    store: S,
    publisher: EventPublisher<C>,
    clock: Arc<dyn Clock>,
    policies: PublishPolicies,
    orchestrator: SagaOrchestrator,
}

impl<S, C> TransferService<S, C>
where
    S: LedgerStore + Clone + 'static,
    C: MessageChannel,
{
    pub fn new(store: S, publisher: EventPublisher<C>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            publisher,
            clock,
            policies: PublishPolicies::default(),
            orchestrator: SagaOrchestrator::new("transfer"),
        }
    }

    pub fn with_policies(mut self, policies: PublishPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &PublishPolicies {
        &self.policies
    }

    /// Rejects non-positive amounts and self-transfers.
    pub fn validate(request: &TransferRequest) -> Result<(), TransferError> {
        request
            .amount
            .ensure_positive()
            .map_err(|e| TransferError::InvalidTransaction(e.to_string()))?;
        if request.from_account == request.to_account {
            return Err(TransferError::InvalidTransaction(format!(
                "source and destination are both {}",
                request.from_account
            )));
        }
        Ok(())
    }

    /// Runs the transfer saga without publishing anything.
    #[tracing::instrument(
        skip(self, request, ctx),
        fields(
            from = %request.from_account,
            to = %request.to_account,
            amount = %request.amount,
            request_id = %ctx.request_id
        )
    )]
    pub async fn run_saga(&self, request: &TransferRequest, ctx: &RequestContext) -> Result<CompletedSaga, TransferError> {
        Self::validate(request)?;
        let steps = transfer_steps(
            &self.store,
            &request.from_account,
            &request.to_account,
            request.amount,
        );
        Ok(self.orchestrator.execute_saga(steps).await?)
    }

    /// Runs the transfer and publishes its events.
    ///
    /// On success: one balance event per account, a completed transaction
    /// event and a notification to the caller, each under its class's
    /// policy. On saga failure a failed transaction event is published
    /// best-effort and the saga error returned.
    #[tracing::instrument(skip(self, request, ctx), fields(user_id = %ctx.user_id, request_id = %ctx.request_id))]
    pub async fn execute_transfer(&self, request: TransferRequest, ctx: &RequestContext) -> Result<TransferReceipt, TransferError> {
        let saga = match self.run_saga(&request, ctx).await {
            Ok(saga) => saga,
            Err(error) => {
                if let TransferError::Saga(_) = &error {
                    self.announce_failure(&request, ctx, &error).await;
                }
                return Err(error);
            }
        };

        let now = self.clock.now();
        let balance_changes = saga.balance_changes();
        let mut saga = Some(saga);
        let mut unpublished = Vec::new();

        for change in &balance_changes {
            self.publish_under_policy(&change.to_event(now), &mut saga, &mut unpublished)
                .await?;
        }

        let mut completed = TransactionEvent::transfer(
            ctx.request_id.clone(),
            request.from_account.clone(),
            request.to_account.clone(),
            request.amount,
            TransactionStatus::Completed,
            now,
        );
        if let Some(description) = &request.description {
            completed = completed.with_description(description.clone());
        }
        self.publish_under_policy(&completed, &mut saga, &mut unpublished)
            .await?;

        let notification = NotificationEvent {
            user_id: ctx.user_id,
            title: "Transfer completed".to_string(),
            message: format!(
                "{} transferred from {} to {}",
                request.amount, request.from_account, request.to_account
            ),
            notification_type: NotificationType::Email,
            timestamp: now,
        };
        self.publish_under_policy(&notification, &mut saga, &mut unpublished)
            .await?;

        tracing::info!(changes = balance_changes.len(), "transfer completed");
        Ok(TransferReceipt {
            reference: ctx.request_id.clone(),
            balance_changes,
            unpublished,
        })
    }

    async fn publish_under_policy<E: Event>(
        &self,
        event: &E,
        saga: &mut Option<CompletedSaga>,
        unpublished: &mut Vec<EventClass>,
    ) -> Result<(), TransferError> {
        let source = match self.publisher.publish_event(event).await {
            Ok(_) => return Ok(()),
            Err(source) => source,
        };

        let class = E::CLASS;
        match self.policies.for_class(class) {
            PublishPolicy::BestEffort => {
                tracing::warn!(%class, error = %source, "event not published, continuing");
                unpublished.push(class);
                Ok(())
            }
            PublishPolicy::Propagate => {
                tracing::error!(%class, error = %source, "event not published, transfer stays committed");
                Err(TransferError::Publish {
                    class,
                    source,
                    rolled_back: false,
                })
            }
            PublishPolicy::Compensate => {
                let failures = match saga.take() {
                    Some(saga) => saga.rollback().await,
                    None => 0,
                };
                tracing::error!(%class, error = %source, failures, "event not published, transfer rolled back");
                Err(TransferError::Publish {
                    class,
                    source,
                    rolled_back: failures == 0,
                })
            }
        }
    }

    async fn announce_failure(&self, request: &TransferRequest, ctx: &RequestContext, error: &TransferError) {
        let event = TransactionEvent::transfer(
            ctx.request_id.clone(),
            request.from_account.clone(),
            request.to_account.clone(),
            request.amount,
            TransactionStatus::Failed,
            self.clock.now(),
        )
        .with_description(error.to_string());

        if let Err(publish_error) = self.publisher.publish_event(&event).await {
            tracing::warn!(error = %publish_error, "failed transfer event not published");
        }
    }
}
