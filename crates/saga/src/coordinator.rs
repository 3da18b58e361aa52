//! Prepare/commit/abort coordination of distributed transfers.

use std::sync::Arc;
use std::time::Duration;

use common::{AccountNumber, Clock, TransactionId};
use domain::{DistributedTransaction, DistributedTransactionStatus, Money};
use ledger::TransactionRepository;
use messaging::{EventPublisher, MessageChannel, PublishError, TransactionEvent, TransactionStatus, TransactionType};

use crate::error::{AbortReason, CoordinatorError};
use crate::participant::{Participant, PrepareAnnouncer, PrepareOutcome, VoteCollector};
use crate::service::RequestContext;

/// Tunables of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Upper bound on the whole prepare phase.
    pub prepare_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives distributed transfers through the two-phase state machine and
/// keeps an audit record of every transition.
///
/// The coordinator starts with a single [`PrepareAnnouncer`]; further
/// participants are added with [`register`](Self::register).
pub struct DistributedTransactionCoordinator<R, C> {
    repository: R,
    publisher: EventPublisher<C>,
    clock: Arc<dyn Clock>,
    participants: Vec<Arc<dyn Participant>>,
    config: CoordinatorConfig,
}

impl<R, C> DistributedTransactionCoordinator<R, C>
where
    R: TransactionRepository,
    C: MessageChannel + Clone + 'static,
{
    pub fn new(repository: R, publisher: EventPublisher<C>, clock: Arc<dyn Clock>) -> Self {
        let announcer: Arc<dyn Participant> =
            Arc::new(PrepareAnnouncer::new(publisher.clone(), clock.clone()));
        Self {
            repository,
            publisher,
            clock,
            participants: vec![announcer],
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a participant. Decisions are delivered in registration order.
    pub fn register(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn participant_names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name()).collect()
    }

    /// Runs a transfer of `amount` from `from` to `to` as a distributed
    /// transaction.
    ///
    /// Returns the transaction ID once COMMITTED. An aborted transaction
    /// returns [`CoordinatorError::Aborted`] after reaching ABORTED. Participants
    /// always hear the decision. When the commit or abort event cannot be
    /// published the record stays in COMMITTING or ABORTING and
    /// [`CoordinatorError::Publish`] is returned.
    #[tracing::instrument(
        skip_all,
        fields(
            %from,
            %to,
            %amount,
            request_id = %ctx.request_id,
            transaction_id = tracing::field::Empty
        )
    )]
    pub async fn initiate_distributed_transfer(
        &self,
        from: AccountNumber,
        to: AccountNumber,
        amount: Money,
        ctx: &RequestContext,
    ) -> Result<TransactionId, CoordinatorError> {
        let amount = amount
            .ensure_positive()
            .map_err(|e| CoordinatorError::InvalidTransaction(e.to_string()))?;
        if from == to {
            return Err(CoordinatorError::InvalidTransaction(format!(
                "source and destination are both {from}"
            )));
        }

        metrics::counter!("distributed_transactions_total").increment(1);
        let started = std::time::Instant::now();

        let mut transaction =
            DistributedTransaction::new(TransactionId::generate(), from, to, amount, self.clock.now());
        tracing::Span::current().record("transaction_id", tracing::field::display(&transaction.transaction_id));
        self.repository.insert(transaction.clone()).await?;
        self.advance(&mut transaction, DistributedTransactionStatus::Preparing)
            .await?;

        let outcome = VoteCollector::new(&self.participants, &self.clock, self.config.prepare_timeout)
            .collect(&transaction, ctx)
            .await;

        let result = match outcome {
            PrepareOutcome::Commit => self.commit(transaction).await,
            PrepareOutcome::Abort(reason) => self.abort(transaction, reason).await,
        };

        let outcome_label = match &result {
            Ok(_) => "committed",
            Err(CoordinatorError::Aborted { .. }) => "aborted",
            Err(_) => "stalled",
        };
        metrics::counter!("distributed_transaction_outcomes_total", "outcome" => outcome_label).increment(1);
        metrics::histogram!("distributed_transaction_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Returns the audit record of a transaction.
    pub async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<DistributedTransaction>, CoordinatorError> {
        Ok(self.repository.find(transaction_id).await?)
    }

    async fn commit(&self, mut transaction: DistributedTransaction) -> Result<TransactionId, CoordinatorError> {
        self.advance(&mut transaction, DistributedTransactionStatus::Prepared)
            .await?;
        self.advance(&mut transaction, DistributedTransactionStatus::Committing)
            .await?;
        let announced = self
            .announce(
                &transaction,
                TransactionType::DistributedTransferCommit,
                TransactionStatus::Committing,
            )
            .await;

        for participant in &self.participants {
            if let Err(error) = participant.commit(&transaction).await {
                tracing::warn!(participant = participant.name(), %error, "participant commit failed");
            }
        }

        if let Err(source) = announced {
            return Err(self.stall(&mut transaction, source).await);
        }
        self.advance(&mut transaction, DistributedTransactionStatus::Committed)
            .await?;
        tracing::info!(transaction_id = %transaction.transaction_id, "distributed transaction committed");
        Ok(transaction.transaction_id)
    }

    async fn abort(
        &self,
        mut transaction: DistributedTransaction,
        reason: AbortReason,
    ) -> Result<TransactionId, CoordinatorError> {
        let negative = match reason {
            AbortReason::Timeout(_) => DistributedTransactionStatus::TimedOut,
            AbortReason::Rejected { .. } => DistributedTransactionStatus::Failed,
        };
        tracing::warn!(transaction_id = %transaction.transaction_id, %reason, "prepare phase failed, aborting");

        transaction.annotate(reason.to_string());
        self.advance(&mut transaction, negative).await?;
        self.advance(&mut transaction, DistributedTransactionStatus::Aborting)
            .await?;
        let announced = self
            .announce(
                &transaction,
                TransactionType::DistributedTransferAbort,
                TransactionStatus::Aborting,
            )
            .await;

        for participant in &self.participants {
            if let Err(error) = participant.abort(&transaction).await {
                tracing::error!(participant = participant.name(), %error, "participant abort failed");
            }
        }

        if let Err(source) = announced {
            return Err(self.stall(&mut transaction, source).await);
        }
        self.advance(&mut transaction, DistributedTransactionStatus::Aborted)
            .await?;
        Err(CoordinatorError::Aborted {
            id: transaction.transaction_id,
            reason,
        })
    }

    async fn advance(
        &self,
        transaction: &mut DistributedTransaction,
        next: DistributedTransactionStatus,
    ) -> Result<(), CoordinatorError> {
        let from = transaction.status();
        transaction.transition_to(next, self.clock.now())?;
        self.repository.save(transaction).await?;
        tracing::debug!(transaction_id = %transaction.transaction_id, %from, to = %next, "status changed");
        Ok(())
    }

    async fn announce(
        &self,
        transaction: &DistributedTransaction,
        transaction_type: TransactionType,
        status: TransactionStatus,
    ) -> Result<(), PublishError> {
        let event = TransactionEvent::distributed(transaction, transaction_type, status, self.clock.now());
        self.publisher.publish_event(&event).await.map(|_| ())
    }

    /// Records that the decision was applied locally but never announced.
    /// The record stays in COMMITTING or ABORTING.
    async fn stall(&self, transaction: &mut DistributedTransaction, error: PublishError) -> CoordinatorError {
        transaction.annotate(format!("decision not published: {error}"));
        if let Err(save_error) = self.repository.save(transaction).await {
            tracing::error!(transaction_id = %transaction.transaction_id, %save_error, "could not record stalled transaction");
        }
        metrics::counter!("distributed_transactions_stalled_total").increment(1);
        tracing::error!(
            transaction_id = %transaction.transaction_id,
            status = %transaction.status(),
            %error,
            "decision not published, transaction requires manual resolution"
        );
        CoordinatorError::Publish {
            id: transaction.transaction_id.clone(),
            source: error,
        }
    }
}
