//! Prepare-phase participants of a distributed transaction.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{Clock, TransactionId};
use domain::DistributedTransaction;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use ledger::LedgerStore;
use messaging::{EventPublisher, MessageChannel, TransactionEvent, TransactionStatus, TransactionType};

use crate::error::{AbortReason, ParticipantError};
use crate::orchestrator::CompletedSaga;
use crate::service::{RequestContext, TransferRequest, TransferService};

/// A participant's answer to `prepare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort { reason: String },
}

/// Takes part in the prepare/commit/abort protocol.
///
/// `prepare` runs in its own task and is never cancelled, even when the
/// coordinator stops waiting for it. `commit` and `abort` are notifications
/// of a decision already taken; their errors are logged, not acted on.
#[async_trait]
pub trait Participant: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called before the prepare task is spawned. A decision can reach
    /// `abort` before that task is first polled.
    fn begin(&self, _transaction: &DistributedTransaction) {}

    async fn prepare(&self, transaction: &DistributedTransaction, ctx: &RequestContext) -> Result<Vote, ParticipantError>;

    async fn commit(&self, transaction: &DistributedTransaction) -> Result<(), ParticipantError>;

    async fn abort(&self, transaction: &DistributedTransaction) -> Result<(), ParticipantError>;
}

/// Announces the prepare phase on the transaction exchange and votes
/// commit iff the announcement was confirmed.
pub struct PrepareAnnouncer<C> {
    publisher: EventPublisher<C>,
    clock: Arc<dyn Clock>,
}

impl<C: MessageChannel> PrepareAnnouncer<C> {
    pub fn new(publisher: EventPublisher<C>, clock: Arc<dyn Clock>) -> Self {
        Self { publisher, clock }
    }
}

#[async_trait]
impl<C: MessageChannel + 'static> Participant for PrepareAnnouncer<C> {
    fn name(&self) -> &str {
        "prepare-announcer"
    }

    async fn prepare(&self, transaction: &DistributedTransaction, _ctx: &RequestContext) -> Result<Vote, ParticipantError> {
        let event = TransactionEvent::distributed(
            transaction,
            TransactionType::DistributedTransferPrepare,
            TransactionStatus::Preparing,
            self.clock.now(),
        );
        match self.publisher.publish_event(&event).await {
            Ok(_) => Ok(Vote::Commit),
            Err(error) => Ok(Vote::Abort {
                reason: error.to_string(),
            }),
        }
    }

    async fn commit(&self, _transaction: &DistributedTransaction) -> Result<(), ParticipantError> {
        Ok(())
    }

    async fn abort(&self, _transaction: &DistributedTransaction) -> Result<(), ParticipantError> {
        Ok(())
    }
}

enum Slot {
    Running,
    Prepared(CompletedSaga),
    /// Abort arrived while the saga was still running.
    Aborted,
}

/// Moves the money during prepare by running the transfer saga, keeps it
/// on commit and rolls it back on abort.
///
/// An abort that arrives while the saga is still running (after a prepare
/// timeout) is remembered; the saga is rolled back as soon as it finishes.
pub struct LedgerTransferParticipant<S, C> {
    service: Arc<TransferService<S, C>>,
    slots: Mutex<HashMap<TransactionId, Slot>>,
}

impl<S, C> LedgerTransferParticipant<S, C>
where
    S: LedgerStore + Clone + 'static,
    C: MessageChannel + 'static,
{
    pub fn new(service: Arc<TransferService<S, C>>) -> Self {
        Self {
            service,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Number of transactions prepared or preparing but not yet decided.
    pub fn in_flight(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<TransactionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum PrepareStart {
    Run,
    AlreadyAborted,
    AlreadyPrepared,
}

enum PrepareDecision {
    Commit,
    Abort(String),
    RollBackLate(CompletedSaga),
}

#[async_trait]
impl<S, C> Participant for LedgerTransferParticipant<S, C>
where
    S: LedgerStore + Clone + 'static,
    C: MessageChannel + 'static,
{
    fn name(&self) -> &str {
        "ledger-transfer"
    }

    fn begin(&self, transaction: &DistributedTransaction) {
        self.slots()
            .entry(transaction.transaction_id.clone())
            .or_insert(Slot::Running);
    }

    async fn prepare(&self, transaction: &DistributedTransaction, ctx: &RequestContext) -> Result<Vote, ParticipantError> {
        let id = transaction.transaction_id.clone();
        let start = {
            let mut slots = self.slots();
            match slots.entry(id.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Slot::Running);
                    PrepareStart::Run
                }
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Running => PrepareStart::Run,
                    Slot::Aborted => {
                        entry.remove();
                        PrepareStart::AlreadyAborted
                    }
                    Slot::Prepared(_) => PrepareStart::AlreadyPrepared,
                },
            }
        };
        match start {
            PrepareStart::Run => {}
            PrepareStart::AlreadyAborted => {
                tracing::info!(transaction_id = %id, "abort arrived before prepare, saga not started");
                return Ok(Vote::Abort {
                    reason: "aborted before prepare started".to_string(),
                });
            }
            PrepareStart::AlreadyPrepared => {
                return Err(ParticipantError(format!("{id} is already prepared")));
            }
        }

        let result = self
            .service
            .run_saga(&TransferRequest::from(transaction), ctx)
            .await;

        let decision = {
            let mut slots = self.slots();
            let aborted = matches!(slots.remove(&id), Some(Slot::Aborted));
            match result {
                Ok(saga) if aborted => PrepareDecision::RollBackLate(saga),
                Ok(saga) => {
                    slots.insert(id.clone(), Slot::Prepared(saga));
                    PrepareDecision::Commit
                }
                Err(error) => PrepareDecision::Abort(error.to_string()),
            }
        };

        match decision {
            PrepareDecision::Commit => Ok(Vote::Commit),
            PrepareDecision::Abort(reason) => Ok(Vote::Abort { reason }),
            PrepareDecision::RollBackLate(saga) => {
                let failures = saga.rollback().await;
                tracing::warn!(transaction_id = %id, failures, "saga finished after abort, rolled back");
                Ok(Vote::Abort {
                    reason: "aborted before prepare completed".to_string(),
                })
            }
        }
    }

    async fn commit(&self, transaction: &DistributedTransaction) -> Result<(), ParticipantError> {
        self.slots().remove(&transaction.transaction_id);
        Ok(())
    }

    async fn abort(&self, transaction: &DistributedTransaction) -> Result<(), ParticipantError> {
        let prepared = {
            let mut slots = self.slots();
            match slots.remove(&transaction.transaction_id) {
                Some(Slot::Prepared(saga)) => Some(saga),
                Some(Slot::Running) => {
                    slots.insert(transaction.transaction_id.clone(), Slot::Aborted);
                    None
                }
                Some(Slot::Aborted) | None => None,
            }
        };

        let Some(saga) = prepared else {
            return Ok(());
        };
        match saga.rollback().await {
            0 => Ok(()),
            failures => Err(ParticipantError(format!(
                "{failures} compensations failed rolling back {}",
                transaction.transaction_id
            ))),
        }
    }
}

/// Result of the prepare phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    Commit,
    Abort(AbortReason),
}

/// Runs every participant's `prepare` in its own task and AND-combines
/// the votes within a bounded wait.
///
/// Votes are taken as they arrive; the first negative one ends the wait.
pub struct VoteCollector<'a> {
    participants: &'a [Arc<dyn Participant>],
    clock: &'a Arc<dyn Clock>,
    timeout: Duration,
}

impl<'a> VoteCollector<'a> {
    pub fn new(participants: &'a [Arc<dyn Participant>], clock: &'a Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            participants,
            clock,
            timeout,
        }
    }

    pub async fn collect(&self, transaction: &DistributedTransaction, ctx: &RequestContext) -> PrepareOutcome {
        for participant in self.participants {
            participant.begin(transaction);
        }

        let mut pending: FuturesUnordered<_> = self
            .participants
            .iter()
            .map(|participant| {
                let participant = Arc::clone(participant);
                let transaction = transaction.clone();
                let ctx = ctx.clone();
                let name = participant.name().to_string();
                let handle = tokio::spawn(async move { participant.prepare(&transaction, &ctx).await });
                async move { (name, handle.await) }
            })
            .collect();

        let votes = async move {
            while let Some((participant, vote)) = pending.next().await {
                let rejection = match vote {
                    Ok(Ok(Vote::Commit)) => continue,
                    Ok(Ok(Vote::Abort { reason })) => reason,
                    Ok(Err(error)) => error.to_string(),
                    Err(error) => format!("prepare task failed: {error}"),
                };
                return PrepareOutcome::Abort(AbortReason::Rejected {
                    participant,
                    reason: rejection,
                });
            }
            PrepareOutcome::Commit
        };

        tokio::select! {
            biased;
            outcome = votes => outcome,
            _ = self.clock.sleep(self.timeout) => PrepareOutcome::Abort(AbortReason::Timeout(self.timeout)),
        }
    }
}
