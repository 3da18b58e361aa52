//! Distributed transaction coordinator tests. Most time-dependent tests run
//! on a paused tokio runtime with the system clock, so timeouts fire in
//! virtual time; the rest drive a frozen `ManualClock` by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{AccountNumber, Clock, ManualClock, SystemClock, UserId};
use domain::{Account, DistributedTransaction, DistributedTransactionStatus, Money};
use ledger::{InMemoryLedgerStore, InMemoryTransactionRepository, LedgerStore};
use messaging::{
    EventPublisher, InMemoryMessageChannel, MessageChannel, QueueSettings, RetryPolicy, Topology,
    TransactionEvent, TransactionType,
};
use rust_decimal_macros::dec;
use saga::{
    AbortReason, CoordinatorError, DistributedTransactionCoordinator, LedgerTransferParticipant,
    Participant, ParticipantError, RequestContext, TransferService, Vote,
};

use DistributedTransactionStatus::*;

type TestCoordinator = DistributedTransactionCoordinator<InMemoryTransactionRepository, InMemoryMessageChannel>;

/// Delays every balance update, so a saga can outlive the prepare timeout.
#[derive(Clone)]
struct SlowLedger {
    inner: InMemoryLedgerStore,
    delay: Duration,
}

#[async_trait]
impl LedgerStore for SlowLedger {
    async fn find_account(&self, account_number: &AccountNumber) -> ledger::Result<Option<Account>> {
        self.inner.find_account(account_number).await
    }

    async fn update_balance(&self, account_number: &AccountNumber, delta: Money) -> ledger::Result<Money> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_balance(account_number, delta).await
    }
}

/// Scripted participant that records the decision it was told about.
struct Scripted {
    name: &'static str,
    delay: Duration,
    vote: Vote,
    /// Faults injected into the broker once prepare finishes.
    fail_publishes_after_prepare: Option<(InMemoryMessageChannel, u32)>,
    decisions: Mutex<Vec<&'static str>>,
}

impl Scripted {
    fn new(name: &'static str, vote: Vote) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            vote,
            fail_publishes_after_prepare: None,
            decisions: Mutex::new(Vec::new()),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn breaking_broker(mut self, channel: &InMemoryMessageChannel, publishes: u32) -> Self {
        self.fail_publishes_after_prepare = Some((channel.clone(), publishes));
        self
    }

    fn decisions(&self) -> Vec<&'static str> {
        self.decisions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Participant for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    async fn prepare(&self, _tx: &DistributedTransaction, _ctx: &RequestContext) -> Result<Vote, ParticipantError> {
        tokio::time::sleep(self.delay).await;
        if let Some((channel, count)) = &self.fail_publishes_after_prepare {
            channel.fail_next_publishes(*count).await;
        }
        Ok(self.vote.clone())
    }

    async fn commit(&self, _tx: &DistributedTransaction) -> Result<(), ParticipantError> {
        self.decisions.lock().unwrap().push("commit");
        Ok(())
    }

    async fn abort(&self, _tx: &DistributedTransaction) -> Result<(), ParticipantError> {
        self.decisions.lock().unwrap().push("abort");
        Ok(())
    }
}

struct TestHarness {
    store: InMemoryLedgerStore,
    channel: InMemoryMessageChannel,
    repository: InMemoryTransactionRepository,
    clock: Arc<dyn Clock>,
    ctx: RequestContext,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock)).await
    }

    async fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let channel = InMemoryMessageChannel::with_clock(clock.clone());
        channel
            .declare(&Topology::standard(QueueSettings::default()))
            .await
            .unwrap();
        let store = InMemoryLedgerStore::new();
        store
            .open_account(Account::open("ACC1", UserId::new(), Money::new(dec!(500.00)), "USD"))
            .await
            .unwrap();
        store
            .open_account(Account::open("ACC2", UserId::new(), Money::new(dec!(100.00)), "USD"))
            .await
            .unwrap();

        Self {
            store,
            channel,
            repository: InMemoryTransactionRepository::new(),
            clock,
            ctx: RequestContext::new(UserId::new()),
        }
    }

    fn publisher(&self) -> EventPublisher<InMemoryMessageChannel> {
        EventPublisher::new(self.channel.clone(), self.clock.clone(), RetryPolicy::default())
    }

    fn coordinator(&self) -> TestCoordinator {
        DistributedTransactionCoordinator::new(self.repository.clone(), self.publisher(), self.clock.clone())
    }

    fn ledger_participant<S>(&self, store: S) -> Arc<LedgerTransferParticipant<S, InMemoryMessageChannel>>
    where
        S: LedgerStore + Clone + 'static,
    {
        let service = TransferService::new(store, self.publisher(), self.clock.clone());
        Arc::new(LedgerTransferParticipant::new(Arc::new(service)))
    }

    async fn balance(&self, number: &str) -> Money {
        self.store
            .balance_of(&AccountNumber::new(number))
            .await
            .unwrap()
    }

    async fn transfer(&self, coordinator: &TestCoordinator, amount: Money) -> Result<common::TransactionId, CoordinatorError> {
        coordinator
            .initiate_distributed_transfer("ACC1".into(), "ACC2".into(), amount, &self.ctx)
            .await
    }

    async fn published_types(&self) -> Vec<TransactionType> {
        self.channel
            .published()
            .await
            .iter()
            .map(|m| m.decode::<TransactionEvent>().unwrap().transaction_type)
            .collect()
    }

    async fn only_record(&self) -> DistributedTransaction {
        assert_eq!(self.repository.count().await, 1);
        let id = self.channel.published().await[0]
            .decode::<TransactionEvent>()
            .unwrap()
            .distributed_id()
            .unwrap();
        self.coordinator().get_transaction(&id).await.unwrap().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_path_moves_funds_through_every_state() {
    let h = TestHarness::new().await;
    let ledger = h.ledger_participant(h.store.clone());
    let coordinator = h.coordinator().register(ledger.clone());

    let id = h.transfer(&coordinator, Money::new(dec!(100.00))).await.unwrap();

    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert!(id.as_str().starts_with("DTX-"));
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, Prepared, Committing, Committed]
    );
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(400.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(200.00)));
    assert_eq!(ledger.in_flight(), 0);
    assert_eq!(
        h.published_types().await,
        vec![
            TransactionType::DistributedTransferPrepare,
            TransactionType::DistributedTransferCommit
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_prepare_aborts_without_moving_funds() {
    let h = TestHarness::new().await;
    let ledger = h.ledger_participant(h.store.clone());
    let coordinator = h.coordinator().register(ledger.clone());

    let err = h.transfer(&coordinator, Money::new(dec!(900.00))).await.unwrap_err();

    let CoordinatorError::Aborted { id, reason } = err else {
        panic!("expected an aborted transaction");
    };
    assert!(matches!(
        reason,
        AbortReason::Rejected { ref participant, .. } if participant == "ledger-transfer"
    ));
    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, Failed, Aborting, Aborted]
    );
    assert!(record.metadata.unwrap().contains("ledger-transfer"));
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(500.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(100.00)));
    assert_eq!(
        h.published_types().await,
        vec![
            TransactionType::DistributedTransferPrepare,
            TransactionType::DistributedTransferAbort
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_earliest_negative_vote_is_reported() {
    let h = TestHarness::new().await;
    let first = Arc::new(Scripted::new("first", Vote::Abort { reason: "no".into() }).delayed(Duration::from_secs(5)));
    let second = Arc::new(Scripted::new("second", Vote::Abort { reason: "nope".into() }));
    let coordinator = h.coordinator().register(first.clone()).register(second.clone());

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Rejected { ref participant, .. }, .. }
            if participant == "second"
    ));
    assert_eq!(first.decisions(), vec!["abort"]);
    assert_eq!(second.decisions(), vec!["abort"]);
}

#[tokio::test(start_paused = true)]
async fn test_fast_rejection_behind_slow_participant_ends_the_wait() {
    let h = TestHarness::new().await;
    let slow = Arc::new(Scripted::new("slow", Vote::Commit).delayed(Duration::from_secs(60)));
    let fast = Arc::new(Scripted::new("fast", Vote::Abort { reason: "refused".into() }));
    let coordinator = h.coordinator().register(slow.clone()).register(fast.clone());
    let started = tokio::time::Instant::now();

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Rejected { ref participant, .. }, .. }
            if participant == "fast"
    ));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(slow.decisions(), vec!["abort"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_participant_times_out() {
    let h = TestHarness::new().await;
    let slow = Arc::new(Scripted::new("slow", Vote::Commit).delayed(Duration::from_secs(60)));
    let coordinator = h.coordinator().register(slow.clone());
    let started = tokio::time::Instant::now();

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Timeout(timeout), .. }
            if timeout == Duration::from_secs(30)
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(60));

    let record = h.only_record().await;
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, TimedOut, Aborting, Aborted]
    );
    assert_eq!(slow.decisions(), vec!["abort"]);
}

#[tokio::test(start_paused = true)]
async fn test_prepare_timeout_is_configurable() {
    let h = TestHarness::new().await;
    let slow = Arc::new(Scripted::new("slow", Vote::Commit).delayed(Duration::from_secs(10)));
    let coordinator = h
        .coordinator()
        .with_config(saga::CoordinatorConfig {
            prepare_timeout: Duration::from_secs(5),
        })
        .register(slow);

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Timeout(timeout), .. }
            if timeout == Duration::from_secs(5)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_ledger_saga_finishing_after_timeout_is_rolled_back() {
    let h = TestHarness::new().await;
    let slow_store = SlowLedger {
        inner: h.store.clone(),
        delay: Duration::from_secs(40),
    };
    let ledger = h.ledger_participant(slow_store);
    let coordinator = h.coordinator().register(ledger.clone());

    let err = h.transfer(&coordinator, Money::new(dec!(100.00))).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Aborted {
            reason: AbortReason::Timeout(_),
            ..
        }
    ));

    // The debit has not landed yet when the abort is decided.
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(500.00)));
    assert_eq!(ledger.in_flight(), 1);

    // Debit, credit, then both compensations at 40 s each.
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(h.balance("ACC1").await, Money::new(dec!(500.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(100.00)));
    assert_eq!(ledger.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unpublished_commit_leaves_record_committing() {
    let h = TestHarness::new().await;
    let ledger = h.ledger_participant(h.store.clone());
    let breaker = Arc::new(
        Scripted::new("breaker", Vote::Commit)
            .delayed(Duration::from_secs(1))
            .breaking_broker(&h.channel, 3),
    );
    let coordinator = h.coordinator().register(ledger.clone()).register(breaker.clone());

    let err = h.transfer(&coordinator, Money::new(dec!(100.00))).await.unwrap_err();

    let CoordinatorError::Publish { id, .. } = err else {
        panic!("expected a publish failure");
    };
    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), Committing);
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, Prepared, Committing]
    );
    assert!(record.metadata.unwrap().contains("decision not published"));
    assert_eq!(breaker.decisions(), vec!["commit"]);
    assert_eq!(ledger.in_flight(), 0);
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(400.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(200.00)));
}

#[tokio::test(start_paused = true)]
async fn test_unpublished_abort_leaves_record_aborting() {
    let h = TestHarness::new().await;
    let breaker = Arc::new(
        Scripted::new("breaker", Vote::Abort { reason: "refused".into() })
            .delayed(Duration::from_secs(1))
            .breaking_broker(&h.channel, 3),
    );
    let coordinator = h.coordinator().register(breaker.clone());

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    let CoordinatorError::Publish { id, .. } = err else {
        panic!("expected a publish failure");
    };
    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, Failed, Aborting]
    );
    assert_eq!(breaker.decisions(), vec!["abort"]);
}

#[tokio::test(start_paused = true)]
async fn test_unpublished_abort_still_rolls_back_prepared_ledger_saga() {
    let h = TestHarness::new().await;
    // Three failures reject the prepare announcement, three more exhaust the
    // abort announcement.
    h.channel.fail_next_publishes(6).await;
    let ledger = h.ledger_participant(h.store.clone());
    let coordinator = h.coordinator().register(ledger.clone());

    let err = h.transfer(&coordinator, Money::new(dec!(100.00))).await.unwrap_err();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let CoordinatorError::Publish { id, .. } = err else {
        panic!("expected a publish failure");
    };
    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert_eq!(
        record.status_path(),
        vec![Initiated, Preparing, Failed, Aborting]
    );
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(500.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(100.00)));
    assert_eq!(ledger.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_prepare_announcement_aborts() {
    let h = TestHarness::new().await;
    // The prepare announcement exhausts its attempts; the abort goes out.
    h.channel.fail_next_publishes(3).await;
    let coordinator = h.coordinator();

    let err = h.transfer(&coordinator, Money::from_major(1)).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Rejected { ref participant, .. }, .. }
            if participant == "prepare-announcer"
    ));
    assert_eq!(
        h.published_types().await,
        vec![TransactionType::DistributedTransferAbort]
    );
}

#[tokio::test]
async fn test_commit_path_on_frozen_manual_clock() {
    let clock = Arc::new(ManualClock::frozen());
    let h = TestHarness::with_clock(clock.clone()).await;
    let ledger = h.ledger_participant(h.store.clone());
    let coordinator = h.coordinator().register(ledger.clone());

    let id = h.transfer(&coordinator, Money::new(dec!(100.00))).await.unwrap();

    let record = coordinator.get_transaction(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), Committed);
    assert_eq!(h.balance("ACC1").await, Money::new(dec!(400.00)));
    assert_eq!(h.balance("ACC2").await, Money::new(dec!(200.00)));
    assert_eq!(clock.pending_sleeps(), 0);
}

#[tokio::test]
async fn test_timeout_fires_when_frozen_manual_clock_passes_deadline() {
    let clock = Arc::new(ManualClock::frozen());
    let h = TestHarness::with_clock(clock.clone()).await;
    let stuck = Arc::new(Scripted::new("stuck", Vote::Commit).delayed(Duration::from_secs(3600)));
    let coordinator = Arc::new(h.coordinator().register(stuck.clone()));

    let running = {
        let coordinator = coordinator.clone();
        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            coordinator
                .initiate_distributed_transfer("ACC1".into(), "ACC2".into(), Money::from_major(1), &ctx)
                .await
        })
    };
    while clock.pending_sleeps() == 0 {
        tokio::task::yield_now().await;
    }

    clock.advance(Duration::from_secs(29));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!running.is_finished());

    clock.advance(Duration::from_secs(1));
    let err = running.await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Aborted { reason: AbortReason::Timeout(timeout), .. }
            if timeout == Duration::from_secs(30)
    ));
    let record = h.only_record().await;
    assert_eq!(record.status(), Aborted);
    assert_eq!(stuck.decisions(), vec!["abort"]);
}
