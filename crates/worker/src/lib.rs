//! Worker process for the ledger transfer core.
//!
//! Wires the ledger, broker, transfer service and distributed transaction
//! coordinator together, consumes every standard queue, runs the
//! dead-letter processor and the message expiry sweep, and serves `/health`
//! and `/metrics`.

pub mod audit;
pub mod config;
pub mod error;
pub mod listeners;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use common::Clock;
use ledger::{InMemoryLedgerStore, InMemoryTransactionRepository};
use messaging::topology::{ACCOUNT_BALANCE_QUEUE, AUDIT_QUEUE, NOTIFICATION_QUEUE, TRANSACTION_QUEUE};
use messaging::{
    BalanceChangeEvent, DeadLetterParkingLot, DeadLetterProcessor, Event, EventConsumer, EventHandler,
    EventPublisher, InMemoryMessageChannel, MessageChannel, NotificationEvent, Topology, TransactionEvent,
};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{DistributedTransactionCoordinator, LedgerTransferParticipant, TransferService};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::error::Result;
use crate::listeners::{
    BalanceMonitor, LoggingSender, NotificationDispatcher, NotificationSender, TransactionProcessor,
};

pub type Transfers = TransferService<InMemoryLedgerStore, InMemoryMessageChannel>;
pub type Coordinator = DistributedTransactionCoordinator<InMemoryTransactionRepository, InMemoryMessageChannel>;

/// Creates the ops router.
pub fn create_app(channel: InMemoryMessageChannel, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(channel)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// The wired transfer core and its background consumers.
pub struct Worker {
    config: Config,
    clock: Arc<dyn Clock>,
    channel: InMemoryMessageChannel,
    store: InMemoryLedgerStore,
    transfers: Arc<Transfers>,
    coordinator: Arc<Coordinator>,
    audit: AuditLog,
    transactions: TransactionProcessor,
    balances: BalanceMonitor,
    notifications: NotificationDispatcher,
    dead_letters: DeadLetterParkingLot,
}

impl Worker {
    /// Declares the standard topology and wires every component.
    /// Notifications are only logged.
    pub async fn start(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::start_with_sender(config, clock, Arc::new(LoggingSender)).await
    }

    /// Like [`start`](Self::start), delivering notifications through `sender`.
    #[tracing::instrument(skip_all)]
    pub async fn start_with_sender(
        config: Config,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn NotificationSender>,
    ) -> Result<Self> {
        let channel = InMemoryMessageChannel::with_clock(clock.clone());
        channel.declare(&Topology::standard(config.queues)).await?;

        let store = InMemoryLedgerStore::new();
        let publisher = EventPublisher::new(channel.clone(), clock.clone(), config.retry);
        let transfers = Arc::new(
            TransferService::new(store.clone(), publisher.clone(), clock.clone())
                .with_policies(config.policies),
        );
        let coordinator = Arc::new(
            DistributedTransactionCoordinator::new(
                InMemoryTransactionRepository::new(),
                publisher,
                clock.clone(),
            )
            .with_config(config.coordinator)
            .register(Arc::new(LedgerTransferParticipant::new(transfers.clone()))),
        );

        tracing::info!(
            max_attempts = config.retry.max_attempts,
            prepare_timeout = ?config.coordinator.prepare_timeout,
            delivery_limit = config.queues.delivery_limit,
            "transfer core wired"
        );

        Ok(Self {
            config,
            clock,
            channel,
            store,
            transfers,
            coordinator,
            audit: AuditLog::new(),
            transactions: TransactionProcessor::new(),
            balances: BalanceMonitor::new(),
            notifications: NotificationDispatcher::new(sender),
            dead_letters: DeadLetterParkingLot::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channel(&self) -> &InMemoryMessageChannel {
        &self.channel
    }

    pub fn store(&self) -> &InMemoryLedgerStore {
        &self.store
    }

    pub fn transfers(&self) -> Arc<Transfers> {
        self.transfers.clone()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn transaction_processor(&self) -> &TransactionProcessor {
        &self.transactions
    }

    pub fn balance_monitor(&self) -> &BalanceMonitor {
        &self.balances
    }

    pub fn notification_dispatcher(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub fn dead_letters(&self) -> &DeadLetterParkingLot {
        &self.dead_letters
    }

    /// Spawns a consumer for each standard queue, the dead-letter processor
    /// and the expiry sweep. Each task ends once the channel is closed.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let dead_letters = DeadLetterProcessor::new(
            self.channel.clone(),
            self.dead_letters.clone(),
            self.clock.clone(),
        );

        vec![
            spawn_consumer::<TransactionEvent, _>(&self.channel, TRANSACTION_QUEUE, self.transactions.clone()),
            spawn_consumer::<BalanceChangeEvent, _>(&self.channel, ACCOUNT_BALANCE_QUEUE, self.balances.clone()),
            spawn_consumer::<NotificationEvent, _>(&self.channel, NOTIFICATION_QUEUE, self.notifications.clone()),
            spawn_consumer::<TransactionEvent, _>(&self.channel, AUDIT_QUEUE, self.audit.clone()),
            tokio::spawn(async move {
                match dead_letters.run().await {
                    Ok(processed) => tracing::info!(processed, "dead-letter processor stopped"),
                    Err(error) => tracing::error!(%error, "dead-letter processor failed"),
                }
            }),
            tokio::spawn(sweep_expired(self.channel.clone(), self.config.expiry_sweep_interval)),
        ]
    }

    /// Closes the broker, which ends every background task.
    pub async fn shutdown(&self) {
        self.channel.close().await;
        tracing::info!("message channel closed");
    }
}

fn spawn_consumer<E, H>(channel: &InMemoryMessageChannel, queue: &'static str, handler: H) -> JoinHandle<()>
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    let consumer = EventConsumer::<_, E, _>::new(channel.clone(), queue, handler);
    tokio::spawn(async move {
        match consumer.run().await {
            Ok(stats) => tracing::info!(queue, ?stats, "consumer stopped"),
            Err(error) => tracing::error!(queue, %error, "consumer failed"),
        }
    })
}

async fn sweep_expired(channel: InMemoryMessageChannel, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if channel.is_closed().await {
            break;
        }
        let expired = channel.expire_messages().await;
        if expired > 0 {
            tracing::debug!(expired, "expired messages dead-lettered");
        }
    }
}
