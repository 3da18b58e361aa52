//! End-to-end tests of publisher, broker, consumer and dead-letter processor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{AccountNumber, ManualClock, SystemClock, UserId};
use domain::Money;
use messaging::topology::{
    ACCOUNT_BALANCE_QUEUE, NOTIFICATION_QUEUE, TRANSACTION_DLQ, TRANSACTION_QUEUE,
};
use messaging::{
    AttemptError, BalanceChangeEvent, BalanceOperation, DeathReason, DeadLetterParkingLot,
    DeadLetterProcessor, DeadLetteredEvent, Delivery, EventClass, EventConsumer, EventHandler,
    EventPublisher, HandlerError, InMemoryMessageChannel, MessageChannel, NotificationEvent,
    NotificationType, PublishError, QueueSettings, RetryPolicy, Topology, TransactionEvent,
    TransactionStatus,
};
use rust_decimal_macros::dec;

async fn declared_channel(clock: Arc<dyn common::Clock>) -> InMemoryMessageChannel {
    let channel = InMemoryMessageChannel::with_clock(clock);
    channel
        .declare(&Topology::standard(QueueSettings::default()))
        .await
        .unwrap();
    channel
}

fn transfer_event(reference: &str) -> TransactionEvent {
    TransactionEvent::transfer(
        reference,
        AccountNumber::new("ACC1"),
        AccountNumber::new("ACC2"),
        Money::new(dec!(100.00)),
        TransactionStatus::Completed,
        Utc::now(),
    )
}

#[tokio::test]
async fn test_two_nacks_then_ack_waits_one_then_two_seconds() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    channel.nack_next_publishes(2).await;
    let publisher = EventPublisher::new(channel.clone(), clock.clone(), RetryPolicy::default());

    let receipt = publisher.publish_event(&transfer_event("REQ-D")).await.unwrap();

    assert_eq!(receipt.attempts, 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );

    let published = channel.published().await;
    assert_eq!(published.len(), 3);
    let ids: HashSet<_> = published.iter().map(|m| m.correlation_id).collect();
    assert_eq!(ids.len(), 3, "every attempt uses a fresh correlation id");
    assert_eq!(published[2].correlation_id, receipt.correlation_id);

    // Only the acked attempt was enqueued.
    assert_eq!(channel.queue_depth(TRANSACTION_QUEUE).await, 1);
}

#[tokio::test]
async fn test_first_attempt_success_never_sleeps() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    let publisher = EventPublisher::new(channel.clone(), clock.clone(), RetryPolicy::default());

    let event = BalanceChangeEvent {
        account_number: AccountNumber::new("ACC1"),
        old_balance: Money::from_major(500),
        new_balance: Money::from_major(400),
        operation: BalanceOperation::Debit,
        timestamp: Utc::now(),
    };
    let receipt = publisher.publish_event(&event).await.unwrap();

    assert_eq!(receipt.attempts, 1);
    assert!(clock.sleeps().is_empty());
    assert_eq!(channel.published().await.len(), 1);
    assert_eq!(channel.queue_depth(ACCOUNT_BALANCE_QUEUE).await, 1);

    let delivery = channel.try_get(ACCOUNT_BALANCE_QUEUE).await.unwrap().unwrap();
    let decoded: BalanceChangeEvent = delivery.message.decode().unwrap();
    assert_eq!(decoded, event);
}

#[tokio::test]
async fn test_publish_gives_up_after_max_attempts() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    channel.fail_next_publishes(10).await;
    let publisher = EventPublisher::new(channel.clone(), clock.clone(), RetryPolicy::default());

    let err = publisher
        .publish_event(&transfer_event("REQ-X"))
        .await
        .unwrap_err();

    match err {
        PublishError::RetriesExhausted {
            class,
            correlation_key,
            attempts,
            last_error,
        } => {
            assert_eq!(class, EventClass::Transaction);
            assert_eq!(correlation_key, "REQ-X");
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, AttemptError::Channel(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    // No sleep after the final attempt.
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(channel.queue_depth(TRANSACTION_QUEUE).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_confirm_times_out_and_retries() {
    let channel = declared_channel(Arc::new(SystemClock)).await;
    channel.withhold_next_confirms(1).await;
    let policy = RetryPolicy {
        confirm_timeout: Duration::from_secs(5),
        ..RetryPolicy::default()
    };
    let publisher = EventPublisher::new(channel.clone(), Arc::new(SystemClock), policy);

    let started = tokio::time::Instant::now();
    let receipt = publisher.publish_event(&transfer_event("REQ-T")).await.unwrap();

    assert_eq!(receipt.attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(channel.published().await.len(), 2);
}

#[tokio::test]
async fn test_unroutable_publish_is_a_failed_attempt() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    let publisher = EventPublisher::new(channel.clone(), clock.clone(), RetryPolicy::default());

    let err = publisher
        .publish(&transfer_event("REQ-R"), "transaction.exchange", "unbound.key")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::RetriesExhausted {
            last_error: AttemptError::Returned { reply_code: 312, .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_notification_reaches_its_queue() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    let publisher = EventPublisher::new(channel.clone(), clock, RetryPolicy::default());

    publisher
        .publish_event(&NotificationEvent {
            user_id: UserId::new(),
            title: "Transfer completed".to_string(),
            message: "100.00 sent to ACC2".to_string(),
            notification_type: NotificationType::Email,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    assert_eq!(channel.queue_depth(NOTIFICATION_QUEUE).await, 1);
}

struct AlwaysFails;

#[async_trait]
impl EventHandler<TransactionEvent> for AlwaysFails {
    async fn handle(&self, _event: TransactionEvent, _delivery: &Delivery) -> Result<(), HandlerError> {
        Err(HandlerError::new("ledger projection unavailable"))
    }
}

#[tokio::test]
async fn test_delivery_limit_routes_to_dead_letter_processor() {
    let channel = declared_channel(Arc::new(SystemClock)).await;
    let publisher = EventPublisher::new(channel.clone(), Arc::new(SystemClock), RetryPolicy::default());
    publisher
        .publish_event(&transfer_event("REQ-DL"))
        .await
        .unwrap();

    let consumer = Arc::new(EventConsumer::new(channel.clone(), TRANSACTION_QUEUE, AlwaysFails));
    let parking = DeadLetterParkingLot::new();
    let processor = Arc::new(DeadLetterProcessor::new(
        channel.clone(),
        parking.clone(),
        Arc::new(SystemClock),
    ));

    let consumer_task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });
    let processor_task = tokio::spawn({
        let processor = processor.clone();
        async move { processor.run().await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while parking.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dead letter was never processed");

    channel.close().await;
    let stats = consumer_task.await.unwrap().unwrap();
    let processed = processor_task.await.unwrap().unwrap();

    assert_eq!(stats.requeued, 5);
    assert_eq!(stats.acked, 0);
    assert_eq!(processed, 1);

    let letters = parking.letters();
    let letter = &letters[0];
    assert_eq!(letter.queue, TRANSACTION_DLQ);
    let death = letter.death.as_ref().unwrap();
    assert_eq!(death.reason, DeathReason::DeliveryLimit);
    assert_eq!(death.queue, TRANSACTION_QUEUE);
    assert_eq!(death.routing_key, "transaction.created");
    match &letter.event {
        DeadLetteredEvent::Transaction(event) => assert_eq!(event.transaction_id, "REQ-DL"),
        other => panic!("unexpected payload: {other:?}"),
    }

    // Terminal: nothing was re-published and nothing is left behind.
    assert_eq!(channel.published().await.len(), 1);
    assert_eq!(channel.queue_depth(TRANSACTION_QUEUE).await, 0);
    assert_eq!(channel.queue_depth(TRANSACTION_DLQ).await, 0);
}

#[tokio::test]
async fn test_expired_message_is_dead_lettered_after_ttl() {
    let clock = Arc::new(ManualClock::new());
    let channel = declared_channel(clock.clone()).await;
    let publisher = EventPublisher::new(channel.clone(), clock.clone(), RetryPolicy::default());
    publisher
        .publish_event(&transfer_event("REQ-TTL"))
        .await
        .unwrap();

    clock.advance(Duration::from_millis(300_000));
    assert_eq!(channel.expire_messages().await, 1);

    let parking = DeadLetterParkingLot::new();
    let processor = DeadLetterProcessor::new(channel.clone(), parking.clone(), clock.clone());
    let delivery = channel.try_get(TRANSACTION_DLQ).await.unwrap().unwrap();
    let letter = processor
        .process(EventClass::Transaction, delivery)
        .await
        .unwrap();

    assert_eq!(letter.death.unwrap().reason, DeathReason::Expired);
    assert_eq!(letter.event.correlation_key().as_deref(), Some("REQ-TTL"));
    assert_eq!(parking.len(), 1);
}
