//! User notification dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use messaging::{Delivery, EventHandler, HandlerError, NotificationEvent, NotificationType};

/// Delivery backend for user notifications.
///
/// A failed send is retried through the notification queue until its
/// delivery limit dead-letters it.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_email(&self, event: &NotificationEvent) -> Result<(), HandlerError>;

    async fn send_sms(&self, event: &NotificationEvent) -> Result<(), HandlerError>;

    async fn send_push(&self, event: &NotificationEvent) -> Result<(), HandlerError>;
}

/// Sender that only logs what it would deliver.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSender;

#[async_trait]
impl NotificationSender for LoggingSender {
    async fn send_email(&self, event: &NotificationEvent) -> Result<(), HandlerError> {
        tracing::info!(user_id = %event.user_id, title = %event.title, "sending email");
        Ok(())
    }

    async fn send_sms(&self, event: &NotificationEvent) -> Result<(), HandlerError> {
        tracing::info!(user_id = %event.user_id, title = %event.title, "sending sms");
        Ok(())
    }

    async fn send_push(&self, event: &NotificationEvent) -> Result<(), HandlerError> {
        tracing::info!(user_id = %event.user_id, title = %event.title, "sending push notification");
        Ok(())
    }
}

/// Routes each notification to the channel it asks for.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: Arc<dyn NotificationSender>,
    sent: Arc<AtomicU64>,
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            sender,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Notifications handed to the sender successfully.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler<NotificationEvent> for NotificationDispatcher {
    async fn handle(&self, event: NotificationEvent, delivery: &Delivery) -> Result<(), HandlerError> {
        let (channel, result) = match event.notification_type {
            NotificationType::Email => ("email", self.sender.send_email(&event).await),
            NotificationType::Sms => ("sms", self.sender.send_sms(&event).await),
            NotificationType::Push => ("push", self.sender.send_push(&event).await),
        };

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("notifications_sent_total", "channel" => channel).increment(1);
                Ok(())
            }
            Err(error) => {
                metrics::counter!("notification_send_failures_total", "channel" => channel).increment(1);
                tracing::warn!(
                    user_id = %event.user_id,
                    channel,
                    delivery_count = delivery.delivery_count,
                    %error,
                    "notification not delivered"
                );
                Err(error)
            }
        }
    }
}
