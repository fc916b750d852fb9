//! The pipeline facade used by the HTTP layer and the
//! dispatcher.
//!
//! Write paths go store-first and treat the status cache as best effort.
//! Reads go cache-first and fall back to the store, repopulating the cache.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use laterbird_common::error::AppError;
use laterbird_common::types::{Notification, NotificationStatus};

use crate::cache::StatusCache;
use crate::channel::DeliveryChannel;
use crate::queue::DelayQueue;
use crate::scheduler::Scheduler;
use crate::status::StatusRecorder;
use crate::store::{NotificationStore, StatusUpdate};

/// Result of handing one queued notification to the delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The channel accepted the message; the record is `sent`.
    Delivered,
    /// The record was not in `created` (cancelled, or already picked up by
    /// an earlier delivery), so the channel was not contacted.
    Skipped { current: NotificationStatus },
    /// Shutdown began before the channel answered. The record is back in
    /// `created` so a later delivery can send it.
    Interrupted,
}

pub struct NotificationService {
    scheduler: Scheduler,
    recorder: StatusRecorder,
    channel: Arc<dyn DeliveryChannel>,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        cache: Arc<dyn StatusCache>,
        queue: Arc<dyn DelayQueue>,
        channel: Arc<dyn DeliveryChannel>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(queue, routing_key),
            recorder: StatusRecorder::new(store, cache),
            channel,
        }
    }

    /// Type of the delivery channel notifications are sent through.
    pub fn channel_type(&self) -> &'static str {
        self.channel.channel_type()
    }

    /// Assign an id, publish to the delay queue, persist as `created` and
    /// warm the cache. Stops at the first failing step, so a record is never
    /// stored for a notification that was not published.
    pub async fn create(&self, mut notification: Notification) -> Result<String, AppError> {
        notification.id = Uuid::new_v4().to_string();
        notification.status = NotificationStatus::Created;

        self.scheduler.schedule(&notification).await?;
        self.recorder.store().insert(&notification).await?;
        self.recorder
            .cache_status(&notification.id, notification.status)
            .await;

        Ok(notification.id)
    }

    pub async fn get_status(&self, id: &str) -> Result<NotificationStatus, AppError> {
        require_id(id)?;

        if let Some(status) = self.recorder.cached_status(id).await {
            tracing::debug!(notification_id = %id, status = %status, "Status served from cache");
            return Ok(status);
        }

        let status = self.recorder.store().read_status(id).await?;
        self.recorder.cache_status(id, status).await;
        Ok(status)
    }

    /// Cancel the notification in the store, then evict its cached status.
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        require_id(id)?;

        self.recorder.store().delete(id).await?;
        self.recorder.evict(id).await;
        Ok(())
    }

    /// Bulk reads bypass the cache.
    pub async fn list_all(&self) -> Result<Vec<Notification>, AppError> {
        self.recorder.store().read_all().await
    }

    /// Deliver one notification taken off the queue.
    ///
    /// `created → sending → sent | failed`. A delivery failure still records
    /// `failed` and is then returned as an error so the broker dead-letters
    /// the message. Store failures abort and propagate; cache failures never
    /// do.
    ///
    /// If `cancel` fires while the channel call is in flight the call is
    /// dropped and the record released back to `created`.
    pub async fn process_notification(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, AppError> {
        notification.validate_for_dispatch()?;
        let id = notification.id.as_str();

        if cancel.is_cancelled() {
            return Ok(DispatchOutcome::Interrupted);
        }

        if let StatusUpdate::Skipped { current } = self
            .recorder
            .transition(id, NotificationStatus::Sending)
            .await?
        {
            tracing::info!(
                notification_id = %id,
                status = %current,
                "Notification no longer pending, skipping delivery"
            );
            return Ok(DispatchOutcome::Skipped { current });
        }

        tracing::info!(
            notification_id = %id,
            chat_id = notification.chat_id,
            channel = self.channel.channel_type(),
            "Sending notification"
        );

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.channel.send(notification.chat_id, &notification.message) => Some(result),
        };
        let Some(result) = sent else {
            self.release(id).await;
            return Ok(DispatchOutcome::Interrupted);
        };

        if let Err(e) = result {
            tracing::error!(notification_id = %id, error = %e, "Notification delivery failed");

            self.record_terminal(id, NotificationStatus::Failed).await?;
            return Err(AppError::Delivery(format!(
                "failed to deliver notification {}: {}",
                id, e
            )));
        }

        self.record_terminal(id, NotificationStatus::Sent).await?;
        tracing::info!(notification_id = %id, "Notification sent successfully");
        Ok(DispatchOutcome::Delivered)
    }

    /// Undo the `sending` claim of an interrupted send. Best effort: a record
    /// left in `sending` is skipped on redelivery.
    async fn release(&self, id: &str) {
        match self.recorder.transition(id, NotificationStatus::Created).await {
            Ok(StatusUpdate::Applied) => {
                tracing::warn!(notification_id = %id, "Send interrupted by shutdown, released");
            }
            Ok(StatusUpdate::Skipped { current }) => {
                tracing::warn!(
                    notification_id = %id,
                    current = %current,
                    "Send interrupted by shutdown, status left as is"
                );
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %id,
                    error = %e,
                    "Failed to release interrupted notification"
                );
            }
        }
    }

    async fn record_terminal(&self, id: &str, status: NotificationStatus) -> Result<(), AppError> {
        let update = self
            .recorder
            .transition(id, status)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    notification_id = %id,
                    status = %status,
                    error = %e,
                    "Failed to record terminal status"
                );
            })?;

        if let StatusUpdate::Skipped { current } = update {
            // Cancelled while the send was in flight.
            tracing::warn!(
                notification_id = %id,
                requested = %status,
                current = %current,
                "Terminal status not recorded"
            );
        }
        Ok(())
    }
}

fn require_id(id: &str) -> Result<(), AppError> {
    if id.is_empty() {
        return Err(AppError::Validation("invalid id".to_string()));
    }
    Ok(())
}
