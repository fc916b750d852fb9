//! Dispatcher workers: drain the main queue and hand each notification to
//! the pipeline facade for delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use laterbird_common::types::Notification;
use laterbird_engine::queue::{Delivery, DeliverySource};
use laterbird_engine::service::{DispatchOutcome, NotificationService};

/// Times a delivery whose record is not in the store yet goes back to the
/// delay queue before it is dead-lettered.
const MAX_REQUEUES: u32 = 5;

const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// Rejected; the broker moves it to the dead-letter queue.
    DeadLettered,
    /// Published back to the delay queue to be retried later.
    Requeued,
    /// Left unsettled on shutdown; recovered when the worker restarts.
    Released,
}

#[derive(Clone)]
pub struct Dispatcher {
    service: Arc<NotificationService>,
    poll_interval: Duration,
    /// Requeue count per notification id, shared by every worker.
    requeues: Arc<Mutex<HashMap<String, u32>>>,
}

impl Dispatcher {
    pub fn new(service: Arc<NotificationService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
            requeues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume from `source` until `cancel` fires. A send still in flight
    /// at that point is abandoned and its delivery left unacked.
    pub async fn run(&self, source: &dyn DeliverySource, cancel: CancellationToken, worker: &str) {
        tracing::info!(
            worker,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Dispatcher worker started"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = source.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.handle(source, delivery, &cancel).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker, error = %e, "Failed to receive from queue");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(worker, "Dispatcher worker stopped");
    }

    /// Decode, deliver and settle one delivery.
    ///
    /// Successful and skipped notifications are acked. A notification whose
    /// record is not stored yet is requeued a bounded number of times.
    /// Malformed payloads and every other processing error are rejected to
    /// the dead-letter queue.
    pub async fn handle(
        &self,
        source: &dyn DeliverySource,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Settlement {
        let notification: Notification = match serde_json::from_str(&delivery.body) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed queue payload, dead-lettering");
                return self.settle(source, &delivery, Settlement::DeadLettered, None).await;
            }
        };

        let settlement = match self.service.process_notification(&notification, cancel).await {
            Ok(DispatchOutcome::Delivered) | Ok(DispatchOutcome::Skipped { .. }) => Settlement::Acked,
            Ok(DispatchOutcome::Interrupted) => Settlement::Released,
            Err(e) if e.is_not_found() => self.record_missing(&notification.id),
            Err(e) => {
                tracing::error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to process notification, dead-lettering"
                );
                Settlement::DeadLettered
            }
        };

        if matches!(settlement, Settlement::Acked | Settlement::DeadLettered) {
            self.requeue_counts().remove(&notification.id);
        }

        self.settle(source, &delivery, settlement, Some(&notification.id))
            .await
    }

    /// The create path publishes before it stores, so a fast delivery can
    /// arrive ahead of its record.
    fn record_missing(&self, id: &str) -> Settlement {
        let mut counts = self.requeue_counts();
        let count = counts.entry(id.to_string()).or_insert(0);
        *count += 1;

        if *count > MAX_REQUEUES {
            tracing::error!(
                notification_id = %id,
                requeues = MAX_REQUEUES,
                "Notification record never appeared, dead-lettering"
            );
            return Settlement::DeadLettered;
        }

        tracing::warn!(
            notification_id = %id,
            attempt = *count,
            "Notification record not found yet, requeueing"
        );
        Settlement::Requeued
    }

    fn requeue_counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.requeues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn settle(
        &self,
        source: &dyn DeliverySource,
        delivery: &Delivery,
        settlement: Settlement,
        notification_id: Option<&str>,
    ) -> Settlement {
        let result = match settlement {
            Settlement::Acked => source.ack(delivery).await,
            Settlement::DeadLettered => source.reject(delivery).await,
            Settlement::Requeued => {
                source
                    .requeue(delivery, REQUEUE_DELAY.as_millis() as u64)
                    .await
            }
            Settlement::Released => return settlement,
        };

        // An unsettled delivery stays in the worker's in-flight list and is
        // requeued on restart; the guarded status update stops a resend.
        if let Err(e) = result {
            tracing::error!(
                notification_id = notification_id.unwrap_or_default(),
                settlement = ?settlement,
                error = %e,
                "Failed to settle delivery"
            );
        }
        settlement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use laterbird_common::types::NotificationStatus;
    use laterbird_engine::memory::{MemoryCache, MemoryChannel, MemoryQueue, MemoryStore};
    use laterbird_engine::store::NotificationStore;

    struct Harness {
        dispatcher: Dispatcher,
        service: Arc<NotificationService>,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        channel: Arc<MemoryChannel>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let channel = Arc::new(MemoryChannel::new());
        let service = Arc::new(NotificationService::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            queue.clone(),
            channel.clone(),
            "notification",
        ));

        Harness {
            dispatcher: Dispatcher::new(service.clone(), Duration::from_millis(10)),
            service,
            store,
            queue,
            channel,
        }
    }

    async fn next(h: &Harness) -> Delivery {
        h.queue.receive().await.unwrap().expect("queue is empty")
    }

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    /// Queue a notification without storing its record, as when a delivery
    /// overtakes the insert in `create`.
    fn push_unstored(h: &Harness, id: &str) -> Notification {
        let mut nf = Notification::new("hello", "", 42);
        nf.id = id.to_string();
        h.queue.push(serde_json::to_string(&nf).unwrap());
        nf
    }

    #[tokio::test]
    async fn test_delivered_notification_is_acked() {
        let h = harness();
        let id = h
            .service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(h.channel.sent(), vec![(42, "hello".to_string())]);
        assert_eq!(h.store.status_of(&id), Some(NotificationStatus::Sent));
        assert_eq!(h.queue.acked().len(), 1);
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let h = harness();
        h.queue.push("{not json");

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(h.queue.dead_letters(), vec!["{not json".to_string()]);
        assert_eq!(h.channel.attempts(), 0);
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_notification_is_dead_lettered() {
        let h = harness();
        h.queue.push(r#"{"message": "hello", "chat_id": 42}"#);

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(h.channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_dead_lettered_as_failed() {
        let h = harness();
        h.channel.fail_with("Bad Request: chat not found");
        let id = h
            .service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(h.store.status_of(&id), Some(NotificationStatus::Failed));
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert!(h.queue.acked().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_notification_is_acked_without_sending() {
        let h = harness();
        let id = h
            .service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();
        h.service.delete(&id).await.unwrap();

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(h.channel.attempts(), 0);
        assert_eq!(h.store.status_of(&id), Some(NotificationStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_redelivery_is_not_sent_twice() {
        let h = harness();
        h.service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let delivery = next(&h).await;
        let duplicate = delivery.clone();
        h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), duplicate, &live()).await;

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(h.channel.attempts(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_dead_lettered_before_sending() {
        let h = harness();
        h.service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();
        h.store.fail_updates(true);

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(h.channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_cancel() {
        let h = harness();
        h.queue.push("garbage");
        let id = h
            .service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let worker = {
            let dispatcher = h.dispatcher.clone();
            let queue = h.queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(queue.as_ref(), cancel, "test-0").await })
        };

        for _ in 0..200 {
            if h.queue.pending() == 0 && h.queue.acked().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(h.queue.dead_letters(), vec!["garbage".to_string()]);
        assert_eq!(h.store.status_of(&id), Some(NotificationStatus::Sent));
    }

    #[tokio::test]
    async fn test_delivery_ahead_of_its_record_is_requeued() {
        let h = harness();
        let nf = push_unstored(&h, "n-early");

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::Requeued);
        assert_eq!(h.queue.requeued().len(), 1);
        assert_eq!(h.queue.requeued()[0].1, REQUEUE_DELAY.as_millis() as u64);
        assert!(h.queue.dead_letters().is_empty());
        assert!(h.queue.unacked().is_empty());
        assert_eq!(h.channel.attempts(), 0);

        // The insert lands, then the requeued delivery comes back
        h.store.insert(&nf).await.unwrap();
        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(h.channel.sent(), vec![(42, "hello".to_string())]);
        assert_eq!(h.store.status_of("n-early"), Some(NotificationStatus::Sent));
    }

    #[tokio::test]
    async fn test_record_that_never_appears_is_dead_lettered() {
        let h = harness();
        push_unstored(&h, "n-ghost");

        for _ in 0..MAX_REQUEUES {
            let delivery = next(&h).await;
            let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;
            assert_eq!(settlement, Settlement::Requeued);
        }

        let delivery = next(&h).await;
        let settlement = h.dispatcher.handle(h.queue.as_ref(), delivery, &live()).await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(h.channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_send_leaves_delivery_unacked() {
        let h = harness();
        h.channel.hang();
        let id = h
            .service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let delivery = next(&h).await;
        let body = delivery.body.clone();
        let cancel = CancellationToken::new();
        let (settlement, _) = tokio::time::timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(
                    h.dispatcher.handle(h.queue.as_ref(), delivery, &cancel),
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        cancel.cancel();
                    }
                )
            },
        )
        .await
        .expect("stalled send ignored shutdown");

        assert_eq!(settlement, Settlement::Released);
        assert_eq!(h.store.status_of(&id), Some(NotificationStatus::Created));
        assert_eq!(h.queue.unacked(), vec![body]);
        assert!(h.queue.acked().is_empty());
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_promptly_with_send_in_flight() {
        let h = harness();
        h.channel.hang();
        h.service
            .create(Notification::new("hello", "", 42))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let worker = {
            let dispatcher = h.dispatcher.clone();
            let queue = h.queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(queue.as_ref(), cancel, "test-0").await })
        };

        for _ in 0..200 {
            if h.channel.attempts() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.channel.attempts(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(h.queue.unacked().len(), 1);
        assert!(h.queue.acked().is_empty());
    }
}
