//! Dual-write discipline between the record store and the status cache.
//!
//! The store is written first and its errors propagate. The cache is written
//! afterwards on a best-effort basis: failures are logged and swallowed, and
//! staleness is bounded by `STATUS_CACHE_TTL`.

use std::sync::Arc;

use laterbird_common::error::AppError;
use laterbird_common::types::NotificationStatus;

use crate::cache::{STATUS_CACHE_TTL, StatusCache, cache_key};
use crate::store::{NotificationStore, StatusUpdate};

#[derive(Clone)]
pub struct StatusRecorder {
    store: Arc<dyn NotificationStore>,
    cache: Arc<dyn StatusCache>,
}

impl StatusRecorder {
    pub fn new(store: Arc<dyn NotificationStore>, cache: Arc<dyn StatusCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Move a notification to `status` in the store, then mirror the
    /// resulting status into the cache.
    pub async fn transition(
        &self,
        id: &str,
        status: NotificationStatus,
    ) -> Result<StatusUpdate, AppError> {
        let update = self.store.update_status(id, status).await?;

        match update {
            StatusUpdate::Applied => self.cache_status(id, status).await,
            StatusUpdate::Skipped { current } => self.cache_status(id, current).await,
        }

        Ok(update)
    }

    /// Best-effort cache write.
    pub async fn cache_status(&self, id: &str, status: NotificationStatus) {
        let key = cache_key(id);
        match self
            .cache
            .set_with_expiry(&key, status.as_str(), STATUS_CACHE_TTL)
            .await
        {
            Ok(()) => {
                tracing::debug!(notification_id = %id, status = %status, "Cached notification status");
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %id,
                    status = %status,
                    error = %e,
                    "Failed to cache notification status"
                );
            }
        }
    }

    /// Cached status, or `None` on a miss, a cache error, or a value that
    /// does not parse as a status.
    pub async fn cached_status(&self, id: &str) -> Option<NotificationStatus> {
        let raw = match self.cache.get(&cache_key(id)).await {
            Ok(raw) => raw,
            Err(AppError::NotFound(_)) => {
                tracing::debug!(notification_id = %id, "Status cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Status cache read failed");
                return None;
            }
        };

        match raw.parse() {
            Ok(status) => Some(status),
            Err(_) => {
                tracing::warn!(notification_id = %id, value = %raw, "Ignoring malformed cached status");
                None
            }
        }
    }

    /// Best-effort cache eviction.
    pub async fn evict(&self, id: &str) {
        if let Err(e) = self.cache.delete(&cache_key(id)).await {
            tracing::warn!(
                notification_id = %id,
                error = %e,
                "Failed to delete status from cache"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCache, MemoryStore};
    use laterbird_common::types::Notification;

    async fn recorder_with(id: &str) -> (StatusRecorder, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let mut nf = Notification::new("hi", "", 42);
        nf.id = id.to_string();
        store.insert(&nf).await.unwrap();
        let recorder = StatusRecorder::new(store.clone(), cache.clone());
        (recorder, store, cache)
    }

    #[tokio::test]
    async fn test_transition_writes_store_then_cache() {
        let (recorder, store, cache) = recorder_with("n-1").await;

        let update = recorder
            .transition("n-1", NotificationStatus::Sending)
            .await
            .unwrap();

        assert_eq!(update, StatusUpdate::Applied);
        assert_eq!(store.status_of("n-1"), Some(NotificationStatus::Sending));
        assert_eq!(cache.value_of(&cache_key("n-1")).as_deref(), Some("sending"));
    }

    #[tokio::test]
    async fn test_cache_failure_is_swallowed() {
        let (recorder, store, cache) = recorder_with("n-1").await;
        cache.fail_writes(true);

        let update = recorder
            .transition("n-1", NotificationStatus::Sending)
            .await
            .unwrap();

        assert_eq!(update, StatusUpdate::Applied);
        assert_eq!(store.status_of("n-1"), Some(NotificationStatus::Sending));
    }

    #[tokio::test]
    async fn test_store_failure_propagates_and_skips_cache() {
        let (recorder, store, cache) = recorder_with("n-1").await;
        store.fail_updates(true);

        let result = recorder.transition("n-1", NotificationStatus::Sending).await;

        assert!(matches!(result, Err(AppError::Database(_))));
        assert!(cache.value_of(&cache_key("n-1")).is_none());
    }

    #[tokio::test]
    async fn test_malformed_cached_value_reads_as_miss() {
        let (recorder, _store, cache) = recorder_with("n-1").await;
        cache
            .set_with_expiry(&cache_key("n-1"), "garbage", STATUS_CACHE_TTL)
            .await
            .unwrap();

        assert!(recorder.cached_status("n-1").await.is_none());
    }
}
