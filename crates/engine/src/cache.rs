//! Redis-backed `id → status` mapping with a bounded TTL.
//!
//! The cache is an accelerator only. Callers treat every error from it
//! (including a plain miss) as "ask the record store".

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use laterbird_common::error::AppError;

/// Lifetime of a cached status entry.
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const STATUS_CACHE_PREFIX: &str = "notification:status:";

/// Cache key for a notification's status.
pub fn cache_key(id: &str) -> String {
    format!("{}{}", STATUS_CACHE_PREFIX, id)
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), AppError>;

    /// Returns `AppError::NotFound` on a miss.
    async fn get(&self, key: &str) -> Result<String, AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

/// Redis implementation sharing the process-wide `ConnectionManager`.
#[derive(Clone)]
pub struct RedisStatusCache {
    redis: ConnectionManager,
}

impl RedisStatusCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        // SET key value EX ttl
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, AppError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        value.ok_or_else(|| AppError::NotFound(format!("cache miss: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
