//! In-memory backends for every pipeline seam.
//!
//! Used by the unit tests here and by the dispatcher and HTTP tests in the
//! other crates. Each backend records what it was asked to do and can be told
//! to fail, so tests can assert on call counts and on error handling without
//! PostgreSQL, Redis or Telegram.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use laterbird_common::error::AppError;
use laterbird_common::types::{Notification, NotificationStatus};

use crate::cache::StatusCache;
use crate::channel::DeliveryChannel;
use crate::queue::{DelayQueue, Delivery, DeliverySource};
use crate::store::{NotificationStore, StatusUpdate};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn redis_down() -> AppError {
    AppError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

// ============================================================
// Record store
// ============================================================

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Notification>>,
    status_writes: Mutex<Vec<(String, NotificationStatus)>>,
    calls: AtomicUsize,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Number of trait calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn status_of(&self, id: &str) -> Option<NotificationStatus> {
        lock(&self.rows)
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.status)
    }

    /// Applied `update_status` writes for `id`, in order.
    pub fn status_writes(&self, id: &str) -> Vec<NotificationStatus> {
        lock(&self.status_writes)
            .iter()
            .filter(|(write_id, _)| write_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        self.record_call();
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut rows = lock(&self.rows);
        if rows.iter().any(|n| n.id == notification.id) {
            return Err(AppError::Internal(format!(
                "duplicate notification id: {}",
                notification.id
            )));
        }
        rows.push(notification.clone());
        Ok(())
    }

    async fn read_status(&self, id: &str) -> Result<NotificationStatus, AppError> {
        self.record_call();
        self.status_of(id)
            .ok_or_else(|| AppError::NotFound(format!("notification not found: {}", id)))
    }

    async fn update_status(
        &self,
        id: &str,
        status: NotificationStatus,
    ) -> Result<StatusUpdate, AppError> {
        self.record_call();
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| AppError::NotFound(format!("notification not found: {}", id)))?;

        if !status.can_transition_from(row.status) {
            return Ok(StatusUpdate::Skipped {
                current: row.status,
            });
        }

        row.status = status;
        lock(&self.status_writes).push((id.to_string(), status));
        Ok(StatusUpdate::Applied)
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.record_call();
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| AppError::NotFound(format!("notification not found: {}", id)))?;
        row.status = NotificationStatus::Cancelled;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Notification>, AppError> {
        self.record_call();
        Ok(lock(&self.rows).iter().rev().cloned().collect())
    }
}

// ============================================================
// Status cache
// ============================================================

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    writes: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current unexpired value for `key`.
    pub fn value_of(&self, key: &str) -> Option<String> {
        lock(&self.entries)
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Successful writes to `key`, in order.
    pub fn writes_for(&self, key: &str) -> Vec<String> {
        lock(&self.writes)
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl StatusCache for MemoryCache {
    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(redis_down());
        }

        lock(&self.entries).insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        lock(&self.writes).push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(redis_down());
        }

        self.value_of(key)
            .ok_or_else(|| AppError::NotFound(format!("cache miss: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(redis_down());
        }

        lock(&self.entries).remove(key);
        Ok(())
    }
}

// ============================================================
// Delay queue
// ============================================================

/// One `publish` call as seen by `MemoryQueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub payload: String,
    pub routing_key: String,
    pub delay_ms: u64,
}

/// Queue that records publishes and makes every published payload
/// consumable immediately, regardless of its delay. Requeued deliveries go
/// straight back to the ready end as well.
#[derive(Default)]
pub struct MemoryQueue {
    published: Mutex<Vec<Published>>,
    ready: Mutex<VecDeque<String>>,
    unacked: Mutex<Vec<String>>,
    acked: Mutex<Vec<String>>,
    dead_letters: Mutex<Vec<String>>,
    requeued: Mutex<Vec<(String, u64)>>,
    fail_publish: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Enqueue a raw delivery body, bypassing `publish`.
    pub fn push(&self, body: impl Into<String>) {
        lock(&self.ready).push_back(body.into());
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    pub fn pending(&self) -> usize {
        lock(&self.ready).len()
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.acked).clone()
    }

    pub fn dead_letters(&self) -> Vec<String> {
        lock(&self.dead_letters).clone()
    }

    /// Received but not yet acked, rejected or requeued.
    pub fn unacked(&self) -> Vec<String> {
        lock(&self.unacked).clone()
    }

    /// Every `requeue` call as `(body, delay_ms)`.
    pub fn requeued(&self) -> Vec<(String, u64)> {
        lock(&self.requeued).clone()
    }

    fn settle(&self, delivery: &Delivery) {
        let mut unacked = lock(&self.unacked);
        if let Some(pos) = unacked.iter().position(|body| *body == delivery.body) {
            unacked.remove(pos);
        }
    }
}

#[async_trait]
impl DelayQueue for MemoryQueue {
    async fn publish(
        &self,
        payload: &str,
        routing_key: &str,
        delay_ms: u64,
    ) -> Result<(), AppError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::Broker("channel closed".to_string()));
        }

        lock(&self.published).push(Published {
            payload: payload.to_string(),
            routing_key: routing_key.to_string(),
            delay_ms,
        });
        lock(&self.ready).push_back(payload.to_string());
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for MemoryQueue {
    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        let body = lock(&self.ready).pop_front();
        Ok(body.map(|body| {
            lock(&self.unacked).push(body.clone());
            Delivery { body }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.settle(delivery);
        lock(&self.acked).push(delivery.body.clone());
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.settle(delivery);
        lock(&self.dead_letters).push(delivery.body.clone());
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay_ms: u64) -> Result<(), AppError> {
        self.settle(delivery);
        lock(&self.requeued).push((delivery.body.clone(), delay_ms));
        lock(&self.ready).push_back(delivery.body.clone());
        Ok(())
    }
}

// ============================================================
// Delivery channel
// ============================================================

#[derive(Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<(i64, String)>>,
    failure: Mutex<Option<String>>,
    attempts: AtomicUsize,
    hang: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `send` fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *lock(&self.failure) = Some(reason.into());
    }

    pub fn succeed(&self) {
        *lock(&self.failure) = None;
    }

    /// Make every following `send` wait forever, like a stalled upstream.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<(i64, String)> {
        lock(&self.sent).clone()
    }

    /// Every `send` call, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    fn channel_type(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(AppError::Delivery(reason));
        }

        lock(&self.sent).push((chat_id, text.to_string()));
        Ok(())
    }
}
