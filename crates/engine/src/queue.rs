//! A small delayed-message broker on top of Redis.
//!
//! Layout (all keys share the `broker:` prefix):
//!
//! ```text
//! broker:exchange:<exchange>:delayed    ZSET  envelope → due time (unix ms)
//! broker:exchange:<exchange>:bindings   HASH  routing key → queue name
//! broker:queue:<queue>                  LIST  ready deliveries (LPUSH in, RPOP out)
//! broker:queue:<queue>:unacked:<tag>    LIST  deliveries held by one consumer
//! broker:queue:<dlq>                    LIST  dead letters
//! ```
//!
//! Publishing adds an envelope to the exchange's delayed set. A promoter loop
//! moves due envelopes to the queue bound to their routing key. Consumers
//! move deliveries atomically into their own unacked list (`LMOVE`), then
//! either acknowledge (drop), reject (move to the dead-letter queue) or
//! requeue (back into the delayed set with a fresh due time).
//! Unacked deliveries left behind by a crashed consumer are pushed back to
//! the ready queue when a consumer with the same tag starts again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use laterbird_common::config::AppConfig;
use laterbird_common::error::AppError;
use laterbird_common::retry::RetryPolicy;

/// Maximum number of envelopes promoted per promoter tick.
const PROMOTE_BATCH_SIZE: usize = 256;

/// Moves due envelopes from the delayed set to their bound queue.
///
/// KEYS[1] delayed set, KEYS[2] bindings hash
/// ARGV[1] now (ms), ARGV[2] batch size, ARGV[3] queue key prefix
/// Returns { routed, unroutable }.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local routed = 0
local unroutable = 0
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    local ok, envelope = pcall(cjson.decode, member)
    local queue = nil
    if ok and envelope.routing_key then
        queue = redis.call('HGET', KEYS[2], envelope.routing_key)
    end
    if queue then
        redis.call('LPUSH', ARGV[3] .. queue, envelope.payload)
        routed = routed + 1
    else
        unroutable = unroutable + 1
    end
end
return { routed, unroutable }
"#;

/// A message handed to one consumer. It stays in that consumer's unacked
/// list until it is acknowledged or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
}

/// Producer side of the broker.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Publish `payload` on `routing_key`, to become consumable after
    /// `delay_ms` milliseconds.
    async fn publish(&self, payload: &str, routing_key: &str, delay_ms: u64)
    -> Result<(), AppError>;
}

/// Consumer side of the broker.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Take the next ready delivery, if any. Does not block.
    async fn receive(&self) -> Result<Option<Delivery>, AppError>;

    /// Processing succeeded; forget the delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Processing failed; move the delivery to the dead-letter queue.
    async fn reject(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Not processable yet; hand the delivery back to be received again
    /// after `delay_ms` milliseconds.
    async fn requeue(&self, delivery: &Delivery, delay_ms: u64) -> Result<(), AppError>;
}

/// Names of the exchange, queues and binding the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub dead_letter_queue: String,
}

impl QueueTopology {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exchange: config.publisher_exchange.clone(),
            routing_key: config.routing_key.clone(),
            queue: config.consumer_queue.clone(),
            dead_letter_queue: config.dlq_name.clone(),
        }
    }

    fn delayed_key(&self) -> String {
        format!("broker:exchange:{}:delayed", self.exchange)
    }

    fn bindings_key(&self) -> String {
        format!("broker:exchange:{}:bindings", self.exchange)
    }

    fn queue_key(&self) -> String {
        queue_key(&self.queue)
    }

    fn unacked_key(&self, consumer_tag: &str) -> String {
        format!("{}:unacked:{}", self.queue_key(), consumer_tag)
    }

    fn dead_letter_key(&self) -> String {
        queue_key(&self.dead_letter_queue)
    }
}

const QUEUE_KEY_PREFIX: &str = "broker:queue:";

fn queue_key(name: &str) -> String {
    format!("{}{}", QUEUE_KEY_PREFIX, name)
}

/// What sits in the delayed set. The envelope id keeps two identical
/// payloads from collapsing into one sorted-set member.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: Uuid,
    routing_key: &'a str,
    payload: &'a str,
}

impl<'a> Envelope<'a> {
    fn encode(routing_key: &'a str, payload: &'a str) -> Result<String, AppError> {
        Ok(serde_json::to_string(&Envelope {
            id: Uuid::new_v4(),
            routing_key,
            payload,
        })?)
    }
}

fn due_at(delay_ms: u64) -> i64 {
    Utc::now().timestamp_millis() + delay_ms as i64
}

/// Counts from one promoter pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromoteStats {
    pub routed: u64,
    pub unroutable: u64,
}

/// Redis-backed delayed exchange + queues.
pub struct RedisDelayQueue {
    redis: ConnectionManager,
    topology: QueueTopology,
    retry: RetryPolicy,
    promote_script: Script,
    shutdown: CancellationToken,
}

impl RedisDelayQueue {
    pub fn new(redis: ConnectionManager, topology: QueueTopology, retry: RetryPolicy) -> Self {
        Self {
            redis,
            topology,
            retry,
            promote_script: Script::new(PROMOTE_SCRIPT),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop waiting between retries once `shutdown` fires. Consumers created
    /// afterwards share the token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Bind the routing key to the consumer queue. Idempotent; run once at
    /// startup before anything is published or consumed.
    pub async fn setup_infrastructure(&self) -> Result<(), AppError> {
        let bindings = self.topology.bindings_key();
        self.retry
            .run_until("setup_infrastructure", &self.shutdown, || {
                let mut conn = self.redis.clone();
                let bindings = bindings.clone();
                async move {
                    conn.hset::<_, _, _, ()>(
                        &bindings,
                        &self.topology.routing_key,
                        &self.topology.queue,
                    )
                    .await?;
                    Ok(())
                }
            })
            .await?;

        tracing::info!(
            exchange = %self.topology.exchange,
            queue = %self.topology.queue,
            routing_key = %self.topology.routing_key,
            dead_letter_queue = %self.topology.dead_letter_queue,
            "Delay queue infrastructure ready"
        );
        Ok(())
    }

    /// Route every envelope whose due time is at or before `now_ms`.
    pub async fn promote_due(&self, now_ms: i64) -> Result<PromoteStats, AppError> {
        let mut conn = self.redis.clone();
        let (routed, unroutable): (u64, u64) = self
            .promote_script
            .key(self.topology.delayed_key())
            .key(self.topology.bindings_key())
            .arg(now_ms)
            .arg(PROMOTE_BATCH_SIZE)
            .arg(QUEUE_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        Ok(PromoteStats { routed, unroutable })
    }

    /// Broker-side loop routing due messages until `cancel` fires.
    pub async fn run_promoter(&self, cancel: CancellationToken, poll_interval: Duration) {
        tracing::info!(exchange = %self.topology.exchange, "Delay queue promoter started");

        loop {
            match self.promote_due(Utc::now().timestamp_millis()).await {
                Ok(stats) => {
                    if stats.unroutable > 0 {
                        tracing::warn!(
                            exchange = %self.topology.exchange,
                            unroutable = stats.unroutable,
                            "Dropped messages with no bound queue"
                        );
                    }
                    // A full batch means more may be due already.
                    if stats.routed + stats.unroutable >= PROMOTE_BATCH_SIZE as u64 {
                        continue;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to promote due messages");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        tracing::info!(exchange = %self.topology.exchange, "Delay queue promoter stopped");
    }

    /// Consumer handle for one worker. Deliveries left unacked by a previous
    /// run with the same tag are requeued first.
    pub async fn consumer(&self, consumer_tag: &str) -> Result<RedisConsumer, AppError> {
        let consumer = RedisConsumer {
            redis: self.redis.clone(),
            queue_key: self.topology.queue_key(),
            unacked_key: self.topology.unacked_key(consumer_tag),
            dead_letter_key: self.topology.dead_letter_key(),
            delayed_key: self.topology.delayed_key(),
            routing_key: self.topology.routing_key.clone(),
            retry: self.retry,
            shutdown: self.shutdown.clone(),
        };

        let recovered = consumer.recover_unacked().await?;
        if recovered > 0 {
            tracing::warn!(
                consumer = consumer_tag,
                recovered,
                "Requeued deliveries left unacknowledged by a previous run"
            );
        }

        Ok(consumer)
    }

    /// Number of messages parked in the dead-letter queue.
    pub async fn dead_letter_count(&self) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.llen(self.topology.dead_letter_key()).await?;
        Ok(len)
    }
}

#[async_trait]
impl DelayQueue for RedisDelayQueue {
    async fn publish(
        &self,
        payload: &str,
        routing_key: &str,
        delay_ms: u64,
    ) -> Result<(), AppError> {
        let envelope = Envelope::encode(routing_key, payload)?;
        let due_ms = due_at(delay_ms);
        let delayed = self.topology.delayed_key();

        tracing::info!(
            exchange = %self.topology.exchange,
            routing_key,
            delay_ms,
            "Publishing message to delay queue"
        );

        self.retry
            .run_until("publish", &self.shutdown, || {
                let mut conn = self.redis.clone();
                let delayed = delayed.clone();
                let envelope = envelope.clone();
                async move {
                    conn.zadd::<_, _, _, ()>(&delayed, &envelope, due_ms).await?;
                    Ok(())
                }
            })
            .await
            .inspect_err(|e| {
                tracing::error!(routing_key, error = %e, "Failed to publish message");
            })?;

        tracing::debug!(routing_key, "Message published");
        Ok(())
    }
}

/// One worker's view of the consumer queue.
pub struct RedisConsumer {
    redis: ConnectionManager,
    queue_key: String,
    unacked_key: String,
    dead_letter_key: String,
    delayed_key: String,
    routing_key: String,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl RedisConsumer {
    /// Push everything in this consumer's unacked list back onto the ready
    /// queue. Returns how many deliveries were moved.
    pub async fn recover_unacked(&self) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0u64;
        loop {
            // Newest first onto the consuming end, so the oldest one ends up
            // being received first.
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.unacked_key)
                .arg(&self.queue_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                return Ok(recovered);
            }
            recovered += 1;
        }
    }
}

#[async_trait]
impl DeliverySource for RedisConsumer {
    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        let mut conn = self.redis.clone();
        let body: Option<String> = redis::cmd("LMOVE")
            .arg(&self.queue_key)
            .arg(&self.unacked_key)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        Ok(body.map(|body| Delivery { body }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.retry
            .run_until("ack", &self.shutdown, || {
                let mut conn = self.redis.clone();
                async move {
                    conn.lrem::<_, _, ()>(&self.unacked_key, 1, &delivery.body)
                        .await?;
                    Ok(())
                }
            })
            .await
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.retry
            .run_until("reject", &self.shutdown, || {
                let mut conn = self.redis.clone();
                async move {
                    let _: () = redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.unacked_key)
                        .arg(1)
                        .arg(&delivery.body)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(&self.dead_letter_key)
                        .arg(&delivery.body)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok(())
                }
            })
            .await?;

        tracing::warn!(dead_letter_queue = %self.dead_letter_key, "Delivery dead-lettered");
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay_ms: u64) -> Result<(), AppError> {
        let envelope = Envelope::encode(&self.routing_key, &delivery.body)?;
        let due_ms = due_at(delay_ms);

        self.retry
            .run_until("requeue", &self.shutdown, || {
                let mut conn = self.redis.clone();
                let envelope = envelope.clone();
                async move {
                    let _: () = redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.unacked_key)
                        .arg(1)
                        .arg(&delivery.body)
                        .ignore()
                        .cmd("ZADD")
                        .arg(&self.delayed_key)
                        .arg(due_ms)
                        .arg(&envelope)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok(())
                }
            })
            .await?;

        tracing::debug!(delay_ms, "Delivery requeued");
        Ok(())
    }
}
