//! Turns a notification's send time into a broker delay and
//! publishes it on the delay queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use laterbird_common::error::AppError;
use laterbird_common::types::{Notification, parse_scheduled_time};

use crate::queue::DelayQueue;

/// Milliseconds from `now` until `time`, clamped at zero.
///
/// An empty `time` means "send now". A non-empty value that is not RFC3339
/// with an offset is a validation error.
pub fn compute_delay_ms(time: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
    let Some(send_at) = parse_scheduled_time(time)? else {
        return Ok(0);
    };

    let delay = send_at.with_timezone(&Utc) - now;
    Ok(delay.num_milliseconds().max(0) as u64)
}

pub struct Scheduler {
    queue: Arc<dyn DelayQueue>,
    routing_key: String,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn DelayQueue>, routing_key: impl Into<String>) -> Self {
        Self {
            queue,
            routing_key: routing_key.into(),
        }
    }

    /// Validate, compute the delay and publish. Nothing is published when
    /// validation fails. Returns the delay that was requested.
    pub async fn schedule(&self, notification: &Notification) -> Result<u64, AppError> {
        notification.validate_content()?;
        let delay_ms = compute_delay_ms(&notification.time, Utc::now())?;

        let payload = serde_json::to_string(notification)?;
        self.queue
            .publish(&payload, &self.routing_key, delay_ms)
            .await?;

        tracing::info!(
            notification_id = %notification.id,
            chat_id = notification.chat_id,
            delay_ms,
            "Notification scheduled"
        );

        Ok(delay_ms)
    }
}
