use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Notification delivery status.
///
/// `created` is the only entry state; `sent` and `failed` are terminal for
/// the pipeline, `cancelled` is set when a notification is deleted. A send
/// interrupted by shutdown releases `sending` back to `created`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Created,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Created => "created",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    /// States a row must be in for a transition to `self` to apply.
    pub fn predecessors(&self) -> &'static [NotificationStatus] {
        match self {
            NotificationStatus::Created => &[NotificationStatus::Sending],
            NotificationStatus::Sending => &[NotificationStatus::Created],
            NotificationStatus::Sent | NotificationStatus::Failed => {
                &[NotificationStatus::Sending]
            }
            NotificationStatus::Cancelled => &[
                NotificationStatus::Created,
                NotificationStatus::Sending,
                NotificationStatus::Sent,
                NotificationStatus::Failed,
            ],
        }
    }

    pub fn can_transition_from(&self, current: NotificationStatus) -> bool {
        self.predecessors().contains(&current)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(NotificationStatus::Created),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "cancelled" => Ok(NotificationStatus::Cancelled),
            other => Err(AppError::Validation(format!(
                "Unknown notification status '{}'",
                other
            ))),
        }
    }
}

/// A message scheduled for delivery to a Telegram chat.
///
/// This is also the JSON payload carried on the delay queue. Every field has
/// a serde default so that a payload with missing fields still deserializes
/// and is rejected by validation instead of by the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Server-assigned identifier (UUIDv4), join key across store, cache and queue
    #[serde(default)]
    pub id: String,
    /// Text to deliver
    #[serde(default)]
    pub message: String,
    /// RFC3339 send time with offset; empty means "as soon as possible"
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub status: NotificationStatus,
    /// Telegram chat id of the recipient
    #[serde(default)]
    pub chat_id: i64,
}

impl Notification {
    pub fn new(message: impl Into<String>, time: impl Into<String>, chat_id: i64) -> Self {
        Self {
            id: String::new(),
            message: message.into(),
            time: time.into(),
            status: NotificationStatus::Created,
            chat_id,
        }
    }

    /// Fields required before anything is scheduled.
    pub fn validate_content(&self) -> Result<(), AppError> {
        if self.message.is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        if self.chat_id == 0 {
            return Err(AppError::Validation("chat_id is required".to_string()));
        }
        Ok(())
    }

    /// Fields required before a queued notification may be dispatched.
    pub fn validate_for_dispatch(&self) -> Result<(), AppError> {
        if self.id.is_empty() || self.message.is_empty() || self.chat_id == 0 {
            return Err(AppError::Validation(
                "invalid notification: missing required fields".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduled_time(&self) -> Result<Option<DateTime<FixedOffset>>, AppError> {
        parse_scheduled_time(&self.time)
    }
}

/// Parse an RFC3339 scheduled time. Empty (or whitespace-only) input means
/// the notification is immediate.
pub fn parse_scheduled_time(time: &str) -> Result<Option<DateTime<FixedOffset>>, AppError> {
    let time = time.trim();
    if time.is_empty() {
        return Ok(None);
    }

    DateTime::parse_from_rfc3339(time)
        .map(Some)
        .map_err(|e| AppError::Validation(format!("invalid time format (use RFC3339): {}", e)))
}
