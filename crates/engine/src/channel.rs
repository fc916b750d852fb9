//! Delivery channel seam.
//!
//! The pipeline only needs to know whether a message reached its recipient.

use async_trait::async_trait;

use laterbird_common::error::AppError;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Short channel name used in logs.
    fn channel_type(&self) -> &'static str;

    /// Deliver `text` to `chat_id`. Any failure is reported as
    /// `AppError::Delivery`.
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), AppError>;
}
