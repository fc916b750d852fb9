//! The durable source of truth for notification status.
//!
//! Status updates are guarded by the lifecycle: a transition only applies
//! when the row is currently in one of the target status' predecessors.
//! This per-row compare-and-set is what keeps a redelivered or cancelled
//! notification from being dispatched a second time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use laterbird_common::error::AppError;
use laterbird_common::types::{Notification, NotificationStatus};

/// Outcome of a guarded status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The row moved to the requested status.
    Applied,
    /// The row exists but its current status does not allow the transition.
    Skipped { current: NotificationStatus },
}

/// Durable, queryable table of notifications keyed by id.
///
/// Every method reports an unknown id as `AppError::NotFound`.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<(), AppError>;

    async fn read_status(&self, id: &str) -> Result<NotificationStatus, AppError>;

    async fn update_status(
        &self,
        id: &str,
        status: NotificationStatus,
    ) -> Result<StatusUpdate, AppError>;

    /// Mark the notification `cancelled`. The row is kept for auditing.
    async fn delete(&self, id: &str) -> Result<(), AppError>;

    /// All notifications, newest first.
    async fn read_all(&self) -> Result<Vec<Notification>, AppError>;
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: String,
    message: String,
    scheduled_at: Option<DateTime<Utc>>,
    status: String,
    chat_id: i64,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            status: row.status.parse()?,
            id: row.id,
            message: row.message,
            time: row
                .scheduled_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            chat_id: row.chat_id,
        })
    }
}

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        let scheduled_at = notification
            .scheduled_time()?
            .map(|t| t.with_timezone(&Utc));

        sqlx::query(
            r#"
            INSERT INTO notifications (id, message, scheduled_at, status, chat_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.message)
        .bind(scheduled_at)
        .bind(notification.status.as_str())
        .bind(notification.chat_id)
        .execute(&self.pool)
        .await
        .inspect_err(|e| {
            tracing::error!(
                notification_id = %notification.id,
                error = %e,
                "Failed to insert notification"
            );
        })?;

        tracing::info!(notification_id = %notification.id, "Notification stored");
        Ok(())
    }

    async fn read_status(&self, id: &str) -> Result<NotificationStatus, AppError> {
        let status: String =
            sqlx::query_scalar("SELECT status FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("notification not found: {}", id)))?;

        status.parse()
    }

    async fn update_status(
        &self,
        id: &str,
        status: NotificationStatus,
    ) -> Result<StatusUpdate, AppError> {
        let allowed: Vec<&str> = status.predecessors().iter().map(|s| s.as_str()).collect();

        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = ANY($3)
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .bind(allowed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(notification_id = %id, status = %status, "Notification status updated");
            return Ok(StatusUpdate::Applied);
        }

        // Nothing matched: either the row is gone or it is in another state.
        let current = self.read_status(id).await?;
        tracing::debug!(
            notification_id = %id,
            requested = %status,
            current = %current,
            "Status transition skipped"
        );
        Ok(StatusUpdate::Skipped { current })
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(NotificationStatus::Cancelled.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("notification not found: {}", id)));
        }

        tracing::info!(notification_id = %id, "Notification cancelled");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Notification>, AppError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, message, scheduled_at, status, chat_id
            FROM notifications
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Notification::try_from).collect()
    }
}
