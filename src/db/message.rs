use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_stream::StreamExt;

use crate::message::{to_millis, Message, MessageRow, MessageStatus};

const COLUMNS: &str = "id, message_id, message_body, status, created_at, processed_at, \
     retry_count, error_message, locked_until, locked_by";

/// Raw statements against the `queue_messages` table.
///
/// Every mutation is a single conditional statement, so callers never need to
/// hold a transaction across rows.
pub struct MessageTable;

impl MessageTable {
    pub async fn insert(
        db: &mut SqliteConnection,
        message_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, sqlx::Error> {
        let row: MessageRow = sqlx::query_as(&format!(
            "INSERT INTO queue_messages (message_id, message_body, status, created_at)
             VALUES ($1, $2, 'pending', $3)
             RETURNING {COLUMNS}"
        ))
        .bind(message_id)
        .bind(body)
        .bind(to_millis(now))
        .fetch_one(db)
        .await?;

        Ok(row.into())
    }

    pub async fn get(
        db: &mut SqliteConnection,
        message_id: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM queue_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Pending messages and expired leases, oldest first.
    pub async fn candidates(
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>, sqlx::Error> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue_messages
             WHERE status = 'pending'
                OR (status = 'processing' AND locked_until < $1)
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        );
        let mut stream = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch(db);

        let mut messages = Vec::new();

        while let Some(row) = stream.next().await.transpose()? {
            messages.push(row.into());
        }

        Ok(messages)
    }

    /// Compare-and-swap into `processing`.
    ///
    /// Matches only while the row is still pending or its lease has expired.
    /// Reclaiming an expired lease counts as an abandoned attempt.
    pub async fn try_lease(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET status = 'processing',
                 locked_by = $1,
                 locked_until = $2,
                 retry_count = retry_count + (CASE WHEN status = 'processing' THEN 1 ELSE 0 END)
             WHERE message_id = $3
               AND (status = 'pending' OR (status = 'processing' AND locked_until < $4))",
        )
        .bind(owner)
        .bind(to_millis(expiry))
        .bind(message_id)
        .bind(to_millis(now))
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn extend_lease(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET locked_until = $1
             WHERE message_id = $2
               AND status = 'processing'
               AND locked_by = $3
               AND locked_until >= $4",
        )
        .bind(to_millis(expiry))
        .bind(message_id)
        .bind(owner)
        .bind(to_millis(now))
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn release(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: &str,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET status = 'pending', locked_by = NULL, locked_until = NULL
             WHERE message_id = $1 AND status = 'processing' AND locked_by = $2",
        )
        .bind(message_id)
        .bind(owner)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Terminal updates take an optional `owner`; when given, the row must
    /// still be leased to it.
    pub async fn mark_completed(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET status = 'completed',
                 processed_at = $1,
                 locked_by = NULL,
                 locked_until = NULL
             WHERE message_id = $2
               AND status = 'processing'
               AND ($3 IS NULL OR locked_by = $3)",
        )
        .bind(to_millis(now))
        .bind(message_id)
        .bind(owner)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Records a failed attempt on a leased message.
    ///
    /// Returns the resulting status, or `None` if the message was not leased.
    pub async fn mark_failed(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: Option<&str>,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<MessageStatus>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE queue_messages
             SET retry_count = retry_count + 1,
                 error_message = $1,
                 status = CASE WHEN retry_count + 1 >= $2 THEN 'failed' ELSE 'pending' END,
                 processed_at = CASE WHEN retry_count + 1 >= $2 THEN $3 ELSE NULL END,
                 locked_by = NULL,
                 locked_until = NULL
             WHERE message_id = $4
               AND status = 'processing'
               AND ($5 IS NULL OR locked_by = $5)
             RETURNING status",
        )
        .bind(reason)
        .bind(i64::from(max_retries))
        .bind(to_millis(now))
        .bind(message_id)
        .bind(owner)
        .fetch_optional(db)
        .await
    }

    pub async fn mark_failed_permanently(
        db: &mut SqliteConnection,
        message_id: &str,
        owner: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET retry_count = retry_count + 1,
                 error_message = $1,
                 status = 'failed',
                 processed_at = $2,
                 locked_by = NULL,
                 locked_until = NULL
             WHERE message_id = $3
               AND status = 'processing'
               AND ($4 IS NULL OR locked_by = $4)",
        )
        .bind(reason)
        .bind(to_millis(now))
        .bind(message_id)
        .bind(owner)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Fails expired leases that have no retry budget left.
    pub async fn fail_abandoned(
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET retry_count = retry_count + 1,
                 error_message = 'lease expired',
                 status = 'failed',
                 processed_at = $1,
                 locked_by = NULL,
                 locked_until = NULL
             WHERE status = 'processing'
               AND locked_until < $1
               AND retry_count + 1 >= $2",
        )
        .bind(to_millis(now))
        .bind(i64::from(max_retries))
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn requeue_failed(
        db: &mut SqliteConnection,
        message_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE queue_messages
             SET status = 'pending',
                 retry_count = 0,
                 processed_at = NULL,
                 error_message = NULL
             WHERE message_id = $1 AND status = 'failed'",
        )
        .bind(message_id)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn purge_completed(
        db: &mut SqliteConnection,
        before: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            "DELETE FROM queue_messages WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(to_millis(before))
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn count_by_status(
        db: &mut SqliteConnection,
    ) -> Result<Vec<(MessageStatus, i64)>, sqlx::Error> {
        sqlx::query_as("SELECT status, COUNT(*) FROM queue_messages GROUP BY status")
            .fetch_all(db)
            .await
    }
}
