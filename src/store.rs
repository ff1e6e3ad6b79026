//! Durable fallback queue with lease-based consumption.
//!
//! The store is the only shared mutable state between workers. Ownership of a
//! message changes only through [`QueueStore::acquire_lease`], a single
//! conditional update, so any number of pollers can run against the same
//! database without further coordination.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Acquire, SqlitePool};
use strum::IntoEnumIterator;

use crate::{
    db::message::MessageTable,
    error::Error,
    message::{Message, MessageStatus},
};

/// Message counts per status.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Clone)]
pub struct QueueStore {
    db: SqlitePool,
}

impl QueueStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Inserts a new pending message.
    ///
    /// Fails with [`Error::DuplicateMessage`] when the idempotency key is
    /// already present; callers should read that as "already queued".
    pub async fn enqueue(
        &self,
        message_id: impl AsRef<str>,
        payload: impl AsRef<str>,
    ) -> Result<Message, Error> {
        let message_id = message_id.as_ref();
        let mut tx = self.db.begin().await?;

        let message =
            match MessageTable::insert(tx.acquire().await?, message_id, payload.as_ref(), Utc::now())
                .await
                .map_err(Error::from)
            {
                Ok(message) => message,
                Err(e) if e.is_unique_violation() => {
                    tracing::debug!(message_id, "Message already queued");
                    return Err(Error::DuplicateMessage {
                        message_id: message_id.to_owned(),
                    });
                }
                Err(e) => return Err(e),
            };

        tx.commit().await?;

        tracing::debug!(message_id, id = message.id, "Enqueued message");

        Ok(message)
    }

    pub async fn get(&self, message_id: impl AsRef<str>) -> Result<Option<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(MessageTable::get(&mut conn, message_id.as_ref()).await?)
    }

    /// Selects up to `limit` leasable messages, oldest first.
    ///
    /// This does not grant a lease; follow up with [`QueueStore::acquire_lease`].
    pub async fn lease_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(MessageTable::candidates(&mut conn, now, limit).await?)
    }

    /// Attempts to take the lease on a message.
    ///
    /// Returns `false` when another worker got there first; that is not an
    /// error and the caller should simply drop the message.
    pub async fn acquire_lease(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<bool, Error> {
        let message_id = message_id.as_ref();
        let owner = owner.as_ref();
        let expiry = lease_expiry(now, lease_duration)?;

        let mut conn = self.db.acquire().await?;
        let acquired = MessageTable::try_lease(&mut conn, message_id, owner, now, expiry).await?;

        if acquired {
            tracing::debug!(message_id, owner, "Lease acquired");
        } else {
            tracing::trace!(message_id, owner, "Lease lost to another worker");
        }

        Ok(acquired)
    }

    /// Selects candidates and leases as many as possible to `owner`.
    ///
    /// Leased messages are re-read after acquisition so the caller never acts
    /// on the pre-lease snapshot.
    pub async fn claim(
        &self,
        owner: impl AsRef<str>,
        now: DateTime<Utc>,
        limit: u32,
        lease_duration: Duration,
    ) -> Result<Vec<Message>, Error> {
        let owner = owner.as_ref();
        let mut claimed = Vec::new();

        for candidate in self.lease_batch(now, limit).await? {
            if candidate.lease_expired(now) {
                tracing::info!(
                    message_id = %candidate.message_id,
                    previous_owner = candidate.lease_owner.as_deref(),
                    owner,
                    "Reclaiming expired lease"
                );
            }

            if !self
                .acquire_lease(&candidate.message_id, owner, now, lease_duration)
                .await?
            {
                continue;
            }

            match self.get(&candidate.message_id).await? {
                Some(message) if message.lease_owner.as_deref() == Some(owner) => {
                    claimed.push(message)
                }
                _ => tracing::debug!(
                    message_id = %candidate.message_id,
                    owner,
                    "Lease changed hands before re-read"
                ),
            }
        }

        Ok(claimed)
    }

    /// Pushes the lease expiry out for the current owner.
    pub async fn extend_lease(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<bool, Error> {
        let expiry = lease_expiry(now, lease_duration)?;
        let mut conn = self.db.acquire().await?;
        Ok(MessageTable::extend_lease(
            &mut conn,
            message_id.as_ref(),
            owner.as_ref(),
            now,
            expiry,
        )
        .await?)
    }

    /// Gives a lease back without charging an attempt.
    pub async fn release(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
    ) -> Result<bool, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(MessageTable::release(&mut conn, message_id.as_ref(), owner.as_ref()).await?)
    }

    /// Marks a leased message as completed. Completing twice is a no-op.
    ///
    /// This does not check who holds the lease; workers should use
    /// [`QueueStore::complete_leased`].
    pub async fn complete(&self, message_id: impl AsRef<str>) -> Result<(), Error> {
        self.complete_as(message_id.as_ref(), None).await
    }

    /// Completes a message only while `owner` still holds its lease.
    ///
    /// Fails with [`Error::LeaseLost`] once the lease has been reclaimed by
    /// another worker.
    pub async fn complete_leased(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
    ) -> Result<(), Error> {
        self.complete_as(message_id.as_ref(), Some(owner.as_ref())).await
    }

    async fn complete_as(&self, message_id: &str, owner: Option<&str>) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        if MessageTable::mark_completed(tx.acquire().await?, message_id, owner, Utc::now()).await? {
            tx.commit().await?;
            tracing::info!(message_id, owner, "Message completed");
            return Ok(());
        }

        let current = MessageTable::get(tx.acquire().await?, message_id).await?;
        tx.rollback().await?;

        match current {
            Some(message) if message.status == MessageStatus::Completed => Ok(()),
            current => Err(rejection(
                message_id,
                owner,
                current,
                MessageStatus::Completed,
            )),
        }
    }

    /// Records a recoverable failure on a leased message.
    ///
    /// Once the retry count reaches `max_retries` the message is failed for
    /// good; until then it goes back to pending. Returns the new status.
    pub async fn fail(
        &self,
        message_id: impl AsRef<str>,
        reason: impl AsRef<str>,
        max_retries: u32,
    ) -> Result<MessageStatus, Error> {
        self.fail_as(message_id.as_ref(), None, reason.as_ref(), max_retries)
            .await
    }

    /// [`QueueStore::fail`], guarded on `owner` still holding the lease.
    pub async fn fail_leased(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
        reason: impl AsRef<str>,
        max_retries: u32,
    ) -> Result<MessageStatus, Error> {
        self.fail_as(
            message_id.as_ref(),
            Some(owner.as_ref()),
            reason.as_ref(),
            max_retries,
        )
        .await
    }

    async fn fail_as(
        &self,
        message_id: &str,
        owner: Option<&str>,
        reason: &str,
        max_retries: u32,
    ) -> Result<MessageStatus, Error> {
        let mut tx = self.db.begin().await?;

        let status = MessageTable::mark_failed(
            tx.acquire().await?,
            message_id,
            owner,
            reason,
            max_retries,
            Utc::now(),
        )
        .await?;

        let Some(status) = status else {
            let current = MessageTable::get(tx.acquire().await?, message_id).await?;
            tx.rollback().await?;
            return Err(rejection(message_id, owner, current, MessageStatus::Failed));
        };

        tx.commit().await?;

        match status {
            MessageStatus::Failed => {
                tracing::error!(message_id, reason, "Retry budget exhausted, message failed")
            }
            _ => tracing::warn!(message_id, reason, "Message requeued after failure"),
        }

        Ok(status)
    }

    /// Fails a leased message immediately, regardless of its retry budget.
    pub async fn fail_permanently(
        &self,
        message_id: impl AsRef<str>,
        reason: impl AsRef<str>,
    ) -> Result<(), Error> {
        self.fail_permanently_as(message_id.as_ref(), None, reason.as_ref())
            .await
    }

    /// [`QueueStore::fail_permanently`], guarded on `owner` still holding the
    /// lease.
    pub async fn fail_permanently_leased(
        &self,
        message_id: impl AsRef<str>,
        owner: impl AsRef<str>,
        reason: impl AsRef<str>,
    ) -> Result<(), Error> {
        self.fail_permanently_as(message_id.as_ref(), Some(owner.as_ref()), reason.as_ref())
            .await
    }

    async fn fail_permanently_as(
        &self,
        message_id: &str,
        owner: Option<&str>,
        reason: &str,
    ) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;

        if MessageTable::mark_failed_permanently(&mut conn, message_id, owner, reason, Utc::now())
            .await?
        {
            tracing::error!(message_id, reason, "Message failed permanently");
            return Ok(());
        }

        let current = MessageTable::get(&mut conn, message_id).await?;
        Err(rejection(message_id, owner, current, MessageStatus::Failed))
    }

    /// Fails abandoned leases that have no attempts left.
    pub async fn reap_abandoned(&self, now: DateTime<Utc>, max_retries: u32) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        let reaped = MessageTable::fail_abandoned(&mut conn, now, max_retries).await?;

        if reaped > 0 {
            tracing::warn!(count = reaped, "Failed abandoned messages with no retries left");
        }

        Ok(reaped)
    }

    /// Operator action: puts a failed message back in the queue with a fresh
    /// retry budget.
    pub async fn requeue_failed(&self, message_id: impl AsRef<str>) -> Result<bool, Error> {
        let message_id = message_id.as_ref();
        let mut conn = self.db.acquire().await?;
        let requeued = MessageTable::requeue_failed(&mut conn, message_id).await?;

        if requeued {
            tracing::info!(message_id, "Failed message requeued");
        }

        Ok(requeued)
    }

    /// Deletes completed messages processed before `before`.
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        let purged = MessageTable::purge_completed(&mut conn, before).await?;

        if purged > 0 {
            tracing::info!(count = purged, "Purged completed messages");
        }

        Ok(purged)
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        let mut conn = self.db.acquire().await?;
        let counts: HashMap<MessageStatus, i64> = MessageTable::count_by_status(&mut conn)
            .await?
            .into_iter()
            .collect();

        let mut stats = QueueStats::default();
        for status in MessageStatus::iter() {
            let count = counts.get(&status).copied().unwrap_or(0).max(0) as u64;
            match status {
                MessageStatus::Pending => stats.pending = count,
                MessageStatus::Processing => stats.processing = count,
                MessageStatus::Completed => stats.completed = count,
                MessageStatus::Failed => stats.failed = count,
            }
        }

        Ok(stats)
    }
}

fn lease_expiry(now: DateTime<Utc>, lease_duration: Duration) -> Result<DateTime<Utc>, Error> {
    now.checked_add_signed(lease_duration).ok_or_else(|| {
        Error::invalid_parameter(format!("lease of {lease_duration} is out of range"))
    })
}

/// Why a terminal update on `message_id` matched no row.
///
/// A transition the state machine allows that still did not apply means the
/// caller's lease was taken over.
fn rejection(
    message_id: &str,
    owner: Option<&str>,
    current: Option<Message>,
    target: MessageStatus,
) -> Error {
    match (current, owner) {
        (None, _) => Error::message_not_found(message_id),
        (Some(message), Some(owner)) if message.status.can_transition_to(target) => {
            Error::LeaseLost {
                message_id: message_id.to_owned(),
                owner: owner.to_owned(),
            }
        }
        (Some(message), _) => Error::InvalidTransition {
            message_id: message_id.to_owned(),
            status: message.status,
            target,
        },
    }
}
