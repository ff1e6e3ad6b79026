//! Message records and their lifecycle.
//!
//! A message is one chunk of a business batch persisted in the fallback queue.
//! Messages move through a small state machine:
//!
//! 1. Messages are created in `Pending` status
//! 2. A consumer leases them into `Processing`
//! 3. Processing ends in `Completed`, goes back to `Pending` for another
//!    attempt, or ends in `Failed` once the retry budget is spent
//!
//! An operator may move a `Failed` message back to `Pending`.
//!
//! Only the store mutates records; this module holds the data and the rules a
//! loaded record has to satisfy.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Current status of a message in the queue.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting for a consumer to lease it
    #[sqlx(rename = "pending")]
    Pending,
    /// Leased by exactly one worker until the lease expires
    #[sqlx(rename = "processing")]
    Processing,
    /// Successfully handled
    #[sqlx(rename = "completed")]
    Completed,
    /// Retry budget exhausted or non-retryable failure
    #[sqlx(rename = "failed")]
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Processing -> Processing` is the reclaim of an abandoned lease and
    /// `Failed -> Pending` is an operator requeue.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

/// A message in the fallback queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned surrogate key
    pub id: i64,
    /// Caller-supplied idempotency key
    pub message_id: String,
    /// Opaque serialized event body
    pub payload: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Set once the message reaches a terminal status
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Last failure reason
    pub error_message: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
}

/// Broken record invariant.
#[derive(Debug, Clone, PartialEq, Eq, snafu::Snafu)]
pub enum InvariantViolation {
    #[snafu(display("{status} message must {expectation} a lease"))]
    Lease {
        status: MessageStatus,
        expectation: &'static str,
    },

    #[snafu(display("{status} message must {expectation} a processed timestamp"))]
    ProcessedAt {
        status: MessageStatus,
        expectation: &'static str,
    },
}

impl Message {
    pub fn is_leased(&self) -> bool {
        self.status == MessageStatus::Processing
    }

    /// Whether a `Processing` message has outlived its lease at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_leased() && self.lease_expiry.is_some_and(|expiry| expiry < now)
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let leased = self.lease_owner.is_some() && self.lease_expiry.is_some();
        let unleased = self.lease_owner.is_none() && self.lease_expiry.is_none();

        if self.is_leased() && !leased {
            return Err(InvariantViolation::Lease {
                status: self.status,
                expectation: "hold",
            });
        }
        if !self.is_leased() && !unleased {
            return Err(InvariantViolation::Lease {
                status: self.status,
                expectation: "not hold",
            });
        }

        match (self.status.is_terminal(), self.processed_at.is_some()) {
            (true, false) => Err(InvariantViolation::ProcessedAt {
                status: self.status,
                expectation: "have",
            }),
            (false, true) => Err(InvariantViolation::ProcessedAt {
                status: self.status,
                expectation: "not have",
            }),
            _ => Ok(()),
        }
    }
}

/// Row shape of the `queue_messages` table.
#[derive(FromRow)]
pub(crate) struct MessageRow {
    id: i64,
    message_id: String,
    message_body: String,
    status: MessageStatus,
    created_at: i64,
    processed_at: Option<i64>,
    retry_count: i64,
    error_message: Option<String>,
    locked_until: Option<i64>,
    locked_by: Option<String>,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            message_id: row.message_id,
            payload: row.message_body,
            status: row.status,
            created_at: from_millis(row.created_at),
            processed_at: row.processed_at.map(from_millis),
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            error_message: row.error_message,
            lease_expiry: row.locked_until.map(from_millis),
            lease_owner: row.locked_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::{Duration, SubsecRound};
    use strum::IntoEnumIterator;

    use super::*;

    fn pending() -> Message {
        Message {
            id: 1,
            message_id: "msg-1".to_owned(),
            payload: "{}".to_owned(),
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
            lease_expiry: None,
            lease_owner: None,
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in MessageStatus::iter() {
            assert_eq!(
                MessageStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
        assert_eq!(MessageStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn terminal_statuses() {
        assert!(MessageStatus::Completed.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
    }

    #[test]
    fn completed_is_a_sink() {
        for next in MessageStatus::iter() {
            assert!(!MessageStatus::Completed.can_transition_to(next));
        }
        assert!(!MessageStatus::Pending.can_transition_to(MessageStatus::Completed));
        assert!(MessageStatus::Failed.can_transition_to(MessageStatus::Pending));
    }

    #[test]
    fn lease_invariants() {
        let mut msg = pending();
        assert!(msg.check_invariants().is_ok());

        msg.status = MessageStatus::Processing;
        assert!(matches!(
            msg.check_invariants(),
            Err(InvariantViolation::Lease { .. })
        ));

        msg.lease_owner = Some("worker-a".to_owned());
        msg.lease_expiry = Some(Utc::now() + Duration::minutes(5));
        assert!(msg.check_invariants().is_ok());

        msg.status = MessageStatus::Pending;
        assert!(msg.check_invariants().is_err());
    }

    #[test]
    fn processed_at_tracks_terminal_status() {
        let mut msg = pending();
        msg.status = MessageStatus::Completed;
        assert!(matches!(
            msg.check_invariants(),
            Err(InvariantViolation::ProcessedAt { .. })
        ));

        msg.processed_at = Some(Utc::now());
        assert!(msg.check_invariants().is_ok());
    }

    #[test]
    fn lease_expiry() {
        let now = Utc::now();
        let mut msg = pending();
        assert!(!msg.lease_expired(now));

        msg.status = MessageStatus::Processing;
        msg.lease_owner = Some("worker-a".to_owned());
        msg.lease_expiry = Some(now + Duration::minutes(5));
        assert!(!msg.lease_expired(now));
        assert!(msg.lease_expired(now + Duration::minutes(6)));
    }

    #[test]
    fn timestamps_are_stored_at_millisecond_precision() {
        let now = Utc::now().trunc_subsecs(3);
        assert_eq!(from_millis(to_millis(now)), now);

        let precise = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(
            from_millis(to_millis(precise)),
            Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap()
        );
    }
}
