//! Polling consumer for the fallback queue.
//!
//! Each poll reaps exhausted abandoned leases, claims a batch, and runs the
//! [`Handler`] on every claimed message. The outcome decides whether the
//! message completes, goes back to pending, or fails. Workers share nothing
//! but the store.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::Error,
    message::{Message, MessageStatus},
    store::QueueStore,
    transport::{OutboundMessage, Sender, Transport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub reason: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Processes one leased message.
///
/// Delivery is at-least-once: a handler may see the same `message_id` again
/// after a lease expires, and must be idempotent on it.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Relays queued chunks to a broker.
pub struct ForwardHandler {
    sender: Sender,
}

impl ForwardHandler {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            sender: Sender::new(transport, timeout),
        }
    }
}

impl Handler for ForwardHandler {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let outbound = OutboundMessage::new(&message.message_id, &message.payload)
                .with_attribute("Attempt", (message.retry_count + 1).to_string());

            self.sender.send(&outbound).await.map_err(|e| HandlerError {
                retryable: e.is_retryable(),
                reason: e.to_string(),
            })
        })
    }
}

/// What one poll did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub reaped: u64,
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Outcomes dropped because the lease had been reclaimed
    pub lost: usize,
    /// Store errors while recording an outcome
    pub errors: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.reaped == 0
    }
}

pub struct Consumer<H> {
    store: QueueStore,
    handler: H,
    owner: String,
    batch_size: u32,
    lease_duration: chrono::Duration,
    max_retries: u32,
    poll_interval: Duration,
    max_poll_interval: Duration,
    completed_retention: Option<chrono::Duration>,
}

/// A worker id unique to this process and consumer.
pub fn generate_owner() -> String {
    format!(
        "worker-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

#[bon::bon]
impl<H: Handler> Consumer<H> {
    #[builder]
    pub fn new(
        store: QueueStore,
        handler: H,
        #[builder(into)] owner: Option<String>,
        #[builder(default = 10)] batch_size: u32,
        #[builder(default = chrono::Duration::minutes(5))] lease_duration: chrono::Duration,
        #[builder(default = crate::config::DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = Duration::from_secs(1))] poll_interval: Duration,
        #[builder(default = Duration::from_secs(30))] max_poll_interval: Duration,
        completed_retention: Option<chrono::Duration>,
    ) -> Self {
        Self {
            store,
            handler,
            owner: owner.unwrap_or_else(generate_owner),
            batch_size: batch_size.max(1),
            lease_duration,
            max_retries,
            poll_interval,
            max_poll_interval: max_poll_interval.max(poll_interval),
            completed_retention,
        }
    }
}

impl<H: Handler> Consumer<H> {
    pub fn from_config(config: &Config, store: QueueStore, handler: H) -> Result<Self, Error> {
        Ok(Self::builder()
            .store(store)
            .handler(handler)
            .batch_size(config.poll_batch_size())
            .lease_duration(config.lease_duration()?)
            .max_retries(config.max_retries())
            .poll_interval(config.poll_interval())
            .max_poll_interval(config.max_poll_interval())
            .maybe_completed_retention(config.completed_retention()?)
            .build())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs one reap/claim/handle cycle as of `now`.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport, Error> {
        let mut report = PollReport {
            reaped: self.store.reap_abandoned(now, self.max_retries).await?,
            ..Default::default()
        };

        let claimed = self
            .store
            .claim(&self.owner, now, self.batch_size, self.lease_duration)
            .await?;
        report.claimed = claimed.len();

        for message in &claimed {
            let message_id = &message.message_id;
            let owner = &self.owner;

            let recorded = match self.handler.handle(message).await {
                Ok(()) => self
                    .store
                    .complete_leased(message_id, owner)
                    .await
                    .map(|()| report.completed += 1),
                Err(e) if e.retryable => self
                    .store
                    .fail_leased(message_id, owner, &e.reason, self.max_retries)
                    .await
                    .map(|status| match status {
                        MessageStatus::Failed => report.failed += 1,
                        _ => report.requeued += 1,
                    }),
                Err(e) => self
                    .store
                    .fail_permanently_leased(message_id, owner, &e.reason)
                    .await
                    .map(|()| report.failed += 1),
            };

            match recorded {
                Ok(()) => {}
                Err(Error::LeaseLost { .. }) => {
                    report.lost += 1;
                    tracing::warn!(
                        owner = %owner,
                        message_id = %message_id,
                        "Lease reclaimed by another worker, outcome discarded"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        owner = %owner,
                        message_id = %message_id,
                        error = %e,
                        "Could not record message outcome"
                    );
                }
            }
        }

        if let Some(cutoff) = self
            .completed_retention
            .and_then(|retention| now.checked_sub_signed(retention))
        {
            self.store.purge_completed(cutoff).await?;
        }

        if !report.is_idle() {
            tracing::debug!(owner = %self.owner, ?report, "Poll finished");
        }

        Ok(report)
    }

    /// Delay before the next poll.
    ///
    /// A full batch polls again immediately, other work resets to the base
    /// interval, and idle or failed polls back off exponentially.
    pub fn next_delay(&self, current: Duration, report: Option<&PollReport>) -> Duration {
        match report {
            Some(report) if report.claimed >= self.batch_size as usize => Duration::ZERO,
            Some(report) if !report.is_idle() => self.poll_interval,
            _ => current
                .saturating_mul(2)
                .clamp(self.poll_interval, self.max_poll_interval),
        }
    }

    /// Polls until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(owner = %self.owner, "Consumer started");

        let mut delay = self.poll_interval;

        while !cancel.is_cancelled() {
            let report = match self.poll_once(Utc::now()).await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!(owner = %self.owner, error = %e, "Poll failed");
                    None
                }
            };

            delay = self.next_delay(delay, report.as_ref());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(owner = %self.owner, "Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Handler for Noop {
        fn handle<'a>(
            &'a self,
            _message: &'a Message,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn backoff_doubles_while_idle_and_resets_on_work() {
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").expect("lazy pool");
        let consumer = Consumer::builder()
            .store(QueueStore::new(pool))
            .handler(Noop)
            .owner("worker-test")
            .batch_size(10)
            .poll_interval(Duration::from_millis(100))
            .max_poll_interval(Duration::from_millis(700))
            .build();

        let idle = PollReport::default();
        let mut delay = Duration::from_millis(100);
        delay = consumer.next_delay(delay, Some(&idle));
        assert_eq!(delay, Duration::from_millis(200));
        delay = consumer.next_delay(delay, None);
        assert_eq!(delay, Duration::from_millis(400));
        delay = consumer.next_delay(delay, Some(&idle));
        assert_eq!(delay, Duration::from_millis(700));

        let some_work = PollReport {
            claimed: 3,
            ..Default::default()
        };
        assert_eq!(
            consumer.next_delay(delay, Some(&some_work)),
            Duration::from_millis(100)
        );

        let full_batch = PollReport {
            claimed: 10,
            ..Default::default()
        };
        assert_eq!(consumer.next_delay(delay, Some(&full_batch)), Duration::ZERO);
        assert_eq!(consumer.owner(), "worker-test");
    }
}
