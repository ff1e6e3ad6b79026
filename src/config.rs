use std::net::SocketAddr;

use chrono::TimeDelta;
use serde::Deserialize;
use url::Url;

use crate::error::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How the broker route hands chunks to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SendMode {
    /// Await each send before reporting the chunk
    #[default]
    Blocking,
    /// Spawn sends and collect their completions
    Async,
}

/// Runtime configuration, read from `CASEQUEUE_`-prefixed environment
/// variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Persist chunks into the fallback queue instead of sending them to the
    /// broker.
    pub queue_enabled: Option<bool>,
    pub chunk_size: Option<usize>,
    pub dispatch_concurrency: Option<usize>,
    pub send_mode: Option<SendMode>,
    pub send_timeout_secs: Option<u64>,

    pub lease_duration_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub consumer_enabled: Option<bool>,
    pub poll_batch_size: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub max_poll_interval_ms: Option<u64>,
    pub completed_retention_secs: Option<u64>,

    pub broker_queue_url: Option<Url>,
    pub broker_endpoint: Option<Url>,
    pub broker_region: Option<String>,

    pub bind_addr: Option<SocketAddr>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("CASEQUEUE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("casequeue.db")
    }

    pub fn queue_enabled(&self) -> bool {
        self.queue_enabled.unwrap_or(true)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn dispatch_concurrency(&self) -> usize {
        self.dispatch_concurrency.unwrap_or(4).max(1)
    }

    pub fn send_mode(&self) -> SendMode {
        self.send_mode.unwrap_or_default()
    }

    pub fn send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.send_timeout_secs.unwrap_or(30))
    }

    pub fn lease_duration(&self) -> Result<TimeDelta, Error> {
        seconds(
            "lease_duration_secs",
            self.lease_duration_secs.unwrap_or(DEFAULT_LEASE_DURATION_SECS),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn consumer_enabled(&self) -> bool {
        self.consumer_enabled.unwrap_or(true)
    }

    pub fn poll_batch_size(&self) -> u32 {
        self.poll_batch_size.unwrap_or(10).max(1)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.unwrap_or(1_000))
    }

    pub fn max_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_poll_interval_ms.unwrap_or(30_000))
            .max(self.poll_interval())
    }

    /// How long completed messages are kept; `None` keeps them forever.
    pub fn completed_retention(&self) -> Result<Option<TimeDelta>, Error> {
        self.completed_retention_secs
            .map(|secs| seconds("completed_retention_secs", secs))
            .transpose()
    }

    /// Checks the settings that can be out of range.
    pub fn validate(&self) -> Result<(), Error> {
        self.lease_duration()?;
        self.completed_retention()?;
        Ok(())
    }

    pub fn broker_queue_url(&self) -> Option<&Url> {
        self.broker_queue_url.as_ref()
    }

    pub fn broker_endpoint(&self) -> Option<&Url> {
        self.broker_endpoint.as_ref()
    }

    pub fn broker_region(&self) -> Option<&str> {
        self.broker_region.as_deref()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

fn seconds(name: &str, secs: u64) -> Result<TimeDelta, Error> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| Error::configuration(format!("{name} is out of range: {secs}")))
}
