//! Broker transport abstraction.
//!
//! A [`Transport`] is the raw broker client. [`Sender`] wraps one and adds
//! validation, a send timeout, and the blocking/spawned send variants, so the
//! dispatcher only ever sees a [`TransportError`] classified by retryability.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod memory;
pub mod sqs;

/// Message attribute carrying the idempotency key on the wire.
pub const IDEMPOTENCY_ATTRIBUTE: &str = "MessageId";

/// Classified failure of a broker send.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Malformed message; never sent, never retried
    #[snafu(display("Invalid message: {reason}"))]
    InvalidMessage { reason: String },

    #[snafu(display("Connection timed out sending {message_id}"))]
    ConnectionTimeout { message_id: String },

    #[snafu(display("Transport failure: {message}"))]
    Unknown {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl TransportError {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            source: None,
        }
    }

    /// Timeouts and unclassified failures may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidMessage { .. })
    }
}

/// A transport-ready message: one chunk of a business batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Idempotency key used by consumers to deduplicate redelivery
    pub message_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.message_id.trim().is_empty() {
            return Err(TransportError::InvalidMessage {
                reason: "missing message id".to_owned(),
            });
        }
        if self.body.is_empty() {
            return Err(TransportError::InvalidMessage {
                reason: format!("message {} has an empty body", self.message_id),
            });
        }
        Ok(())
    }
}

/// An external message broker.
///
/// Implementations only deliver; validation and timeouts are applied by
/// [`Sender`] before `deliver` is reached.
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Hands one message to the broker.
    fn deliver<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}

/// Completion of a spawned send.
pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// Validating, time-bounded front for a [`Transport`].
#[derive(Clone)]
pub struct Sender {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Sender {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a message and waits for the broker to accept it.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        message.validate()?;
        deliver_within(self.transport.as_ref(), message, self.timeout).await
    }

    /// Starts a send on the runtime and returns its completion.
    ///
    /// The send is already in flight when this returns; the future only
    /// reports the outcome. Must be called from within a tokio runtime.
    pub fn send_async(&self, message: OutboundMessage) -> SendFuture {
        if let Err(e) = message.validate() {
            return Box::pin(std::future::ready(Err(e)));
        }

        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            deliver_within(transport.as_ref(), &message, timeout).await
        });

        Box::pin(async move {
            match handle.await {
                Ok(res) => res,
                Err(e) => Err(TransportError::Unknown {
                    message: format!("send task failed: {e}"),
                    source: None,
                }),
            }
        })
    }
}

async fn deliver_within(
    transport: &dyn Transport,
    message: &OutboundMessage,
    timeout: Duration,
) -> Result<(), TransportError> {
    let res = match tokio::time::timeout(timeout, transport.deliver(message)).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::ConnectionTimeout {
            message_id: message.message_id.clone(),
        }),
    };

    match &res {
        Ok(()) => tracing::debug!(
            transport = transport.name(),
            message_id = %message.message_id,
            "Message sent"
        ),
        Err(e) => tracing::warn!(
            transport = transport.name(),
            message_id = %message.message_id,
            retryable = e.is_retryable(),
            error = %e,
            "Send failed"
        ),
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_missing_key_and_body() {
        assert!(OutboundMessage::new("", "{}").validate().is_err());
        assert!(OutboundMessage::new("  ", "{}").validate().is_err());
        assert!(OutboundMessage::new("batch:0", "").validate().is_err());
        assert!(OutboundMessage::new("batch:0", "{}").validate().is_ok());
    }

    #[test]
    fn retryability() {
        assert!(!TransportError::InvalidMessage {
            reason: "missing message id".to_owned()
        }
        .is_retryable());
        assert!(TransportError::ConnectionTimeout {
            message_id: "m".to_owned()
        }
        .is_retryable());
        assert!(TransportError::unknown("boom").is_retryable());
    }
}
