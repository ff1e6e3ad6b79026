//! In-memory broker.
//!
//! Records every delivered message in a concurrent map keyed by idempotency
//! key, so redelivery of the same key overwrites rather than duplicates.
//! Failures can be injected per key. Intended for tests and local runs.

use std::{future::Future, pin::Pin, sync::Arc};

use super::{OutboundMessage, Transport, TransportError};

/// Failure to simulate for a given idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Report a connection timeout straight away
    Timeout,
    /// Never answer; the sender's timeout has to fire
    Hang,
    /// Fail with an unclassified broker error
    Unknown(String),
}

#[derive(Clone, Default)]
pub struct InMemoryTransport {
    delivered: Arc<papaya::HashMap<String, OutboundMessage>>,
    failures: Arc<papaya::HashMap<String, InjectedFailure>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send of `message_id` fail with `failure`.
    pub fn fail_with(&self, message_id: impl Into<String>, failure: InjectedFailure) {
        self.failures.pin().insert(message_id.into(), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.pin().clear();
    }

    pub fn delivered(&self, message_id: &str) -> Option<OutboundMessage> {
        self.delivered.pin().get(message_id).cloned()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.pin().len()
    }
}

impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn deliver<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let failure = self.failures.pin().get(&message.message_id).cloned();

            match failure {
                Some(InjectedFailure::Timeout) => Err(TransportError::ConnectionTimeout {
                    message_id: message.message_id.clone(),
                }),
                Some(InjectedFailure::Hang) => {
                    std::future::pending::<Result<(), TransportError>>().await
                }
                Some(InjectedFailure::Unknown(reason)) => Err(TransportError::unknown(reason)),
                None => {
                    self.delivered
                        .pin()
                        .insert(message.message_id.clone(), message.clone());
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::Sender;

    fn sender(transport: &InMemoryTransport) -> Sender {
        Sender::new(Arc::new(transport.clone()), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn invalid_messages_never_reach_the_broker() {
        let transport = InMemoryTransport::new();
        let sender = sender(&transport);

        let err = sender
            .send(&OutboundMessage::new("", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage { .. }));

        let err = sender
            .send_async(OutboundMessage::new("batch:0", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage { .. }));

        assert_eq!(transport.delivered_count(), 0);
    }

    #[tokio::test]
    async fn hung_broker_surfaces_as_timeout() {
        let transport = InMemoryTransport::new();
        transport.fail_with("batch:0", InjectedFailure::Hang);
        let sender = sender(&transport);

        let err = sender
            .send(&OutboundMessage::new("batch:0", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionTimeout { .. }));
        assert!(err.is_retryable());

        let err = sender
            .send_async(OutboundMessage::new("batch:0", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionTimeout { .. }));
    }

    #[tokio::test]
    async fn async_send_delivers() {
        let transport = InMemoryTransport::new();
        let sender = sender(&transport);

        let pending = sender.send_async(OutboundMessage::new("batch:1", "{\"a\":1}"));
        pending.await.unwrap();

        assert_eq!(
            transport.delivered("batch:1").map(|m| m.body),
            Some("{\"a\":1}".to_owned())
        );
    }

    #[tokio::test]
    async fn injected_failures_can_be_cleared() {
        let transport = InMemoryTransport::new();
        transport.fail_with("batch:2", InjectedFailure::Unknown("broker down".to_owned()));
        let sender = sender(&transport);
        let message = OutboundMessage::new("batch:2", "{}");

        assert!(sender.send(&message).await.is_err());

        transport.clear_failures();
        sender.send(&message).await.unwrap();
        assert_eq!(transport.delivered_count(), 1);
    }
}
