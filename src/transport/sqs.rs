//! Amazon SQS (or any SQS-compatible endpoint) as the broker.

use std::{future::Future, pin::Pin};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::{
    error::{DisplayErrorContext, SdkError},
    operation::send_message::SendMessageError,
    types::MessageAttributeValue,
};
use url::Url;

use crate::config::Config;

use super::{OutboundMessage, Transport, TransportError, IDEMPOTENCY_ATTRIBUTE};

pub struct SqsTransport {
    client: aws_sdk_sqs::Client,
    queue_url: Url,
}

impl SqsTransport {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: Url) -> Self {
        Self { client, queue_url }
    }

    /// Builds a transport from the broker settings, if a queue URL is
    /// configured. Credentials come from the default AWS provider chain.
    pub async fn from_config(config: &Config) -> Option<Self> {
        let queue_url = config.broker_queue_url()?.clone();

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.broker_region() {
            loader = loader.region(Region::new(region.to_owned()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_sqs::config::Builder::from(&shared);
        if let Some(endpoint) = config.broker_endpoint() {
            builder = builder.endpoint_url(endpoint.as_str());
        }

        tracing::info!(queue_url = %queue_url, "Using SQS broker transport");

        Some(Self::new(
            aws_sdk_sqs::Client::from_conf(builder.build()),
            queue_url,
        ))
    }

    pub fn queue_url(&self) -> &Url {
        &self.queue_url
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, TransportError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| TransportError::Unknown {
            message: format!("building message attribute: {e}"),
            source: Some(e.into()),
        })
}

fn classify<R>(message_id: &str, err: SdkError<SendMessageError, R>) -> TransportError
where
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => TransportError::ConnectionTimeout {
            message_id: message_id.to_owned(),
        },
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            TransportError::ConnectionTimeout {
                message_id: message_id.to_owned(),
            }
        }
        SdkError::ServiceError(service) if service.err().is_invalid_message_contents() => {
            TransportError::InvalidMessage {
                reason: format!("broker rejected {message_id}: {}", DisplayErrorContext(&err)),
            }
        }
        _ => TransportError::Unknown {
            message: DisplayErrorContext(&err).to_string(),
            source: None,
        },
    }
}

/// Checks the MD5 of the body echoed back by the broker, when there is one.
fn verify_digest(message: &OutboundMessage, echoed: Option<&str>) -> Result<(), TransportError> {
    let digest = hex::encode(md5::compute(&message.body).0);
    match echoed {
        Some(echoed) if echoed != digest => Err(TransportError::unknown(format!(
            "body digest mismatch for {}: sent {digest}, broker saw {echoed}",
            message.message_id
        ))),
        _ => Ok(()),
    }
}

impl Transport for SqsTransport {
    fn name(&self) -> &'static str {
        "sqs"
    }

    fn deliver<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let mut request = self
                .client
                .send_message()
                .queue_url(self.queue_url.as_str())
                .message_body(&message.body)
                .message_attributes(IDEMPOTENCY_ATTRIBUTE, string_attribute(&message.message_id)?);

            for (key, value) in &message.attributes {
                request = request.message_attributes(key, string_attribute(value)?);
            }

            let output = request
                .send()
                .await
                .map_err(|e| classify(&message.message_id, e))?;

            verify_digest(message, output.md5_of_message_body())
        })
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_sqs::types::error::InvalidMessageContents;
    use aws_smithy_runtime_api::client::result::ConnectorError;

    use super::*;

    type SendError = SdkError<SendMessageError, ()>;

    #[test]
    fn timeouts_are_connection_timeouts() {
        let err = classify("batch:0", SendError::timeout_error("operation timed out"));
        assert!(matches!(
            err,
            TransportError::ConnectionTimeout { ref message_id } if message_id == "batch:0"
        ));

        let err = classify(
            "batch:1",
            SendError::dispatch_failure(ConnectorError::timeout("connect timed out".into())),
        );
        assert!(matches!(err, TransportError::ConnectionTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn rejected_contents_are_invalid_messages() {
        let rejected = SendMessageError::InvalidMessageContents(
            InvalidMessageContents::builder()
                .message("body contains invalid characters")
                .build(),
        );

        let err = classify("batch:0", SendError::service_error(rejected, ()));
        assert!(matches!(err, TransportError::InvalidMessage { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_failures_are_unknown() {
        let err = classify(
            "batch:0",
            SendError::dispatch_failure(ConnectorError::io("connection reset".into())),
        );
        assert!(matches!(err, TransportError::Unknown { .. }));
        assert!(err.is_retryable());

        let err = classify("batch:0", SendError::construction_failure("missing queue url"));
        assert!(matches!(err, TransportError::Unknown { .. }));
    }

    #[test]
    fn digest_mismatch_is_unknown() {
        let message = OutboundMessage::new("batch:0", "{\"cases\":[]}");
        let digest = hex::encode(md5::compute(&message.body).0);

        assert!(verify_digest(&message, Some(&digest)).is_ok());
        assert!(verify_digest(&message, None).is_ok());

        let err = verify_digest(&message, Some("d41d8cd98f00b204e9800998ecf8427e")).unwrap_err();
        assert!(matches!(err, TransportError::Unknown { .. }));
    }
}
