//! Batch dispatch.
//!
//! A business batch ("apply this update to these cases") is split into
//! chunks, each chunk becomes one [`OutboundMessage`], and every message is
//! handed to the [`Route`] chosen when the dispatcher was built. A failed
//! chunk is recorded and the remaining chunks still go out; the dispatcher
//! never retries.

use std::{future::Future, pin::Pin, sync::Arc};

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, SendMode},
    error::Error,
    store::QueueStore,
    transport::{OutboundMessage, Sender, Transport, TransportError},
};

/// One update to apply to a set of cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    /// Stable id for the batch. Re-submitting a batch under the same id
    /// reuses the same chunk idempotency keys.
    #[serde(default)]
    pub batch_id: Option<String>,
    pub case_references: Vec<String>,
    pub update: serde_json::Value,
}

impl UpdateBatch {
    pub fn new(case_references: Vec<String>, update: serde_json::Value) -> Self {
        Self {
            batch_id: None,
            case_references,
            update,
        }
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Body of a chunk message, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    pub batch_id: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub case_references: Vec<String>,
    pub update: serde_json::Value,
}

/// Idempotency key of a chunk.
pub fn chunk_message_id(batch_id: &str, chunk_index: usize) -> String {
    format!("{batch_id}:{chunk_index}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChunkState {
    Created,
    /// Accepted by the broker
    Sent,
    /// Persisted in the fallback queue
    Queued,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub message_id: String,
    pub item_count: usize,
    pub state: ChunkState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkError {
    pub chunk_index: usize,
    pub message_id: String,
    pub reason: String,
    /// Whether resubmitting the chunk could succeed
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: String,
    /// Chunks handed off to the broker or the fallback queue
    pub success_count: usize,
    pub errors: Vec<ChunkError>,
    pub chunks: Vec<ChunkOutcome>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Why a route could not take a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOffError {
    pub reason: String,
    pub retryable: bool,
}

impl From<TransportError> for HandOffError {
    fn from(e: TransportError) -> Self {
        Self {
            retryable: e.is_retryable(),
            reason: e.to_string(),
        }
    }
}

impl From<Error> for HandOffError {
    fn from(e: Error) -> Self {
        Self {
            retryable: true,
            reason: e.to_string(),
        }
    }
}

/// Where chunks go. Chosen once, when the dispatcher is built.
pub trait Route: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Hands one chunk message off, returning its resulting state.
    fn hand_off<'a>(
        &'a self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkState, HandOffError>> + Send + 'a>>;
}

/// Sends chunks straight to the broker.
pub struct BrokerRoute {
    sender: Sender,
    mode: SendMode,
}

impl BrokerRoute {
    pub fn new(sender: Sender, mode: SendMode) -> Self {
        Self { sender, mode }
    }
}

impl Route for BrokerRoute {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn hand_off<'a>(
        &'a self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkState, HandOffError>> + Send + 'a>> {
        Box::pin(async move {
            match self.mode {
                SendMode::Blocking => self.sender.send(&message).await?,
                SendMode::Async => self.sender.send_async(message).await?,
            }
            Ok(ChunkState::Sent)
        })
    }
}

/// Persists chunks into the fallback queue.
pub struct QueueRoute {
    store: QueueStore,
}

impl QueueRoute {
    pub fn new(store: QueueStore) -> Self {
        Self { store }
    }
}

impl Route for QueueRoute {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn hand_off<'a>(
        &'a self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkState, HandOffError>> + Send + 'a>> {
        Box::pin(async move {
            message.validate()?;

            match self.store.enqueue(&message.message_id, &message.body).await {
                Ok(_) | Err(Error::DuplicateMessage { .. }) => Ok(ChunkState::Queued),
                Err(e) => Err(e.into()),
            }
        })
    }
}

pub struct Dispatcher {
    route: Arc<dyn Route>,
    concurrency: usize,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(route: Arc<dyn Route>, #[builder(default = 4)] concurrency: usize) -> Self {
        Self {
            route,
            concurrency: concurrency.max(1),
        }
    }
}

impl Dispatcher {
    /// Picks the route from configuration.
    ///
    /// With the fallback queue disabled a broker transport is required;
    /// without one the dispatcher refuses to start rather than dropping
    /// batches.
    pub fn from_config(
        config: &Config,
        store: QueueStore,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self, Error> {
        let route: Arc<dyn Route> = match (config.queue_enabled(), transport) {
            (true, _) => Arc::new(QueueRoute::new(store)),
            (false, Some(transport)) => Arc::new(BrokerRoute::new(
                Sender::new(transport, config.send_timeout()),
                config.send_mode(),
            )),
            (false, None) => {
                return Err(Error::configuration(
                    "fallback queue is disabled and no broker transport is configured",
                ))
            }
        };

        tracing::info!(route = route.name(), "Dispatcher ready");

        Ok(Self::builder()
            .route(route)
            .concurrency(config.dispatch_concurrency())
            .build())
    }

    pub fn route_name(&self) -> &'static str {
        self.route.name()
    }

    /// Splits `batch` into chunks of `chunk_size` case references and hands
    /// each chunk off.
    ///
    /// Per-chunk failures are reported in [`BatchOutcome::errors`]; only a
    /// zero chunk size is an error for the whole call.
    pub async fn send_batch(
        &self,
        batch: &UpdateBatch,
        chunk_size: usize,
    ) -> Result<BatchOutcome, Error> {
        if chunk_size == 0 {
            return Err(Error::configuration("chunk size must be greater than zero"));
        }

        let batch_id = batch
            .batch_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let chunk_count = batch.case_references.len().div_ceil(chunk_size);

        let prepared = batch
            .case_references
            .chunks(chunk_size)
            .enumerate()
            .map(|(chunk_index, cases)| {
                let message_id = chunk_message_id(&batch_id, chunk_index);
                let envelope = ChunkEnvelope {
                    batch_id: batch_id.clone(),
                    chunk_index,
                    chunk_count,
                    case_references: cases.to_vec(),
                    update: batch.update.clone(),
                };
                let message = serde_json::to_string(&envelope).map(|body| {
                    OutboundMessage::new(message_id.clone(), body)
                        .with_attribute("BatchId", batch_id.clone())
                        .with_attribute("ChunkIndex", chunk_index.to_string())
                        .with_attribute("ChunkCount", chunk_count.to_string())
                });
                (chunk_index, message_id, cases.len(), message)
            })
            .collect::<Vec<_>>();

        let route = self.route.as_ref();

        let results: Vec<(ChunkOutcome, Option<ChunkError>)> = futures_util::stream::iter(prepared)
            .map(|(chunk_index, message_id, item_count, message)| async move {
                let res = match message {
                    Ok(message) => route.hand_off(message).await,
                    Err(e) => Err(HandOffError {
                        reason: format!("serializing chunk: {e}"),
                        retryable: false,
                    }),
                };

                match res {
                    Ok(state) => (
                        ChunkOutcome {
                            chunk_index,
                            message_id,
                            item_count,
                            state,
                        },
                        None,
                    ),
                    Err(HandOffError { reason, retryable }) => {
                        tracing::warn!(
                            chunk_index,
                            message_id = %message_id,
                            retryable,
                            reason = %reason,
                            "Chunk hand-off failed"
                        );
                        (
                            ChunkOutcome {
                                chunk_index,
                                message_id: message_id.clone(),
                                item_count,
                                state: ChunkState::Errored,
                            },
                            Some(ChunkError {
                                chunk_index,
                                message_id,
                                reason,
                                retryable,
                            }),
                        )
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let (chunks, errors): (Vec<_>, Vec<_>) = results.into_iter().unzip();
        let errors: Vec<ChunkError> = errors.into_iter().flatten().collect();
        let success_count = chunks.len() - errors.len();

        if errors.is_empty() {
            tracing::info!(
                batch_id = %batch_id,
                route = route.name(),
                chunks = chunk_count,
                "Batch dispatched"
            );
        } else {
            tracing::warn!(
                batch_id = %batch_id,
                route = route.name(),
                chunks = chunk_count,
                succeeded = success_count,
                failed = errors.len(),
                "Batch partially dispatched"
            );
        }

        Ok(BatchOutcome {
            batch_id,
            success_count,
            errors,
            chunks,
        })
    }
}
