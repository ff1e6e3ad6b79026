mod common;

use std::sync::Arc;

use casequeue::{
    config::SendMode,
    dispatch::{ChunkEnvelope, ChunkState, UpdateBatch},
    error::Error,
    message::MessageStatus,
    service::Service,
    transport::{
        memory::{InMemoryTransport, InjectedFailure},
        Transport,
    },
};
use common::{config_in, setup_with};
use serde_json::json;

fn cases(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("CASE-{i:05}")).collect()
}

fn broker_only(transport: &InMemoryTransport) -> Option<Arc<dyn Transport>> {
    Some(Arc::new(transport.clone()))
}

#[tokio::test]
async fn test_failed_chunk_does_not_stop_the_batch() {
    let transport = InMemoryTransport::new();
    transport.fail_with("batch-1:1", InjectedFailure::Unknown("broker down".into()));

    let service = setup_with(
        |mut config| {
            config.queue_enabled = Some(false);
            config
        },
        broker_only(&transport),
    )
    .await;
    assert_eq!(service.dispatcher().route_name(), "broker");

    let batch = UpdateBatch::new(cases(1200), json!({"status": "closed"})).with_batch_id("batch-1");
    let outcome = service.dispatcher().send_batch(&batch, 500).await.unwrap();

    assert_eq!(outcome.batch_id, "batch-1");
    assert_eq!(outcome.success_count, 2);
    assert!(!outcome.is_complete());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].chunk_index, 1);
    assert_eq!(outcome.errors[0].message_id, "batch-1:1");
    assert!(outcome.errors[0].retryable);

    assert_eq!(
        outcome.chunks.iter().map(|c| c.state).collect::<Vec<_>>(),
        vec![ChunkState::Sent, ChunkState::Errored, ChunkState::Sent]
    );
    assert_eq!(
        outcome.chunks.iter().map(|c| c.item_count).collect::<Vec<_>>(),
        vec![500, 500, 200]
    );

    assert_eq!(transport.delivered_count(), 2);
    assert!(transport.delivered("batch-1:1").is_none());

    let last = transport.delivered("batch-1:2").unwrap();
    assert_eq!(last.attributes.get("ChunkIndex").map(String::as_str), Some("2"));
    assert_eq!(last.attributes.get("ChunkCount").map(String::as_str), Some("3"));

    let envelope: ChunkEnvelope = serde_json::from_str(&last.body).unwrap();
    assert_eq!(envelope.case_references.len(), 200);
    assert_eq!(envelope.case_references[0], "CASE-01000");
    assert_eq!(envelope.update, json!({"status": "closed"}));

    // Nothing went through the fallback queue.
    assert_eq!(service.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_async_send_mode_reports_timeouts() {
    let transport = InMemoryTransport::new();
    transport.fail_with("batch-2:0", InjectedFailure::Timeout);

    let service = setup_with(
        |mut config| {
            config.queue_enabled = Some(false);
            config.send_mode = Some(SendMode::Async);
            config
        },
        broker_only(&transport),
    )
    .await;

    let batch = UpdateBatch::new(cases(10), json!({})).with_batch_id("batch-2");
    let outcome = service.dispatcher().send_batch(&batch, 4).await.unwrap();

    assert_eq!(outcome.chunks.len(), 3);
    assert_eq!(outcome.success_count, 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].chunk_index, 0);
    assert!(outcome.errors[0].retryable);
    assert_eq!(transport.delivered_count(), 2);
}

#[tokio::test]
async fn test_queue_route_persists_chunks() {
    let service = setup_with(|config| config, None).await;
    assert_eq!(service.dispatcher().route_name(), "queue");

    let batch = UpdateBatch::new(cases(1200), json!({"owner": "team-a"})).with_batch_id("batch-3");
    let outcome = service.dispatcher().send_batch(&batch, 500).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.success_count, 3);
    assert!(outcome
        .chunks
        .iter()
        .all(|chunk| chunk.state == ChunkState::Queued));

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.pending, 3);

    let message = service.get_message("batch-3:1").await.unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    let envelope: ChunkEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.batch_id, "batch-3");
    assert_eq!(envelope.chunk_index, 1);
    assert_eq!(envelope.chunk_count, 3);
    assert_eq!(envelope.case_references.len(), 500);
}

#[tokio::test]
async fn test_resubmitted_batch_is_not_queued_twice() {
    let service = setup_with(|config| config, None).await;
    let batch = UpdateBatch::new(cases(7), json!({})).with_batch_id("batch-4");

    let first = service.dispatcher().send_batch(&batch, 5).await.unwrap();
    let second = service.dispatcher().send_batch(&batch, 5).await.unwrap();

    assert_eq!(first.success_count, 2);
    assert_eq!(second.success_count, 2);
    assert!(second.is_complete());
    assert_eq!(service.stats().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_batch_without_id_gets_one() {
    let service = setup_with(|config| config, None).await;

    let outcome = service
        .dispatch(&UpdateBatch::new(cases(3), json!({})))
        .await
        .unwrap();

    assert!(!outcome.batch_id.is_empty());
    assert_eq!(outcome.chunks[0].message_id, format!("{}:0", outcome.batch_id));
}

#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let service = setup_with(|config| config, None).await;

    let outcome = service
        .dispatch(&UpdateBatch::new(Vec::new(), json!({})).with_batch_id("empty"))
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 0);
    assert!(outcome.chunks.is_empty());
    assert!(outcome.is_complete());
    assert_eq!(service.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_dispatch_uses_configured_chunk_size() {
    let service = setup_with(
        |mut config| {
            config.chunk_size = Some(2);
            config
        },
        None,
    )
    .await;

    let outcome = service
        .dispatch(&UpdateBatch::new(cases(5), json!({})).with_batch_id("small"))
        .await
        .unwrap();

    assert_eq!(outcome.chunks.len(), 3);
    assert_eq!(service.stats().await.unwrap().pending, 3);
}

#[tokio::test]
async fn test_invalid_batches_are_rejected() {
    let service = setup_with(|config| config, None).await;

    let err = service
        .dispatcher()
        .send_batch(&UpdateBatch::new(cases(3), json!({})), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    let err = service
        .dispatch(&UpdateBatch::new(
            vec!["CASE-1".to_owned(), "  ".to_owned()],
            json!({}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
    assert_eq!(service.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_broker_route_requires_a_transport() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut config = config_in(&tmpdir);
    config.queue_enabled = Some(false);

    let err = Service::connect_with()
        .config(config)
        .call()
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Configuration { .. }));
}
