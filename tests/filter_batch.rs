// tests/filter_batch.rs
//
// Batch filtering resilience: per-item failures are isolated, failed
// items stay `scraped` for a later retry, and nothing is rejected just
// because the provider misbehaved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use civic_digest::filter::client::MockReasoningClient;
use civic_digest::filter::FilterEngine;
use civic_digest::model::{ContentState, RawItem, SourceType};
use civic_digest::retry::RetryPolicy;
use civic_digest::store::Store;

const APPROVE: &str = r#"{"decision": "approve", "rationale": "community content", "confidence": 0.8}"#;
const REJECT: &str = r#"{"decision": "reject", "rationale": "crime report", "confidence": 0.9}"#;

fn seed(store: &Store, n: usize) {
    for i in 1..=n {
        store
            .ingest(RawItem {
                source_type: SourceType::News,
                source_name: "County Courier".into(),
                url: format!("https://courier.test/{i}"),
                title: format!("Item {i}"),
                body: "Body text.".into(),
                published_at: Utc::now(),
            })
            .unwrap();
    }
}

fn engine(client: MockReasoningClient) -> FilterEngine {
    FilterEngine::new(Arc::new(client), RetryPolicy::once(), Duration::from_secs(5))
}

#[tokio::test]
async fn one_malformed_reply_in_a_ten_item_batch_leaves_nine_verdicts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    seed(&store, 10);

    let client = MockReasoningClient::with_fn(|prompt| {
        if prompt.contains("Title: Item 7\n") {
            Ok("I would say this looks pretty good!".into()) // no decision token
        } else {
            Ok(APPROVE.into())
        }
    });

    let report = engine(client).filter_pending(&store, 100).await;
    assert_eq!(report.approved, 9);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.errored, 1);

    // The failed item is back on the queue, still scraped.
    let remaining = store.list_unfiltered(100);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].title, "Item 7");
    assert_eq!(remaining[0].state, ContentState::Scraped);
}

#[tokio::test]
async fn provider_outage_keeps_the_whole_batch_scraped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    seed(&store, 3);

    let client = MockReasoningClient::with_fn(|_| anyhow::bail!("503 from provider"));
    let report = engine(client).filter_pending(&store, 100).await;
    assert_eq!(report.errored, 3);
    assert_eq!(store.stats().content_scraped, 3);
    // Claims were released, so the next run sees all three again.
    assert_eq!(store.list_unfiltered(100).len(), 3);
}

#[tokio::test]
async fn mixed_decisions_are_counted_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    seed(&store, 4);

    let client = MockReasoningClient::with_fn(|prompt| {
        if prompt.contains("Title: Item 2\n") || prompt.contains("Title: Item 4\n") {
            Ok(REJECT.into())
        } else {
            Ok(APPROVE.into())
        }
    });

    let report = engine(client).filter_pending(&store, 100).await;
    assert_eq!(report.approved, 2);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.errored, 0);

    let stats = store.stats();
    assert_eq!(stats.content_approved, 2);
    assert_eq!(stats.content_rejected, 2);
    assert_eq!(stats.content_scraped, 0);
}

#[tokio::test]
async fn batch_size_limits_the_work_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    seed(&store, 5);

    let report = engine(MockReasoningClient::fixed(APPROVE)).filter_pending(&store, 2).await;
    assert_eq!(report.approved, 2);
    assert_eq!(store.stats().content_scraped, 3);
}
