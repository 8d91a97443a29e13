// tests/scenario_pipeline.rs
//
// End-to-end walk of the pipeline with fingerprints {A, B, A}: the store
// keeps {A, B}, the filter approves A and rejects B, the newsletter
// carries only A, and B never appears in any issue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use civic_digest::compose::Composer;
use civic_digest::config::FeaturedRule;
use civic_digest::deliver::{
    CampaignProvider, DeliveryGateway, MockCampaignProvider, MockPreviewSender, PreviewSender,
};
use civic_digest::error::PipelineError;
use civic_digest::filter::client::{DynReasoningClient, MockReasoningClient};
use civic_digest::filter::FilterEngine;
use civic_digest::ingest::adapters::{FixtureAdapter, SourceAdapter};
use civic_digest::model::{ContentState, NewsletterStatus, RawItem, SourceType};
use civic_digest::retry::RetryPolicy;
use civic_digest::scheduler::{Orchestrator, SchedulerCfg};
use civic_digest::store::Store;

fn raw(slug: &str, title: &str) -> RawItem {
    RawItem {
        source_type: SourceType::News,
        source_name: "County Courier".into(),
        url: format!("https://courier.test/{slug}"),
        title: title.into(),
        body: format!("{title}, with all the details."),
        published_at: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn scrape_filter_compose_approve_send_with_duplicate_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("pipeline.json")).unwrap());

    // A appears twice (re-scrape), B once.
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(FixtureAdapter::new(
        "County Courier",
        SourceType::News,
        vec![
            raw("fair", "Fall fair announced"),
            raw("wreck", "Two-car wreck on Route 5"),
            raw("fair", "Fall fair announced"),
        ],
    ))];

    // Approve the fair, reject the wreck.
    let reasoning: DynReasoningClient = Arc::new(MockReasoningClient::with_fn(|prompt| {
        if prompt.contains("Fall fair announced") {
            Ok(r#"{"decision": "approve", "rationale": "community event", "confidence": 0.9}"#.into())
        } else {
            Ok(r#"{"decision": "reject", "rationale": "accident report", "confidence": 0.95}"#.into())
        }
    }));

    let provider = Arc::new(MockCampaignProvider::new());
    let preview = Arc::new(MockPreviewSender::new());
    let orch = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        FilterEngine::new(Arc::clone(&reasoning), RetryPolicy::once(), Duration::from_secs(5)),
        Composer::new(
            Arc::clone(&reasoning),
            FeaturedRule::HighestConfidence,
            RetryPolicy::once(),
            Duration::from_secs(5),
        ),
        DeliveryGateway::new(Arc::clone(&provider) as Arc<dyn CampaignProvider>, RetryPolicy::once()),
        Arc::clone(&preview) as Arc<dyn PreviewSender>,
        adapters,
        SchedulerCfg {
            scrape_every: Duration::from_secs(6 * 3600),
            filter_every: Duration::from_secs(6 * 3600),
            filter_initial_delay: Duration::from_secs(1800),
            compose_every: Duration::from_secs(168 * 3600),
            send_check_every: Duration::from_secs(300),
            grace: chrono::Duration::minutes(120),
            auto_send_after_preview: true,
            lookback: chrono::Duration::days(7),
            filter_batch_size: 100,
        },
    ));

    // Scrape: {A, B, A} collapses to {A, B}.
    let scrape = orch.trigger_scrape().await.into_completed().unwrap();
    assert_eq!(scrape.items_new, 2);
    assert_eq!(scrape.items_duplicate, 1);

    // Filter: A approved, B rejected.
    let filter = orch.trigger_filter().await.into_completed().unwrap();
    assert_eq!(filter.approved, 1);
    assert_eq!(filter.rejected, 1);
    assert_eq!(filter.errored, 0);

    // Compose and preview.
    let newsletter = orch.trigger_compose().await.into_completed().unwrap().unwrap();
    assert_eq!(newsletter.status, NewsletterStatus::PendingApproval);
    assert_eq!(newsletter.content_ids.len(), 1);
    let a = store.get_content(newsletter.content_ids[0]).unwrap();
    assert_eq!(a.title, "Fall fair announced");

    // B stays rejected and outside every newsletter, forever.
    let b = store
        .list_content(ContentState::FilteredRejected, 10)
        .into_iter()
        .next()
        .expect("rejected item present");
    assert!(b.title.contains("wreck"));
    assert!(!newsletter.content_ids.contains(&b.id));

    // Grace elapses; the issue auto-approves and goes out once.
    tokio::time::sleep(Duration::from_secs(121 * 60)).await;
    let sent = store.get_newsletter(newsletter.id).unwrap();
    assert_eq!(sent.status, NewsletterStatus::Sent);
    assert_eq!(provider.sent.lock().unwrap().len(), 1);
    assert_eq!(store.get_content(a.id).unwrap().state, ContentState::Used);
    assert_eq!(store.get_content(b.id).unwrap().state, ContentState::FilteredRejected);

    // With A consumed and B rejected, the next window has nothing to say.
    match orch.trigger_compose().await.into_completed().unwrap() {
        Err(PipelineError::InsufficientContent(_)) => {}
        other => panic!("expected insufficient content, got {other:?}"),
    }
}
