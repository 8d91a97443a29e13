// tests/delivery_idempotent.rs
//
// Delivery gateway: only approved newsletters go out, a second send
// returns the first receipt instead of a second campaign, and provider
// failure parks the newsletter in `failed` without automatic retry.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use civic_digest::deliver::{CampaignProvider, DeliveryGateway, MockCampaignProvider};
use civic_digest::error::PipelineError;
use civic_digest::model::{
    Decision, FeaturedStory, NewsletterDraft, NewsletterStatus, RawItem, Section, SourceType,
    VerdictDraft,
};
use civic_digest::retry::RetryPolicy;
use civic_digest::store::{IngestOutcome, Store, TransitionStamps};

fn seed_newsletter(store: &Store, status: NewsletterStatus) -> i64 {
    let IngestOutcome::Inserted(item) = store
        .ingest(RawItem {
            source_type: SourceType::News,
            source_name: "Fixture".into(),
            url: "https://fixture.test/story".into(),
            title: "Fall fair announced".into(),
            body: "The fair is back.".into(),
            published_at: Utc::now(),
        })
        .unwrap()
    else {
        panic!("expected insert");
    };
    store
        .record_verdict(
            item.id,
            VerdictDraft {
                decision: Decision::Approve,
                rationale: "good".into(),
                confidence: Some(0.9),
                summary: None,
            },
        )
        .unwrap();

    let n = store
        .create_newsletter(NewsletterDraft {
            cutoff_from: Utc::now() - chrono::Duration::days(7),
            cutoff_to: Utc::now(),
            subject: "This week in the community".into(),
            featured: FeaturedStory {
                content_id: item.id,
                title: item.title.clone(),
                highlight: "The fair is back.".into(),
                ai_generated: false,
            },
            sections: vec![Section { source_type: SourceType::News, content_ids: vec![] }],
            content_ids: vec![item.id],
        })
        .unwrap();

    if status == NewsletterStatus::Draft {
        return n.id;
    }
    store
        .transition_newsletter(
            n.id,
            NewsletterStatus::Draft,
            NewsletterStatus::PendingApproval,
            TransitionStamps { preview_sent_at: Some(Utc::now()), ..Default::default() },
        )
        .unwrap();
    if status == NewsletterStatus::PendingApproval {
        return n.id;
    }
    store
        .transition_newsletter(
            n.id,
            NewsletterStatus::PendingApproval,
            NewsletterStatus::Approved,
            TransitionStamps::default(),
        )
        .unwrap();
    n.id
}

#[tokio::test]
async fn double_send_yields_one_campaign_and_the_same_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    let id = seed_newsletter(&store, NewsletterStatus::Approved);

    let provider = Arc::new(MockCampaignProvider::new());
    let gateway = DeliveryGateway::new(provider.clone() as Arc<dyn CampaignProvider>, RetryPolicy::once());

    let first = gateway.send(&store, id).await.unwrap();
    let second = gateway.send(&store, id).await.unwrap();

    assert_eq!(first.campaign_id, second.campaign_id);
    assert_eq!(provider.created.lock().unwrap().len(), 1);
    assert_eq!(provider.sent.lock().unwrap().len(), 1);
    assert_eq!(store.get_newsletter(id).unwrap().status, NewsletterStatus::Sent);
}

#[tokio::test]
async fn unapproved_newsletter_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    let id = seed_newsletter(&store, NewsletterStatus::PendingApproval);

    let provider = Arc::new(MockCampaignProvider::new());
    let gateway = DeliveryGateway::new(provider.clone() as Arc<dyn CampaignProvider>, RetryPolicy::once());

    let err = gateway.send(&store, id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotApproved(_)));
    assert!(provider.created.lock().unwrap().is_empty());
    assert_eq!(store.get_newsletter(id).unwrap().status, NewsletterStatus::PendingApproval);
}

#[tokio::test]
async fn provider_failure_parks_the_newsletter_in_failed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.json")).unwrap();
    let id = seed_newsletter(&store, NewsletterStatus::Approved);

    let provider = Arc::new(MockCampaignProvider::new());
    provider.fail_sends.store(true, Ordering::SeqCst);
    let gateway = DeliveryGateway::new(provider.clone() as Arc<dyn CampaignProvider>, RetryPolicy::once());

    let err = gateway.send(&store, id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Delivery(_)));

    let n = store.get_newsletter(id).unwrap();
    assert_eq!(n.status, NewsletterStatus::Failed);
    // Campaign was created before the send failed; the id sticks around
    // so a hypothetical manual resend would not duplicate it.
    assert!(n.campaign_id.is_some());
    assert!(provider.sent.lock().unwrap().is_empty());
}
