//! Domain types shared across the pipeline: content items, filter verdicts,
//! newsletters, and the scheduler's durable state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a piece of content was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    News,
    Government,
    Social,
}

impl SourceType {
    /// Section order in the newsletter digest.
    pub const ALL: [SourceType; 3] = [SourceType::News, SourceType::Government, SourceType::Social];

    pub fn label(&self) -> &'static str {
        match self {
            SourceType::News => "Local News",
            SourceType::Government => "Government & Civic",
            SourceType::Social => "Around the Community",
        }
    }
}

/// Content item lifecycle. Advances monotonically, never reverts:
/// `scraped` → `filtered_approved`/`filtered_rejected`, and `used` only
/// from `filtered_approved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentState {
    Scraped,
    FilteredApproved,
    FilteredRejected,
    Used,
}

/// Raw tuple produced by a scraper adapter. `url` is stable across
/// re-scrapes, which is what makes fingerprinting work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_type: SourceType,
    pub source_name: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub source_type: SourceType,
    pub source_name: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    /// SHA-256 over normalized URL + title; unique across stored items.
    pub fingerprint: String,
    pub state: ContentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// What the filter engine produces for one item; the store stamps
/// `filtered_at` when recording it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictDraft {
    pub decision: Decision,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// One-sentence blurb suitable for the digest, when the model offers one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Immutable once written; at most one per content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub content_id: i64,
    pub decision: Decision,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub filtered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsletterStatus {
    Draft,
    PendingApproval,
    Approved,
    Sent,
    Failed,
}

impl NewsletterStatus {
    /// A newsletter in `draft` or `pending_approval` blocks creation of a
    /// new one.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NewsletterStatus::Draft | NewsletterStatus::PendingApproval)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NewsletterStatus::Sent | NewsletterStatus::Failed)
    }
}

/// The single highlighted, AI-summarized item in a newsletter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturedStory {
    pub content_id: i64,
    pub title: String,
    /// Capped at roughly 200 words. Falls back to the item's own text when
    /// the AI call fails.
    pub highlight: String,
    pub ai_generated: bool,
}

/// One digest section: items of one source type, chronological.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub source_type: SourceType,
    pub content_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Newsletter {
    pub id: i64,
    pub status: NewsletterStatus,
    pub cutoff_from: DateTime<Utc>,
    pub cutoff_to: DateTime<Utc>,
    pub subject: String,
    pub featured: FeaturedStory,
    pub sections: Vec<Section>,
    /// Ordered inclusion list: featured first, then sections in order.
    pub content_ids: Vec<i64>,
    /// Provider campaign id once created; doubles as the delivery
    /// idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// What the composer hands to the store; the store assigns the id and
/// initial `draft` status.
#[derive(Debug, Clone)]
pub struct NewsletterDraft {
    pub cutoff_from: DateTime<Utc>,
    pub cutoff_to: DateTime<Utc>,
    pub subject: String,
    pub featured: FeaturedStory,
    pub sections: Vec<Section>,
    pub content_ids: Vec<i64>,
}

/// The only state that must survive a process restart. Read back and
/// reconciled on startup, never reinitialized to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub pending_newsletter_id: Option<i64>,
    /// Next fire time per named job, for observability across restarts.
    #[serde(default)]
    pub next_fire: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub newsletter_id: i64,
    pub campaign_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of one scrape run across all adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRunReport {
    pub sources_scraped: usize,
    pub items_found: usize,
    pub items_new: usize,
    pub items_duplicate: usize,
    pub items_invalid: usize,
    pub errors: Vec<String>,
}

/// Aggregate counts from one filter batch. Per-item failures land in
/// `errored` and never abort sibling items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRunReport {
    pub approved: usize,
    pub rejected: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsOverview {
    pub content_total: usize,
    pub content_scraped: usize,
    pub content_approved: usize,
    pub content_rejected: usize,
    pub content_used: usize,
    pub newsletters_total: usize,
    pub newsletters_sent: usize,
    pub newsletters_failed: usize,
    pub pending_newsletter_id: Option<i64>,
}
