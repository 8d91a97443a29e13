//! Newsletter composer: select approved content for a window, pick and
//! summarize the featured story, and group the rest into digest sections.
//! Composition never consumes content; `mark_used` happens at approval.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::config::FeaturedRule;
use crate::error::{PipelineError, PipelineResult};
use crate::filter::client::DynReasoningClient;
use crate::model::{ContentItem, FeaturedStory, Newsletter, NewsletterDraft, Section, SourceType};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::Store;

const FEATURED_PROMPT: &str = "You are writing for a local community newsletter.\n\
Write a warm, engaging highlight of about 150 to 200 words for the story \
below. Plain prose only, no headings and no markdown.\n\
\n\
Title: {title}\n\
Story: {body}";

const SUBJECT_PROMPT: &str = "Write one short, friendly email subject line (under 60 characters) \
for a community newsletter whose lead story is: {title}. \
Reply with the subject line only, no quotes.";

/// Hard cap for the featured highlight, in words.
const HIGHLIGHT_MAX_WORDS: usize = 200;

pub struct Composer {
    client: DynReasoningClient,
    rule: FeaturedRule,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Composer {
    pub fn new(client: DynReasoningClient, rule: FeaturedRule, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { client, rule, retry, timeout }
    }

    /// Draft a newsletter from approved content in `[cutoff_from, cutoff_to]`.
    /// Fails with `ConflictError` while another newsletter is in flight and
    /// with `InsufficientContentError` when the window is empty.
    pub async fn compose(
        &self,
        store: &Store,
        cutoff_from: DateTime<Utc>,
        cutoff_to: DateTime<Utc>,
    ) -> PipelineResult<Newsletter> {
        // Fail fast before any AI spend; create_newsletter re-checks under
        // the store lock either way.
        if let Some(existing) = store.in_flight_newsletter() {
            return Err(PipelineError::conflict(format!(
                "newsletter {} is already {:?}",
                existing.id, existing.status
            )));
        }

        let items: Vec<ContentItem> = store
            .list_approved_since(cutoff_from)
            .into_iter()
            .filter(|c| c.published_at <= cutoff_to)
            .collect();
        if items.is_empty() {
            return Err(PipelineError::InsufficientContent(format!(
                "no approved content between {cutoff_from} and {cutoff_to}"
            )));
        }

        let confidence: BTreeMap<i64, f32> = items
            .iter()
            .filter_map(|c| store.get_verdict(c.id).and_then(|v| v.confidence).map(|f| (c.id, f)))
            .collect();

        let featured_item = select_featured(&items, &confidence, self.rule)
            .expect("non-empty selection always yields a featured item")
            .clone();

        let featured = self.featured_story(&featured_item).await;
        let subject = self.subject_line(&featured, cutoff_to).await;
        let sections = group_sections(&items, featured_item.id);

        let mut content_ids = vec![featured_item.id];
        content_ids.extend(sections.iter().flat_map(|s| s.content_ids.iter().copied()));

        let newsletter = store.create_newsletter(NewsletterDraft {
            cutoff_from,
            cutoff_to,
            subject,
            featured,
            sections,
            content_ids,
        })?;

        counter!("newsletters_composed_total").increment(1);
        tracing::info!(
            newsletter_id = newsletter.id,
            items = newsletter.content_ids.len(),
            featured = newsletter.featured.content_id,
            "newsletter drafted"
        );
        Ok(newsletter)
    }

    /// AI highlight with a verbatim fallback. This call is secondary and
    /// must never block newsletter creation.
    async fn featured_story(&self, item: &ContentItem) -> FeaturedStory {
        let prompt = FEATURED_PROMPT
            .replace("{title}", &item.title)
            .replace("{body}", &item.body);
        match self.ai_call(&prompt, "featured_story").await {
            Ok(text) => FeaturedStory {
                content_id: item.id,
                title: item.title.clone(),
                highlight: truncate_words(&text, HIGHLIGHT_MAX_WORDS),
                ai_generated: true,
            },
            Err(e) => {
                tracing::warn!(content_id = item.id, error = %e, "featured highlight fell back to source text");
                let source = if item.body.trim().is_empty() { &item.title } else { &item.body };
                FeaturedStory {
                    content_id: item.id,
                    title: item.title.clone(),
                    highlight: truncate_words(source, HIGHLIGHT_MAX_WORDS),
                    ai_generated: false,
                }
            }
        }
    }

    async fn subject_line(&self, featured: &FeaturedStory, cutoff_to: DateTime<Utc>) -> String {
        let prompt = SUBJECT_PROMPT.replace("{title}", &featured.title);
        match self.ai_call(&prompt, "subject_line").await {
            Ok(line) => {
                let line = line.lines().next().unwrap_or_default().trim().trim_matches('"').to_string();
                if line.is_empty() {
                    fallback_subject(cutoff_to)
                } else {
                    truncate_words(&line, 12)
                }
            }
            Err(_) => fallback_subject(cutoff_to),
        }
    }

    async fn ai_call(&self, prompt: &str, op: &str) -> anyhow::Result<String> {
        with_retries(&self.retry, op, || async {
            tokio::time::timeout(self.timeout, self.client.complete(prompt))
                .await
                .map_err(|_| anyhow::anyhow!("reasoning call timed out"))?
        })
        .await
    }
}

fn fallback_subject(cutoff_to: DateTime<Utc>) -> String {
    format!("Your weekly community update - {}", cutoff_to.format("%B %-d, %Y"))
}

/// Deterministic featured-story pick. Confidence rule prefers the highest
/// filter confidence with recency as the tiebreaker; recency rule takes
/// the newest item outright.
pub fn select_featured<'a>(
    items: &'a [ContentItem],
    confidence: &BTreeMap<i64, f32>,
    rule: FeaturedRule,
) -> Option<&'a ContentItem> {
    items.iter().max_by(|a, b| match rule {
        FeaturedRule::HighestConfidence => {
            let ca = confidence.get(&a.id).copied().unwrap_or(0.0);
            let cb = confidence.get(&b.id).copied().unwrap_or(0.0);
            ca.partial_cmp(&cb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.published_at.cmp(&b.published_at))
                .then(a.id.cmp(&b.id))
        }
        FeaturedRule::MostRecent => a.published_at.cmp(&b.published_at).then(a.id.cmp(&b.id)),
    })
}

/// Digest sections: one per source type in fixed order, featured item
/// excluded, chronological within a section. Empty sections are dropped.
pub fn group_sections(items: &[ContentItem], featured_id: i64) -> Vec<Section> {
    let mut sections = Vec::new();
    for st in SourceType::ALL {
        let ids: Vec<i64> = items
            .iter()
            .filter(|c| c.source_type == st && c.id != featured_id)
            .map(|c| c.id)
            .collect();
        if !ids.is_empty() {
            sections.push(Section { source_type: st, content_ids: ids });
        }
    }
    sections
}

/// Cap a text at `max` words, appending an ellipsis when truncated.
pub fn truncate_words(s: &str, max: usize) -> String {
    let words: Vec<&str> = s.split_whitespace().collect();
    if words.len() <= max {
        words.join(" ")
    } else {
        let mut out = words[..max].join(" ");
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentState;
    use chrono::TimeZone;

    fn item(id: i64, st: SourceType, published_h: u32) -> ContentItem {
        ContentItem {
            id,
            source_type: st,
            source_name: "src".into(),
            url: format!("https://x.test/{id}"),
            title: format!("Title {id}"),
            body: "Body text.".into(),
            published_at: Utc.with_ymd_and_hms(2026, 8, 1, published_h, 0, 0).unwrap(),
            scraped_at: Utc::now(),
            fingerprint: format!("fp{id}"),
            state: ContentState::FilteredApproved,
        }
    }

    #[test]
    fn featured_by_confidence_with_recency_tiebreak() {
        let items = vec![
            item(1, SourceType::News, 1),
            item(2, SourceType::News, 2),
            item(3, SourceType::Social, 3),
        ];
        let mut conf = BTreeMap::new();
        conf.insert(1, 0.9);
        conf.insert(2, 0.9);
        conf.insert(3, 0.4);
        let picked = select_featured(&items, &conf, FeaturedRule::HighestConfidence).unwrap();
        // 1 and 2 tie on confidence; 2 is newer.
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn featured_by_recency_ignores_confidence() {
        let items = vec![item(1, SourceType::News, 1), item(2, SourceType::Government, 9)];
        let mut conf = BTreeMap::new();
        conf.insert(1, 1.0);
        let picked = select_featured(&items, &conf, FeaturedRule::MostRecent).unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn sections_group_by_source_type_and_skip_featured() {
        let items = vec![
            item(1, SourceType::News, 1),
            item(2, SourceType::News, 2),
            item(3, SourceType::Government, 3),
            item(4, SourceType::Social, 4),
        ];
        let sections = group_sections(&items, 1);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].source_type, SourceType::News);
        assert_eq!(sections[0].content_ids, vec![2]);
        assert_eq!(sections[1].content_ids, vec![3]);
        assert_eq!(sections[2].content_ids, vec![4]);
    }

    #[test]
    fn truncate_words_caps_and_marks() {
        assert_eq!(truncate_words("one two three", 5), "one two three");
        assert_eq!(truncate_words("one two three", 2), "one two...");
    }
}
