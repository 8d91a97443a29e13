//! AI content filter: builds the curation prompt, enforces the reply
//! schema, and drives batches against the store's work queue.

pub mod client;

use std::time::Duration;

use metrics::counter;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{ContentItem, Decision, FilterRunReport, VerdictDraft};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::Store;

use self::client::DynReasoningClient;

/// Curation rubric. The reply must be a bare JSON object; code fences are
/// tolerated because models add them anyway.
const FILTER_PROMPT: &str = "You are a content curator for a local community newsletter.\n\
\n\
Decide whether the following item belongs in the newsletter.\n\
\n\
APPROVE when it is positive or neutral community content: local events, \
festivals, fundraisers, business openings and promotions, achievements and \
recognition, public meeting notices, civic engagement, health and education \
opportunities, local sports, community service.\n\
\n\
REJECT crime and accident reports, political controversy and divisive \
partisan content, complaints and criticism, spam or ads without local \
relevance, and national or international news with no local connection.\n\
\n\
ITEM\n\
Source: {source_name} ({source_type})\n\
Title: {title}\n\
Published: {published_at}\n\
Content: {body}\n\
\n\
Respond with ONLY a JSON object, no markdown and no explanation:\n\
{\"decision\": \"approve\" or \"reject\", \"rationale\": \"one short sentence\", \
\"confidence\": 0.0 to 1.0, \"summary\": \"one engaging sentence for the digest\"}";

pub fn build_prompt(item: &ContentItem) -> String {
    let source_type = serde_json::to_value(item.source_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    FILTER_PROMPT
        .replace("{source_name}", &item.source_name)
        .replace("{source_type}", &source_type)
        .replace("{title}", &item.title)
        .replace("{published_at}", &item.published_at.to_rfc3339())
        .replace("{body}", &truncate_chars(&item.body, 4_000))
}

fn truncate_chars(s: &str, max: usize) -> std::borrow::Cow<'_, str> {
    if s.chars().count() <= max {
        std::borrow::Cow::Borrowed(s)
    } else {
        std::borrow::Cow::Owned(s.chars().take(max).collect())
    }
}

/// Wire shape of the provider reply. `reason` is accepted as an alias
/// because models drift.
#[derive(Debug, Deserialize)]
struct WireVerdict {
    decision: String,
    #[serde(alias = "reason")]
    rationale: Option<String>,
    confidence: Option<f32>,
    summary: Option<String>,
}

/// Parse a provider reply into a verdict. Anything without an unambiguous
/// decision token is a `ClassificationError`; the caller leaves the item
/// in `scraped` so a later batch retries it.
pub fn parse_verdict(reply: &str) -> PipelineResult<VerdictDraft> {
    let cleaned = strip_code_fences(reply);
    let wire: WireVerdict = serde_json::from_str(cleaned.trim())
        .map_err(|e| PipelineError::Classification(format!("unparsable reply: {e}")))?;

    let decision = match wire.decision.trim().to_ascii_lowercase().as_str() {
        "approve" | "approved" => Decision::Approve,
        "reject" | "rejected" => Decision::Reject,
        other => {
            return Err(PipelineError::Classification(format!(
                "unrecognized decision token: {other:?}"
            )))
        }
    };

    Ok(VerdictDraft {
        decision,
        rationale: wire.rationale.unwrap_or_default(),
        confidence: wire.confidence.map(|c| c.clamp(0.0, 1.0)),
        summary: wire.summary.filter(|s| !s.trim().is_empty()),
    })
}

/// Models wrap JSON in ``` fences despite instructions; strip one layer.
fn strip_code_fences(s: &str) -> &str {
    let t = s.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim().strip_suffix("```").unwrap_or(rest).trim()
}

pub struct FilterEngine {
    client: DynReasoningClient,
    retry: RetryPolicy,
    timeout: Duration,
}

impl FilterEngine {
    pub fn new(client: DynReasoningClient, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { client, retry, timeout }
    }

    /// Classify one item. Provider failures and malformed replies both
    /// surface as `ClassificationError` after the retry budget is spent.
    pub async fn classify(&self, item: &ContentItem) -> PipelineResult<VerdictDraft> {
        let prompt = build_prompt(item);
        let reply = with_retries(&self.retry, "classify", || async {
            tokio::time::timeout(self.timeout, self.client.complete(&prompt))
                .await
                .map_err(|_| anyhow::anyhow!("reasoning call timed out"))?
        })
        .await
        .map_err(|e| PipelineError::Classification(e.to_string()))?;

        parse_verdict(&reply)
    }

    /// Pull up to `batch_size` unfiltered items, classify each
    /// independently, and record the verdicts. One bad reply never aborts
    /// the batch; failed items are released back to the queue.
    pub async fn filter_pending(&self, store: &Store, batch_size: usize) -> FilterRunReport {
        let mut report = FilterRunReport::default();
        let batch = store.list_unfiltered(batch_size);
        if batch.is_empty() {
            return report;
        }
        tracing::info!(items = batch.len(), provider = self.client.name(), "filtering batch");

        for item in batch {
            match self.classify(&item).await {
                Ok(draft) => {
                    let decision = draft.decision;
                    match store.record_verdict(item.id, draft) {
                        Ok(_) => match decision {
                            Decision::Approve => report.approved += 1,
                            Decision::Reject => report.rejected += 1,
                        },
                        Err(e) => {
                            tracing::warn!(content_id = item.id, error = %e, "verdict not recorded");
                            store.release_claims(&[item.id]);
                            report.errored += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(content_id = item.id, error = %e, "classification failed, item stays scraped");
                    store.release_claims(&[item.id]);
                    report.errored += 1;
                }
            }
        }

        counter!("filter_approved_total").increment(report.approved as u64);
        counter!("filter_rejected_total").increment(report.rejected as u64);
        counter!("filter_errored_total").increment(report.errored as u64);
        tracing::info!(
            approved = report.approved,
            rejected = report.rejected,
            errored = report.errored,
            "filter batch complete"
        );
        report
    }
}
