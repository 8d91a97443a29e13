//! Durable store for content items, verdicts, newsletters, and scheduler
//! state. All cross-cutting invariants (unique fingerprint, single
//! in-flight newsletter, verdict immutability, status transitions) are
//! enforced here via conflict-detecting writes, so concurrent manual and
//! scheduled triggers cannot race past each other.
//!
//! Persistence is a JSON snapshot written atomically (temp file + rename)
//! before a mutating call returns success. A crash can therefore leave disk
//! at most one transition behind memory, never the other way around.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::fingerprint;
use crate::model::{
    ContentItem, ContentState, Decision, FilterVerdict, Newsletter, NewsletterDraft,
    NewsletterStatus, RawItem, SchedulerState, StatsOverview, VerdictDraft,
};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted(ContentItem),
    /// Fingerprint already present; the item is dropped, not re-filtered.
    Deduplicated,
}

/// Optional fields applied alongside a newsletter status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionStamps {
    pub preview_sent_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_content_id: i64,
    next_newsletter_id: i64,
    content: BTreeMap<i64, ContentItem>,
    verdicts: BTreeMap<i64, FilterVerdict>,
    newsletters: BTreeMap<i64, Newsletter>,
    scheduler: SchedulerState,
}

struct StoreInner {
    snap: Snapshot,
    /// Items dispensed by `list_unfiltered` and not yet resolved. Memory
    /// only: a crash releases every claim, which is safe because verdict
    /// writes are conflict-checked anyway.
    claims: HashSet<i64>,
}

pub struct Store {
    inner: Mutex<StoreInner>,
    path: PathBuf,
}

impl Store {
    /// Open the store at `path`, loading an existing snapshot if present.
    /// A missing file is a fresh store; an unreadable one is a fault.
    pub fn open(path: impl Into<PathBuf>) -> PipelineResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let snap = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .map_err(|e| PipelineError::Storage(format!("corrupt snapshot {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { inner: Mutex::new(StoreInner { snap, claims: HashSet::new() }), path })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Write the snapshot to disk atomically. Called with the lock held,
    /// after the in-memory mutation.
    fn commit(&self, snap: &Snapshot) -> PipelineResult<()> {
        let json = serde_json::to_vec_pretty(snap)
            .map_err(|e| PipelineError::Storage(format!("encode snapshot: {e}")))?;
        write_atomic(&self.path, &json)
    }

    // ---- content ----

    /// Insert a scraped item, or drop it when its fingerprint is already
    /// known. Required fields must be non-empty.
    pub fn ingest(&self, raw: RawItem) -> PipelineResult<IngestOutcome> {
        if raw.url.trim().is_empty() || raw.title.trim().is_empty() || raw.body.trim().is_empty() {
            return Err(PipelineError::validation("url, title, and body must be non-empty"));
        }
        let fp = fingerprint(&raw.url, &raw.title);

        let mut g = self.lock();
        if g.snap.content.values().any(|c| c.fingerprint == fp) {
            return Ok(IngestOutcome::Deduplicated);
        }
        g.snap.next_content_id += 1;
        let item = ContentItem {
            id: g.snap.next_content_id,
            source_type: raw.source_type,
            source_name: raw.source_name,
            url: raw.url,
            title: raw.title,
            body: raw.body,
            published_at: raw.published_at,
            scraped_at: Utc::now(),
            fingerprint: fp,
            state: ContentState::Scraped,
        };
        g.snap.content.insert(item.id, item.clone());
        self.commit(&g.snap)?;
        Ok(IngestOutcome::Inserted(item))
    }

    /// The filter engine's work queue: unclaimed `scraped` items, oldest
    /// first. Returned items are claimed so a concurrent caller cannot
    /// receive them again; `record_verdict` or `release_claims` resolves
    /// the claim.
    pub fn list_unfiltered(&self, limit: usize) -> Vec<ContentItem> {
        let mut g = self.lock();
        let mut due: Vec<ContentItem> = g
            .snap
            .content
            .values()
            .filter(|c| c.state == ContentState::Scraped && !g.claims.contains(&c.id))
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.scraped_at, c.id));
        due.truncate(limit);
        for c in &due {
            g.claims.insert(c.id);
        }
        due
    }

    /// Return claimed items to the queue, e.g. after a failed classification.
    pub fn release_claims(&self, ids: &[i64]) {
        let mut g = self.lock();
        for id in ids {
            g.claims.remove(id);
        }
    }

    /// Record the one and only verdict for an item and advance its state.
    pub fn record_verdict(&self, content_id: i64, draft: VerdictDraft) -> PipelineResult<FilterVerdict> {
        let mut g = self.lock();
        let item = g
            .snap
            .content
            .get(&content_id)
            .ok_or_else(|| PipelineError::not_found(format!("content {content_id}")))?;
        if g.snap.verdicts.contains_key(&content_id) {
            return Err(PipelineError::conflict(format!("content {content_id} already has a verdict")));
        }
        if item.state != ContentState::Scraped {
            return Err(PipelineError::conflict(format!(
                "content {content_id} is {:?}, expected scraped",
                item.state
            )));
        }
        let verdict = FilterVerdict {
            content_id,
            decision: draft.decision,
            rationale: draft.rationale,
            confidence: draft.confidence.map(|c| c.clamp(0.0, 1.0)),
            summary: draft.summary,
            filtered_at: Utc::now(),
        };
        let next_state = match draft.decision {
            Decision::Approve => ContentState::FilteredApproved,
            Decision::Reject => ContentState::FilteredRejected,
        };
        g.snap.content.get_mut(&content_id).expect("checked above").state = next_state;
        g.snap.verdicts.insert(content_id, verdict.clone());
        g.claims.remove(&content_id);
        self.commit(&g.snap)?;
        Ok(verdict)
    }

    pub fn get_verdict(&self, content_id: i64) -> Option<FilterVerdict> {
        self.lock().snap.verdicts.get(&content_id).cloned()
    }

    /// Approved items published at or after `cutoff`, grouped by source
    /// type in section order, chronological within a group.
    pub fn list_approved_since(&self, cutoff: DateTime<Utc>) -> Vec<ContentItem> {
        let g = self.lock();
        let mut out: Vec<ContentItem> = g
            .snap
            .content
            .values()
            .filter(|c| c.state == ContentState::FilteredApproved && c.published_at >= cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.source_type, c.published_at, c.id));
        out
    }

    /// Consume approved items into a newsletter. All-or-nothing: every id
    /// must currently be `filtered_approved`, guarding against
    /// double-inclusion across overlapping composer runs.
    pub fn mark_used(&self, ids: &[i64]) -> PipelineResult<()> {
        let mut g = self.lock();
        for id in ids {
            let item = g
                .snap
                .content
                .get(id)
                .ok_or_else(|| PipelineError::not_found(format!("content {id}")))?;
            if item.state != ContentState::FilteredApproved {
                return Err(PipelineError::conflict(format!(
                    "content {id} is {:?}, expected filtered_approved",
                    item.state
                )));
            }
        }
        for id in ids {
            g.snap.content.get_mut(id).expect("checked above").state = ContentState::Used;
        }
        self.commit(&g.snap)?;
        Ok(())
    }

    /// Non-claiming listing for the admin surface, newest first.
    pub fn list_content(&self, state: ContentState, limit: usize) -> Vec<ContentItem> {
        let g = self.lock();
        let mut out: Vec<ContentItem> =
            g.snap.content.values().filter(|c| c.state == state).cloned().collect();
        out.sort_by_key(|c| std::cmp::Reverse((c.scraped_at, c.id)));
        out.truncate(limit);
        out
    }

    pub fn get_content(&self, id: i64) -> PipelineResult<ContentItem> {
        self.lock()
            .snap
            .content
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("content {id}")))
    }

    // ---- newsletters ----

    pub fn get_newsletter(&self, id: i64) -> PipelineResult<Newsletter> {
        self.lock()
            .snap
            .newsletters
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("newsletter {id}")))
    }

    pub fn in_flight_newsletter(&self) -> Option<Newsletter> {
        self.lock().snap.newsletters.values().find(|n| n.status.is_in_flight()).cloned()
    }

    /// Create a `draft` newsletter. Fails if another newsletter is still in
    /// flight, or if any selected item is not currently approved.
    pub fn create_newsletter(&self, draft: NewsletterDraft) -> PipelineResult<Newsletter> {
        let mut g = self.lock();
        if let Some(existing) = g.snap.newsletters.values().find(|n| n.status.is_in_flight()) {
            return Err(PipelineError::conflict(format!(
                "newsletter {} is already {:?}",
                existing.id, existing.status
            )));
        }
        for id in &draft.content_ids {
            let item = g
                .snap
                .content
                .get(id)
                .ok_or_else(|| PipelineError::not_found(format!("content {id}")))?;
            if item.state != ContentState::FilteredApproved {
                return Err(PipelineError::conflict(format!(
                    "content {id} is {:?}, expected filtered_approved",
                    item.state
                )));
            }
        }
        g.snap.next_newsletter_id += 1;
        let newsletter = Newsletter {
            id: g.snap.next_newsletter_id,
            status: NewsletterStatus::Draft,
            cutoff_from: draft.cutoff_from,
            cutoff_to: draft.cutoff_to,
            subject: draft.subject,
            featured: draft.featured,
            sections: draft.sections,
            content_ids: draft.content_ids,
            campaign_id: None,
            created_at: Utc::now(),
            preview_sent_at: None,
            sent_at: None,
        };
        g.snap.newsletters.insert(newsletter.id, newsletter.clone());
        self.commit(&g.snap)?;
        Ok(newsletter)
    }

    /// Compare-and-swap status transition. Every newsletter state change in
    /// the pipeline goes through here, so a lost race surfaces as a
    /// conflict instead of a silent overwrite.
    pub fn transition_newsletter(
        &self,
        id: i64,
        from: NewsletterStatus,
        to: NewsletterStatus,
        stamps: TransitionStamps,
    ) -> PipelineResult<Newsletter> {
        let mut g = self.lock();
        let n = g
            .snap
            .newsletters
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found(format!("newsletter {id}")))?;
        if n.status != from {
            return Err(PipelineError::conflict(format!(
                "newsletter {id} is {:?}, expected {:?}",
                n.status, from
            )));
        }
        n.status = to;
        if let Some(ts) = stamps.preview_sent_at {
            n.preview_sent_at = Some(ts);
        }
        if let Some(ts) = stamps.sent_at {
            n.sent_at = Some(ts);
        }
        if let Some(cid) = stamps.campaign_id {
            n.campaign_id = Some(cid);
        }
        let out = n.clone();
        self.commit(&g.snap)?;
        Ok(out)
    }

    /// Attach the provider campaign id without changing status, so a send
    /// interrupted between campaign creation and dispatch stays idempotent.
    pub fn set_newsletter_campaign(&self, id: i64, campaign_id: &str) -> PipelineResult<()> {
        let mut g = self.lock();
        let n = g
            .snap
            .newsletters
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found(format!("newsletter {id}")))?;
        n.campaign_id = Some(campaign_id.to_string());
        self.commit(&g.snap)?;
        Ok(())
    }

    // ---- scheduler state ----

    pub fn load_scheduler_state(&self) -> SchedulerState {
        self.lock().snap.scheduler.clone()
    }

    /// Point the scheduler at a pending newsletter, durably. Setting an id
    /// requires the newsletter to be awaiting approval or approved.
    pub fn set_pending_newsletter(&self, id: Option<i64>) -> PipelineResult<()> {
        let mut g = self.lock();
        if let Some(id) = id {
            let n = g
                .snap
                .newsletters
                .get(&id)
                .ok_or_else(|| PipelineError::not_found(format!("newsletter {id}")))?;
            if !matches!(n.status, NewsletterStatus::PendingApproval | NewsletterStatus::Approved) {
                return Err(PipelineError::conflict(format!(
                    "newsletter {id} is {:?}, cannot be pending",
                    n.status
                )));
            }
        }
        g.snap.scheduler.pending_newsletter_id = id;
        self.commit(&g.snap)?;
        metrics::gauge!("pipeline_pending_newsletter").set(if id.is_some() { 1.0 } else { 0.0 });
        Ok(())
    }

    pub fn set_next_fire(&self, job: &str, when: DateTime<Utc>) -> PipelineResult<()> {
        let mut g = self.lock();
        g.snap.scheduler.next_fire.insert(job.to_string(), when);
        self.commit(&g.snap)?;
        Ok(())
    }

    // ---- stats ----

    pub fn stats(&self) -> StatsOverview {
        let g = self.lock();
        let mut s = StatsOverview {
            content_total: g.snap.content.len(),
            newsletters_total: g.snap.newsletters.len(),
            pending_newsletter_id: g.snap.scheduler.pending_newsletter_id,
            ..Default::default()
        };
        for c in g.snap.content.values() {
            match c.state {
                ContentState::Scraped => s.content_scraped += 1,
                ContentState::FilteredApproved => s.content_approved += 1,
                ContentState::FilteredRejected => s.content_rejected += 1,
                ContentState::Used => s.content_used += 1,
            }
        }
        for n in g.snap.newsletters.values() {
            match n.status {
                NewsletterStatus::Sent => s.newsletters_sent += 1,
                NewsletterStatus::Failed => s.newsletters_failed += 1,
                _ => {}
            }
        }
        s
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;

    fn raw(url: &str, title: &str) -> RawItem {
        RawItem {
            source_type: SourceType::News,
            source_name: "County Courier".into(),
            url: url.into(),
            title: title.into(),
            body: "Some body text.".into(),
            published_at: Utc::now(),
        }
    }

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("pipeline.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn ingest_rejects_empty_fields() {
        let (_d, store) = open_tmp();
        let mut item = raw("https://x.test/a", "A");
        item.body = "   ".into();
        let err = store.ingest(item).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn duplicate_fingerprint_is_dropped_not_refiltered() {
        let (_d, store) = open_tmp();
        let first = store.ingest(raw("https://x.test/a", "A")).unwrap();
        assert!(matches!(first, IngestOutcome::Inserted(_)));
        // Same identity modulo case and trailing slash.
        let second = store.ingest(raw("HTTPS://x.test/a/", "A")).unwrap();
        assert_eq!(second, IngestOutcome::Deduplicated);
        assert_eq!(store.stats().content_total, 1);
    }

    #[test]
    fn list_unfiltered_claims_items_until_resolved() {
        let (_d, store) = open_tmp();
        store.ingest(raw("https://x.test/a", "A")).unwrap();
        store.ingest(raw("https://x.test/b", "B")).unwrap();

        let first = store.list_unfiltered(10);
        assert_eq!(first.len(), 2);
        // A concurrent caller gets nothing while claims are outstanding.
        assert!(store.list_unfiltered(10).is_empty());

        store.release_claims(&[first[0].id]);
        let again = store.list_unfiltered(10);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
    }

    #[test]
    fn verdict_is_immutable_once_written() {
        let (_d, store) = open_tmp();
        let IngestOutcome::Inserted(item) = store.ingest(raw("https://x.test/a", "A")).unwrap() else {
            panic!("expected insert");
        };
        let draft = VerdictDraft {
            decision: Decision::Approve,
            rationale: "positive community event".into(),
            confidence: Some(0.9),
            summary: None,
        };
        let v1 = store.record_verdict(item.id, draft.clone()).unwrap();
        let err = store
            .record_verdict(
                item.id,
                VerdictDraft { decision: Decision::Reject, rationale: "second".into(), confidence: None, summary: None },
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        // First verdict unchanged.
        assert_eq!(store.get_verdict(item.id).unwrap(), v1);
    }

    #[test]
    fn mark_used_refuses_non_approved_items() {
        let (_d, store) = open_tmp();
        let IngestOutcome::Inserted(a) = store.ingest(raw("https://x.test/a", "A")).unwrap() else {
            panic!()
        };
        let err = store.mark_used(&[a.id]).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        assert_eq!(store.get_content(a.id).unwrap().state, ContentState::Scraped);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        {
            let store = Store::open(&path).unwrap();
            store.ingest(raw("https://x.test/a", "A")).unwrap();
            store.set_next_fire("scrape", Utc::now()).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.stats().content_total, 1);
        assert!(store.load_scheduler_state().next_fire.contains_key("scrape"));
    }
}
