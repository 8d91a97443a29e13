//! Time-driven orchestrator. Owns the named recurring jobs (scrape,
//! filter, compose, send) and the one piece of cross-restart state: the
//! pending newsletter awaiting approval or send.
//!
//! Scheduled ticks and manual triggers funnel into the same functions, so
//! a manual trigger during a scheduled run coalesces into a no-op success
//! instead of racing it. The approval grace timer is always re-derived
//! from the persisted `preview_sent_at`, never from process uptime.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::task::JoinHandle;

use crate::compose::Composer;
use crate::config::Settings;
use crate::deliver::{DeliveryGateway, PreviewSender};
use crate::error::{PipelineError, PipelineResult};
use crate::filter::FilterEngine;
use crate::ingest::{self, adapters::SourceAdapter};
use crate::model::{
    DeliveryReceipt, FilterRunReport, Newsletter, NewsletterStatus, ScrapeRunReport,
};
use crate::store::{Store, TransitionStamps};

pub const JOB_SCRAPE: &str = "scrape";
pub const JOB_FILTER: &str = "filter";
pub const JOB_COMPOSE: &str = "compose";
pub const JOB_SEND: &str = "send";

/// Result of asking a named job to run.
#[derive(Debug)]
pub enum JobOutcome<T> {
    Completed(T),
    /// The same logical operation was already in flight; the trigger was
    /// absorbed, which counts as success.
    Coalesced,
}

impl<T> JobOutcome<T> {
    pub fn is_coalesced(&self) -> bool {
        matches!(self, JobOutcome::Coalesced)
    }

    pub fn into_completed(self) -> Option<T> {
        match self {
            JobOutcome::Completed(t) => Some(t),
            JobOutcome::Coalesced => None,
        }
    }
}

/// Whether a timer cancellation actually found a timer. Expected absence
/// is a first-class outcome, not a swallowed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NothingArmed,
}

/// Serializes runs of one named job. `try_lock` keeps a second trigger
/// from queueing behind the first.
struct JobGuard {
    name: &'static str,
    lock: tokio::sync::Mutex<()>,
}

impl JobGuard {
    fn new(name: &'static str) -> Self {
        Self { name, lock: tokio::sync::Mutex::new(()) }
    }

    async fn run<T>(&self, fut: impl std::future::Future<Output = T>) -> JobOutcome<T> {
        match self.lock.try_lock() {
            Ok(_guard) => {
                counter!("job_runs_total", "job" => self.name).increment(1);
                JobOutcome::Completed(fut.await)
            }
            Err(_) => {
                counter!("job_coalesced_total", "job" => self.name).increment(1);
                tracing::info!(job = self.name, "already running, trigger coalesced");
                JobOutcome::Coalesced
            }
        }
    }
}

struct JobSet {
    scrape: JobGuard,
    filter: JobGuard,
    compose: JobGuard,
    send: JobGuard,
}

struct GraceTimer {
    newsletter_id: i64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    pub scrape_every: Duration,
    pub filter_every: Duration,
    pub filter_initial_delay: Duration,
    pub compose_every: Duration,
    pub send_check_every: Duration,
    pub grace: chrono::Duration,
    pub auto_send_after_preview: bool,
    pub lookback: chrono::Duration,
    pub filter_batch_size: usize,
}

impl SchedulerCfg {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            scrape_every: Duration::from_secs(s.scrape_interval_hours * 3600),
            filter_every: Duration::from_secs(s.filter_interval_hours * 3600),
            filter_initial_delay: Duration::from_secs(s.filter_initial_delay_mins * 60),
            compose_every: Duration::from_secs(s.compose_interval_hours * 3600),
            send_check_every: Duration::from_secs(s.send_check_interval_mins * 60),
            grace: s.grace_period(),
            auto_send_after_preview: s.auto_send_after_preview,
            lookback: chrono::Duration::days(s.content_lookback_days.max(0)),
            filter_batch_size: s.filter_batch_size,
        }
    }
}

pub struct Orchestrator {
    store: Arc<Store>,
    filter: FilterEngine,
    composer: Composer,
    gateway: DeliveryGateway,
    preview: Arc<dyn PreviewSender>,
    adapters: Vec<Box<dyn SourceAdapter>>,
    cfg: SchedulerCfg,
    jobs: JobSet,
    grace_timer: StdMutex<Option<GraceTimer>>,
    last_scrape: StdMutex<Option<ScrapeRunReport>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        filter: FilterEngine,
        composer: Composer,
        gateway: DeliveryGateway,
        preview: Arc<dyn PreviewSender>,
        adapters: Vec<Box<dyn SourceAdapter>>,
        cfg: SchedulerCfg,
    ) -> Self {
        Self {
            store,
            filter,
            composer,
            gateway,
            preview,
            adapters,
            cfg,
            jobs: JobSet {
                scrape: JobGuard::new(JOB_SCRAPE),
                filter: JobGuard::new(JOB_FILTER),
                compose: JobGuard::new(JOB_COMPOSE),
                send: JobGuard::new(JOB_SEND),
            },
            grace_timer: StdMutex::new(None),
            last_scrape: StdMutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn last_scrape_report(&self) -> Option<ScrapeRunReport> {
        self.last_scrape.lock().expect("last_scrape mutex poisoned").clone()
    }

    /// Newsletter id of the currently armed grace timer, if any.
    pub fn grace_timer_armed(&self) -> Option<i64> {
        self.grace_timer
            .lock()
            .expect("grace timer mutex poisoned")
            .as_ref()
            .map(|t| t.newsletter_id)
    }

    // ---- named jobs (scheduled ticks and manual triggers alike) ----

    pub async fn trigger_scrape(&self) -> JobOutcome<ScrapeRunReport> {
        self.jobs
            .scrape
            .run(async {
                let report = ingest::run_scrape(&self.store, &self.adapters).await;
                *self.last_scrape.lock().expect("last_scrape mutex poisoned") = Some(report.clone());
                report
            })
            .await
    }

    pub async fn trigger_filter(&self) -> JobOutcome<FilterRunReport> {
        self.jobs
            .filter
            .run(self.filter.filter_pending(&self.store, self.cfg.filter_batch_size))
            .await
    }

    /// Compose a newsletter for the lookback window and dispatch the
    /// manager preview. A draft stranded by an earlier preview failure is
    /// resumed instead of conflicting forever.
    pub async fn trigger_compose(self: &Arc<Self>) -> JobOutcome<PipelineResult<Newsletter>> {
        self.jobs.compose.run(self.compose_and_preview()).await
    }

    async fn compose_and_preview(self: &Arc<Self>) -> PipelineResult<Newsletter> {
        if let Some(existing) = self.store.in_flight_newsletter() {
            return match existing.status {
                NewsletterStatus::Draft => {
                    tracing::info!(newsletter_id = existing.id, "retrying preview for stranded draft");
                    self.dispatch_preview(existing).await
                }
                _ => Err(PipelineError::conflict(format!(
                    "newsletter {} is awaiting approval",
                    existing.id
                ))),
            };
        }

        let cutoff_to = Utc::now();
        let cutoff_from = cutoff_to - self.cfg.lookback;
        let newsletter = self.composer.compose(&self.store, cutoff_from, cutoff_to).await?;
        self.dispatch_preview(newsletter).await
    }

    /// Move a draft to `pending_approval`: send the preview, stamp the
    /// dispatch time, persist the pending pointer, then arm the grace
    /// timer. The durable write happens before this returns success.
    async fn dispatch_preview(self: &Arc<Self>, newsletter: Newsletter) -> PipelineResult<Newsletter> {
        let items: Vec<_> = newsletter
            .content_ids
            .iter()
            .filter_map(|id| self.store.get_content(*id).ok())
            .collect();

        self.preview
            .send_preview(&newsletter, &items)
            .await
            .map_err(|e| PipelineError::Delivery(format!("preview dispatch: {e}")))?;

        let preview_sent_at = Utc::now();
        let updated = self.store.transition_newsletter(
            newsletter.id,
            NewsletterStatus::Draft,
            NewsletterStatus::PendingApproval,
            TransitionStamps { preview_sent_at: Some(preview_sent_at), ..Default::default() },
        )?;
        self.store.set_pending_newsletter(Some(updated.id))?;

        if self.cfg.auto_send_after_preview {
            let deadline = preview_sent_at + self.cfg.grace;
            self.arm_grace_timer(updated.id, deadline);
            tracing::info!(newsletter_id = updated.id, %deadline, "preview sent, auto-approval armed");
        } else {
            tracing::info!(newsletter_id = updated.id, "preview sent, awaiting operator approval");
        }
        Ok(updated)
    }

    // ---- approval and send ----

    /// Operator approval: transition, consume the content, then push the
    /// send forward immediately.
    pub async fn approve(self: &Arc<Self>, newsletter_id: i64) -> PipelineResult<Newsletter> {
        self.approve_only(newsletter_id, "operator")?;
        match self.run_due_send().await {
            JobOutcome::Completed(Ok(Some(receipt))) => {
                tracing::info!(newsletter_id, campaign_id = %receipt.campaign_id, "approved and sent");
            }
            JobOutcome::Completed(Ok(None)) => {}
            JobOutcome::Completed(Err(e)) => {
                tracing::warn!(newsletter_id, error = %e, "send after approval failed");
            }
            JobOutcome::Coalesced => {
                tracing::info!(newsletter_id, "send already in flight after approval");
            }
        }
        self.store.get_newsletter(newsletter_id)
    }

    /// Operator rejection: the newsletter is discarded, its content stays
    /// un-consumed, and any armed auto-approval timer is cancelled.
    pub fn reject(&self, newsletter_id: i64) -> PipelineResult<Newsletter> {
        let newsletter = self.store.transition_newsletter(
            newsletter_id,
            NewsletterStatus::PendingApproval,
            NewsletterStatus::Failed,
            TransitionStamps::default(),
        )?;
        match self.cancel_grace_timer(Some(newsletter_id)) {
            CancelOutcome::Cancelled => {
                tracing::info!(newsletter_id, "auto-approval timer cancelled by rejection");
            }
            // Timer may never have been armed (auto-send off, or restart
            // without reconcile); that is expected, not a fault.
            CancelOutcome::NothingArmed => {}
        }
        self.store.set_pending_newsletter(None)?;
        counter!("newsletters_rejected_total").increment(1);
        tracing::info!(newsletter_id, "newsletter rejected, content left unconsumed");
        Ok(newsletter)
    }

    /// Manual send: approve the pending newsletter if it is still waiting,
    /// then deliver. Shares the send guard with the scheduled path.
    pub async fn send_now(&self) -> JobOutcome<PipelineResult<DeliveryReceipt>> {
        self.jobs
            .send
            .run(async {
                let state = self.store.load_scheduler_state();
                let id = state
                    .pending_newsletter_id
                    .ok_or_else(|| PipelineError::not_found("no pending newsletter"))?;
                let newsletter = self.store.get_newsletter(id)?;
                if newsletter.status == NewsletterStatus::PendingApproval {
                    self.approve_only(id, "operator")?;
                }
                self.deliver_pending(id).await
            })
            .await
    }

    /// Scheduled safety net: send the pending newsletter when it is due
    /// (grace elapsed) or already approved. Returns `None` when nothing
    /// was due.
    pub async fn run_due_send(&self) -> JobOutcome<PipelineResult<Option<DeliveryReceipt>>> {
        self.jobs.send.run(self.due_send_inner(false)).await
    }

    /// Grace-timer path: the armed deadline has fired, so the wall-clock
    /// check is already satisfied.
    async fn grace_fire(&self) -> JobOutcome<PipelineResult<Option<DeliveryReceipt>>> {
        self.jobs.send.run(self.due_send_inner(true)).await
    }

    async fn due_send_inner(&self, deadline_elapsed: bool) -> PipelineResult<Option<DeliveryReceipt>> {
        let state = self.store.load_scheduler_state();
        let Some(id) = state.pending_newsletter_id else {
            return Ok(None);
        };
        let newsletter = match self.store.get_newsletter(id) {
            Ok(n) => n,
            Err(PipelineError::NotFound(_)) => {
                tracing::warn!(newsletter_id = id, "pending newsletter missing, clearing stale pointer");
                self.store.set_pending_newsletter(None)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match newsletter.status {
            NewsletterStatus::PendingApproval => {
                if !self.cfg.auto_send_after_preview {
                    return Ok(None);
                }
                let anchor = newsletter.preview_sent_at.unwrap_or(newsletter.created_at);
                if !deadline_elapsed && Utc::now() < anchor + self.cfg.grace {
                    return Ok(None);
                }
                self.approve_only(id, "auto")?;
                self.deliver_pending(id).await.map(Some)
            }
            NewsletterStatus::Approved => self.deliver_pending(id).await.map(Some),
            status if status.is_terminal() => {
                tracing::warn!(newsletter_id = id, ?status, "pending pointer at terminal newsletter, clearing");
                self.store.set_pending_newsletter(None)?;
                Ok(None)
            }
            status => {
                tracing::warn!(newsletter_id = id, ?status, "pending pointer at unexpected status");
                Ok(None)
            }
        }
    }

    /// The one `pending_approval → approved` transition. Consumes the
    /// newsletter's content (this is where items become `used`) and drops
    /// any armed timer.
    fn approve_only(&self, newsletter_id: i64, actor: &'static str) -> PipelineResult<Newsletter> {
        let newsletter = self.store.transition_newsletter(
            newsletter_id,
            NewsletterStatus::PendingApproval,
            NewsletterStatus::Approved,
            TransitionStamps::default(),
        )?;
        self.store.mark_used(&newsletter.content_ids)?;
        if self.cancel_grace_timer(Some(newsletter_id)) == CancelOutcome::Cancelled {
            tracing::debug!(newsletter_id, "grace timer disarmed by approval");
        }
        counter!("newsletters_approved_total", "actor" => actor).increment(1);
        tracing::info!(newsletter_id, actor, "newsletter approved");
        Ok(newsletter)
    }

    async fn deliver_pending(&self, newsletter_id: i64) -> PipelineResult<DeliveryReceipt> {
        match self.gateway.send(&self.store, newsletter_id).await {
            Ok(receipt) => {
                self.store.set_pending_newsletter(None)?;
                Ok(receipt)
            }
            Err(e) => {
                // Delivery failures are terminal for this newsletter, so
                // the pending pointer must not keep referencing it.
                if matches!(e, PipelineError::Delivery(_)) {
                    if let Err(se) = self.store.set_pending_newsletter(None) {
                        tracing::warn!(newsletter_id, error = %se, "failed to clear pending pointer");
                    }
                }
                Err(e)
            }
        }
    }

    // ---- grace timer ----

    fn arm_grace_timer(self: &Arc<Self>, newsletter_id: i64, deadline: DateTime<Utc>) {
        if self.cancel_grace_timer(None) == CancelOutcome::Cancelled {
            tracing::debug!("replacing previously armed grace timer");
        }
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            me.clear_timer_slot(newsletter_id);
            match me.grace_fire().await {
                JobOutcome::Completed(Ok(Some(receipt))) => {
                    tracing::info!(newsletter_id, campaign_id = %receipt.campaign_id, "grace period elapsed, newsletter sent");
                }
                JobOutcome::Completed(Ok(None)) => {
                    tracing::info!(newsletter_id, "grace timer fired but nothing was due");
                }
                JobOutcome::Completed(Err(e)) => {
                    tracing::warn!(newsletter_id, error = %e, "grace-period send failed");
                }
                JobOutcome::Coalesced => {
                    tracing::info!(newsletter_id, "grace timer coalesced with in-flight send");
                }
            }
        });
        *self.grace_timer.lock().expect("grace timer mutex poisoned") =
            Some(GraceTimer { newsletter_id, handle });
    }

    /// Cancel the armed timer. With `Some(id)`, only a timer for that
    /// newsletter is cancelled; a timer for a different newsletter stays.
    fn cancel_grace_timer(&self, newsletter_id: Option<i64>) -> CancelOutcome {
        let mut slot = self.grace_timer.lock().expect("grace timer mutex poisoned");
        match slot.take() {
            Some(timer) if newsletter_id.is_none() || newsletter_id == Some(timer.newsletter_id) => {
                timer.handle.abort();
                CancelOutcome::Cancelled
            }
            Some(other) => {
                *slot = Some(other);
                CancelOutcome::NothingArmed
            }
            None => CancelOutcome::NothingArmed,
        }
    }

    fn clear_timer_slot(&self, newsletter_id: i64) {
        let mut slot = self.grace_timer.lock().expect("grace timer mutex poisoned");
        if slot.as_ref().map(|t| t.newsletter_id) == Some(newsletter_id) {
            *slot = None;
        }
    }

    // ---- startup and loops ----

    /// Read the persisted scheduler state back and pick up where the
    /// previous process left off. The grace window is recomputed from
    /// `preview_sent_at`; a restart neither extends nor skips it.
    pub fn reconcile_on_start(self: &Arc<Self>) -> PipelineResult<()> {
        let state = self.store.load_scheduler_state();
        let Some(id) = state.pending_newsletter_id else {
            tracing::info!("no pending newsletter to restore");
            return Ok(());
        };
        let newsletter = match self.store.get_newsletter(id) {
            Ok(n) => n,
            Err(PipelineError::NotFound(_)) => {
                tracing::warn!(newsletter_id = id, "persisted pending newsletter missing, clearing");
                self.store.set_pending_newsletter(None)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match newsletter.status {
            NewsletterStatus::PendingApproval => {
                if self.cfg.auto_send_after_preview {
                    let anchor = newsletter.preview_sent_at.unwrap_or(newsletter.created_at);
                    let deadline = anchor + self.cfg.grace;
                    tracing::info!(newsletter_id = id, %deadline, "restored pending newsletter, re-arming grace timer");
                    self.arm_grace_timer(id, deadline);
                } else {
                    tracing::info!(newsletter_id = id, "restored pending newsletter, awaiting operator approval");
                }
            }
            NewsletterStatus::Approved => {
                tracing::info!(newsletter_id = id, "resuming interrupted send");
                self.arm_grace_timer(id, Utc::now());
            }
            status => {
                tracing::warn!(newsletter_id = id, ?status, "stale pending pointer, clearing");
                self.store.set_pending_newsletter(None)?;
            }
        }
        Ok(())
    }

    /// Spawn the recurring job loops. A failed run logs and waits for the
    /// next tick; nothing here can take the orchestrator down.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let me = Arc::clone(self);
            let period = self.cfg.scrape_every;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    me.note_next_fire(JOB_SCRAPE, period);
                    ticker.tick().await;
                    let _ = me.trigger_scrape().await;
                }
            }));
        }

        {
            let me = Arc::clone(self);
            let period = self.cfg.filter_every;
            let initial = self.cfg.filter_initial_delay;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + initial, period);
                me.note_next_fire(JOB_FILTER, initial);
                loop {
                    ticker.tick().await;
                    let _ = me.trigger_filter().await;
                    me.note_next_fire(JOB_FILTER, period);
                }
            }));
        }

        {
            let me = Arc::clone(self);
            let period = self.cfg.compose_every;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    me.note_next_fire(JOB_COMPOSE, period);
                    ticker.tick().await;
                    match me.trigger_compose().await {
                        JobOutcome::Completed(Ok(n)) => {
                            tracing::info!(newsletter_id = n.id, "scheduled compose produced a newsletter");
                        }
                        JobOutcome::Completed(Err(PipelineError::InsufficientContent(msg))) => {
                            tracing::info!(%msg, "scheduled compose skipped");
                        }
                        JobOutcome::Completed(Err(e)) => {
                            tracing::warn!(error = %e, "scheduled compose failed");
                        }
                        JobOutcome::Coalesced => {}
                    }
                }
            }));
        }

        {
            let me = Arc::clone(self);
            let period = self.cfg.send_check_every;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    if let JobOutcome::Completed(Err(e)) = me.run_due_send().await {
                        tracing::warn!(error = %e, "scheduled send check failed");
                    }
                }
            }));
        }

        handles
    }

    fn note_next_fire(&self, job: &str, delay: Duration) {
        let when = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.store.set_next_fire(job, when) {
            tracing::warn!(job, error = %e, "could not persist next fire time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_guard_coalesces_concurrent_runs() {
        let guard = Arc::new(JobGuard::new("test"));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let g = Arc::clone(&guard);
        let long_run = tokio::spawn(async move {
            g.run(async {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                42
            })
            .await
        });

        started_rx.await.unwrap();
        // Second trigger while the first is in flight.
        let second = guard.run(async { 7 }).await;
        assert!(second.is_coalesced());

        let _ = release_tx.send(());
        let first = long_run.await.unwrap();
        assert_eq!(first.into_completed(), Some(42));
    }
}
