//! Delivery: the email-campaign provider contract, the idempotent send
//! path, and the SMTP preview that goes to the manager before approval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
use metrics::counter;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{ContentItem, DeliveryReceipt, Newsletter, NewsletterStatus};
use crate::retry::{with_retries, RetryPolicy};
use crate::store::{Store, TransitionStamps};

// ---- campaign provider contract ----

#[async_trait]
pub trait CampaignProvider: Send + Sync {
    /// Create a campaign and return the provider's campaign id. The id is
    /// the idempotency key for the whole delivery.
    async fn create_campaign(&self, subject: &str, html: &str) -> Result<String>;
    async fn send_campaign(&self, campaign_id: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Mailchimp-style HTTP provider.
pub struct HttpCampaignProvider {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    audience_id: String,
    from_name: String,
    reply_to: String,
}

impl HttpCampaignProvider {
    /// Build from the environment; `None` when credentials are missing.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        let api_base = std::env::var("CAMPAIGN_API_BASE").ok().filter(|s| !s.is_empty())?;
        let api_key = std::env::var("CAMPAIGN_API_KEY").ok().filter(|s| !s.is_empty())?;
        let audience_id = std::env::var("CAMPAIGN_AUDIENCE_ID").ok().filter(|s| !s.is_empty())?;
        let http = reqwest::Client::builder()
            .user_agent("civic-digest/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Some(Self {
            http,
            api_base,
            api_key,
            audience_id,
            from_name: std::env::var("CAMPAIGN_FROM_NAME").unwrap_or_else(|_| "Community Digest".into()),
            reply_to: std::env::var("CAMPAIGN_REPLY_TO").unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CampaignProvider for HttpCampaignProvider {
    async fn create_campaign(&self, subject: &str, html: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let body = serde_json::json!({
            "type": "regular",
            "recipients": { "list_id": self.audience_id },
            "settings": {
                "subject_line": subject,
                "from_name": self.from_name,
                "reply_to": self.reply_to,
            },
            "content": { "html": html },
        });
        let resp = self
            .http
            .post(format!("{}/campaigns", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("create campaign request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("campaign provider returned {status} on create"));
        }
        let created: Created = resp.json().await.context("create campaign body")?;
        Ok(created.id)
    }

    async fn send_campaign(&self, campaign_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/campaigns/{campaign_id}/actions/send", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("send campaign request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("campaign provider returned {status} on send"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Stand-in when no provider credentials are configured: fabricates ids
/// and logs instead of sending. Loudly marked so it is never mistaken for
/// real delivery.
pub struct DryRunCampaignProvider {
    seq: AtomicU64,
}

impl DryRunCampaignProvider {
    pub fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }
}

impl Default for DryRunCampaignProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignProvider for DryRunCampaignProvider {
    async fn create_campaign(&self, subject: &str, _html: &str) -> Result<String> {
        let id = format!("dry-run-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        tracing::warn!(campaign_id = %id, subject, "DRY RUN: campaign created, nothing will be sent");
        Ok(id)
    }

    async fn send_campaign(&self, campaign_id: &str) -> Result<()> {
        tracing::warn!(campaign_id, "DRY RUN: campaign send skipped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

/// Recording mock for tests. `fail_sends` makes `send_campaign` error
/// until cleared.
pub struct MockCampaignProvider {
    pub created: Mutex<Vec<(String, String)>>,
    pub sent: Mutex<Vec<String>>,
    pub fail_sends: AtomicBool,
    seq: AtomicU64,
}

impl MockCampaignProvider {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }
}

impl Default for MockCampaignProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignProvider for MockCampaignProvider {
    async fn create_campaign(&self, subject: &str, html: &str) -> Result<String> {
        let id = format!("campaign-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.created.lock().unwrap().push((subject.to_string(), html.to_string()));
        Ok(id)
    }

    async fn send_campaign(&self, campaign_id: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("provider unavailable"));
        }
        self.sent.lock().unwrap().push(campaign_id.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ---- manager preview ----

#[async_trait]
pub trait PreviewSender: Send + Sync {
    async fn send_preview(&self, newsletter: &Newsletter, items: &[ContentItem]) -> Result<()>;
}

/// SMTP preview to the manager, in plain text.
pub struct SmtpPreviewSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpPreviewSender {
    /// Build from the environment; `None` when SMTP or the manager address
    /// is not configured.
    pub fn from_env(manager_email: &str) -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|s| !s.is_empty())?;
        let user = std::env::var("SMTP_USER").ok()?;
        let pass = std::env::var("SMTP_PASS").ok()?;
        let from_addr = std::env::var("PREVIEW_EMAIL_FROM").ok()?;

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host).ok()?.credentials(creds).build();
        let from = from_addr.parse().ok()?;
        let to = manager_email.parse().ok()?;
        Some(Self { mailer, from, to })
    }
}

#[async_trait]
impl PreviewSender for SmtpPreviewSender {
    async fn send_preview(&self, newsletter: &Newsletter, items: &[ContentItem]) -> Result<()> {
        let subject = format!("[PREVIEW] {}", newsletter.subject);
        let body = render_text(newsletter, items);
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(body)
            .context("build preview email")?;
        self.mailer.send(msg).await.context("send preview email")?;
        Ok(())
    }
}

/// Used when SMTP is not configured: the preview goes to the log so the
/// pipeline still advances in development.
pub struct LogPreviewSender;

#[async_trait]
impl PreviewSender for LogPreviewSender {
    async fn send_preview(&self, newsletter: &Newsletter, items: &[ContentItem]) -> Result<()> {
        tracing::info!(
            newsletter_id = newsletter.id,
            subject = %newsletter.subject,
            items = items.len(),
            "preview (no SMTP configured):\n{}",
            render_text(newsletter, items)
        );
        Ok(())
    }
}

/// Recording mock for tests; flip `fail` to exercise the preview-failure
/// path.
pub struct MockPreviewSender {
    pub sent: Mutex<Vec<i64>>,
    pub fail: AtomicBool,
}

impl MockPreviewSender {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()), fail: AtomicBool::new(false) }
    }
}

impl Default for MockPreviewSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreviewSender for MockPreviewSender {
    async fn send_preview(&self, newsletter: &Newsletter, _items: &[ContentItem]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("smtp down"));
        }
        self.sent.lock().unwrap().push(newsletter.id);
        Ok(())
    }
}

// ---- rendering ----

fn item_line(item: &ContentItem) -> String {
    format!("* {} ({})\n  {}", item.title, item.source_name, item.url)
}

/// Plain-text rendition used for the manager preview.
pub fn render_text(newsletter: &Newsletter, items: &[ContentItem]) -> String {
    let by_id = |id: i64| items.iter().find(|c| c.id == id);
    let mut out = String::new();
    out.push_str(&newsletter.subject);
    out.push_str("\n\n");
    out.push_str(&newsletter.featured.title.to_uppercase());
    out.push('\n');
    out.push_str(&newsletter.featured.highlight);
    out.push_str("\n\n");
    for section in &newsletter.sections {
        out.push_str(section.source_type.label());
        out.push('\n');
        for id in &section.content_ids {
            if let Some(item) = by_id(*id) {
                out.push_str(&item_line(item));
                out.push('\n');
            }
        }
        out.push('\n');
    }
    out
}

/// Minimal HTML body for the campaign. Templating proper is out of scope;
/// this keeps the provider contract exercised end to end.
pub fn render_html(newsletter: &Newsletter, items: &[ContentItem]) -> String {
    let by_id = |id: i64| items.iter().find(|c| c.id == id);
    let mut out = String::new();
    out.push_str("<html><body>");
    out.push_str(&format!("<h1>{}</h1>", html_escape::encode_text(&newsletter.subject)));
    out.push_str(&format!("<h2>{}</h2>", html_escape::encode_text(&newsletter.featured.title)));
    out.push_str(&format!("<p>{}</p>", html_escape::encode_text(&newsletter.featured.highlight)));
    for section in &newsletter.sections {
        out.push_str(&format!("<h3>{}</h3><ul>", section.source_type.label()));
        for id in &section.content_ids {
            if let Some(item) = by_id(*id) {
                out.push_str(&format!(
                    "<li><a href=\"{}\">{}</a> ({})</li>",
                    html_escape::encode_double_quoted_attribute(&item.url),
                    html_escape::encode_text(&item.title),
                    html_escape::encode_text(&item.source_name),
                ));
            }
        }
        out.push_str("</ul>");
    }
    out.push_str("</body></html>");
    out
}

// ---- gateway ----

pub struct DeliveryGateway {
    provider: Arc<dyn CampaignProvider>,
    retry: RetryPolicy,
}

impl DeliveryGateway {
    pub fn new(provider: Arc<dyn CampaignProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Submit an approved newsletter to the campaign provider.
    ///
    /// Idempotent: an already-`sent` newsletter returns its existing
    /// receipt instead of creating a second campaign. Provider failure
    /// (after the retry budget) moves the newsletter to `failed`; the
    /// pipeline never re-sends automatically because that risks duplicate
    /// delivery to subscribers.
    pub async fn send(&self, store: &Store, newsletter_id: i64) -> PipelineResult<DeliveryReceipt> {
        let newsletter = store.get_newsletter(newsletter_id)?;

        if newsletter.status == NewsletterStatus::Sent {
            let campaign_id = newsletter.campaign_id.clone().ok_or_else(|| {
                PipelineError::Storage(format!("newsletter {newsletter_id} sent without campaign id"))
            })?;
            return Ok(DeliveryReceipt {
                newsletter_id,
                campaign_id,
                sent_at: newsletter.sent_at.unwrap_or_else(Utc::now),
            });
        }
        if newsletter.status != NewsletterStatus::Approved {
            return Err(PipelineError::NotApproved(newsletter_id));
        }

        let items: Vec<ContentItem> = newsletter
            .content_ids
            .iter()
            .filter_map(|id| store.get_content(*id).ok())
            .collect();
        let html = render_html(&newsletter, &items);

        // Reuse a campaign created by an earlier interrupted attempt.
        let campaign_id = match newsletter.campaign_id.clone() {
            Some(id) => id,
            None => {
                let id = with_retries(&self.retry, "create_campaign", || {
                    self.provider.create_campaign(&newsletter.subject, &html)
                })
                .await
                .map_err(|e| self.fail(store, newsletter_id, e))?;
                store.set_newsletter_campaign(newsletter_id, &id)?;
                id
            }
        };

        with_retries(&self.retry, "send_campaign", || self.provider.send_campaign(&campaign_id))
            .await
            .map_err(|e| self.fail(store, newsletter_id, e))?;

        let sent_at = Utc::now();
        store.transition_newsletter(
            newsletter_id,
            NewsletterStatus::Approved,
            NewsletterStatus::Sent,
            TransitionStamps { sent_at: Some(sent_at), ..Default::default() },
        )?;
        counter!("newsletters_sent_total").increment(1);
        tracing::info!(newsletter_id, campaign_id = %campaign_id, provider = self.provider.name(), "newsletter sent");

        Ok(DeliveryReceipt { newsletter_id, campaign_id, sent_at })
    }

    /// Terminal failure path: park the newsletter in `failed` and surface
    /// the provider error to the operator.
    fn fail(&self, store: &Store, newsletter_id: i64, err: anyhow::Error) -> PipelineError {
        counter!("newsletters_failed_total").increment(1);
        if let Err(te) = store.transition_newsletter(
            newsletter_id,
            NewsletterStatus::Approved,
            NewsletterStatus::Failed,
            TransitionStamps::default(),
        ) {
            tracing::warn!(newsletter_id, error = %te, "could not mark newsletter failed");
        }
        PipelineError::Delivery(format!("newsletter {newsletter_id}: {err}"))
    }
}
