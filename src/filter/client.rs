//! Reasoning-provider abstraction: one trait, a reqwest-backed client, a
//! mock for tests, and a disabled client for runs without credentials.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Send a prompt, get the raw text reply. Callers own parsing and
    /// retry policy.
    async fn complete(&self, prompt: &str) -> Result<String>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type DynReasoningClient = Arc<dyn ReasoningClient>;

/// Chat-completions style HTTP client. Requires an API key; endpoint and
/// model are operator configuration.
pub struct HttpReasoningClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpReasoningClient {
    pub fn new(endpoint: String, api_key: String, model: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("civic-digest/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http, endpoint, api_key, model }
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![Msg { role: "user", content: prompt }],
            temperature: 0.2,
            max_tokens: 1024,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("reasoning provider request")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("reasoning provider returned {status}"));
        }
        let body: Resp = resp.json().await.context("reasoning provider body")?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("reasoning provider returned an empty reply"));
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Always errors. Items stay `scraped` until a real client is configured,
/// which is exactly what the retry semantics want.
pub struct DisabledClient;

#[async_trait]
impl ReasoningClient for DisabledClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("reasoning client disabled"))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Scriptable mock: a closure maps the prompt to a reply (or failure).
pub struct MockReasoningClient {
    reply: Box<dyn Fn(&str) -> Result<String> + Send + Sync>,
}

impl MockReasoningClient {
    pub fn fixed(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self { reply: Box::new(move |_| Ok(reply.clone())) }
    }

    pub fn with_fn(f: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self { reply: Box::new(f) }
    }
}

#[async_trait]
impl ReasoningClient for MockReasoningClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        (self.reply)(prompt)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory driven by the environment, mirroring how the rest of the
/// service boots:
/// * `AI_TEST_MODE=mock` returns a deterministic approve-everything mock.
/// * An `AI_API_KEY` builds the real HTTP client.
/// * Otherwise filtering is disabled until configured.
pub fn build_client_from_env(timeout: Duration) -> DynReasoningClient {
    if std::env::var("AI_TEST_MODE").map(|v| v == "mock").unwrap_or(false) {
        return Arc::new(MockReasoningClient::fixed(
            r#"{"decision": "approve", "rationale": "mock mode", "confidence": 0.5}"#,
        ));
    }
    match std::env::var("AI_API_KEY").ok().filter(|k| !k.is_empty()) {
        Some(key) => {
            let endpoint = std::env::var("AI_ENDPOINT")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
            let model = std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            Arc::new(HttpReasoningClient::new(endpoint, key, model, timeout))
        }
        None => {
            tracing::warn!("AI_API_KEY not set, content filtering disabled");
            Arc::new(DisabledClient)
        }
    }
}
