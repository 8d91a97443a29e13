//! Runtime configuration. Everything operator-tunable (grace period, job
//! cadence, retry counts, provider endpoints) comes from the environment
//! with sensible defaults; scrape sources come from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::SourceType;

const ENV_SOURCES_PATH: &str = "DIGEST_SOURCES_PATH";
const DEFAULT_SOURCES_PATH: &str = "config/sources.toml";

/// Rule for picking the featured story out of the approved set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturedRule {
    /// Highest filter confidence, ties broken by recency.
    HighestConfidence,
    /// Most recently published item.
    MostRecent,
}

impl FeaturedRule {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "recency" | "most_recent" => FeaturedRule::MostRecent,
            _ => FeaturedRule::HighestConfidence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// Where the store snapshot lives.
    pub data_path: PathBuf,

    pub scrape_interval_hours: u64,
    pub filter_interval_hours: u64,
    /// The filter job trails the scrape job by this much on startup.
    pub filter_initial_delay_mins: u64,
    pub compose_interval_hours: u64,
    pub send_check_interval_mins: u64,

    pub filter_batch_size: usize,
    pub content_lookback_days: i64,
    pub featured_rule: FeaturedRule,

    /// Minutes after preview dispatch before the newsletter auto-approves
    /// absent a rejection.
    pub grace_period_mins: i64,
    pub auto_send_after_preview: bool,
    pub manager_email: Option<String>,

    /// Shared retry policy for external API calls.
    pub api_retry_attempts: u32,
    pub api_retry_base_ms: u64,
    pub api_retry_max_ms: u64,
    pub api_timeout_secs: u64,
}

impl Settings {
    /// Load from the environment. Missing or unparsable values fall back to
    /// defaults; nothing here panics.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8000),
            data_path: PathBuf::from(env_or("DIGEST_DATA_PATH", "state/pipeline.json")),
            scrape_interval_hours: env_parse("SCRAPE_INTERVAL_HOURS", 6),
            filter_interval_hours: env_parse("FILTER_INTERVAL_HOURS", 6),
            filter_initial_delay_mins: env_parse("FILTER_INITIAL_DELAY_MINS", 30),
            compose_interval_hours: env_parse("COMPOSE_INTERVAL_HOURS", 168),
            send_check_interval_mins: env_parse("SEND_CHECK_INTERVAL_MINS", 5),
            filter_batch_size: env_parse("FILTER_BATCH_SIZE", 100),
            content_lookback_days: env_parse("CONTENT_LOOKBACK_DAYS", 7),
            featured_rule: FeaturedRule::parse(&env_or("FEATURED_RULE", "confidence")),
            grace_period_mins: env_parse("PREVIEW_GRACE_MINS", 120),
            auto_send_after_preview: env_parse("AUTO_SEND_AFTER_PREVIEW", 1u8) == 1,
            manager_email: std::env::var("MANAGER_EMAIL").ok().filter(|s| !s.is_empty()),
            api_retry_attempts: env_parse("API_RETRY_ATTEMPTS", 3),
            api_retry_base_ms: env_parse("API_RETRY_BASE_MS", 1_000),
            api_retry_max_ms: env_parse("API_RETRY_MAX_MS", 30_000),
            api_timeout_secs: env_parse("API_TIMEOUT_SECS", 30),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.grace_period_mins.max(0))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// One scrape source as configured in `config/sources.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub source_type: SourceType,
    /// Adapter kind; currently only `rss` fetches over HTTP.
    pub kind: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

/// Load source definitions from an explicit path.
pub fn load_sources_from(path: &Path) -> Result<Vec<SourceConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let parsed: SourcesFile = toml::from_str(&content).context("parsing sources toml")?;
    Ok(parsed.sources.into_iter().filter(|s| s.active).collect())
}

/// Load sources using `$DIGEST_SOURCES_PATH`, falling back to
/// `config/sources.toml`. No file means no sources, not an error.
pub fn load_sources_default() -> Result<Vec<SourceConfig>> {
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        return load_sources_from(&PathBuf::from(p));
    }
    let fallback = PathBuf::from(DEFAULT_SOURCES_PATH);
    if fallback.exists() {
        return load_sources_from(&fallback);
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn featured_rule_parses_with_default() {
        assert_eq!(FeaturedRule::parse("recency"), FeaturedRule::MostRecent);
        assert_eq!(FeaturedRule::parse("confidence"), FeaturedRule::HighestConfidence);
        assert_eq!(FeaturedRule::parse("garbage"), FeaturedRule::HighestConfidence);
    }

    #[serial_test::serial]
    #[test]
    fn settings_pick_up_env_overrides() {
        std::env::set_var("PREVIEW_GRACE_MINS", "45");
        std::env::set_var("FEATURED_RULE", "recency");
        let s = Settings::from_env();
        assert_eq!(s.grace_period_mins, 45);
        assert_eq!(s.featured_rule, FeaturedRule::MostRecent);
        assert_eq!(s.grace_period(), chrono::Duration::minutes(45));
        std::env::remove_var("PREVIEW_GRACE_MINS");
        std::env::remove_var("FEATURED_RULE");
    }

    #[serial_test::serial]
    #[test]
    fn sources_env_path_takes_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sources.toml");
        std::fs::write(
            &path,
            "[[sources]]\nname = \"Wire\"\nsource_type = \"news\"\nkind = \"rss\"\nurl = \"https://wire.test/feed\"\n",
        )
        .unwrap();
        std::env::set_var(ENV_SOURCES_PATH, path.display().to_string());
        let loaded = load_sources_default().unwrap();
        std::env::remove_var(ENV_SOURCES_PATH);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Wire");
    }

    #[test]
    fn sources_toml_round_trips_and_skips_inactive() {
        let toml = r#"
            [[sources]]
            name = "County Courier"
            source_type = "news"
            kind = "rss"
            url = "https://example.com/feed.xml"

            [[sources]]
            name = "Old Blog"
            source_type = "social"
            kind = "rss"
            url = "https://example.com/old.xml"
            active = false
        "#;
        let parsed: SourcesFile = toml::from_str(toml).unwrap();
        let active: Vec<_> = parsed.sources.into_iter().filter(|s| s.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "County Courier");
        assert_eq!(active[0].source_type, SourceType::News);
    }
}
