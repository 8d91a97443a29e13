//! Ingestion: normalize scraped tuples, fingerprint them, and feed the
//! content store. Adapters for concrete sources live in `adapters`.

pub mod adapters;

use metrics::counter;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

use crate::model::ScrapeRunReport;
use crate::store::{IngestOutcome, Store};

use self::adapters::SourceAdapter;

/// Normalize scraped text: decode HTML entities, strip tags, collapse
/// whitespace. Bodies are capped so a runaway page cannot bloat the store.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 20_000 {
        out = out.chars().take(20_000).collect();
    }
    out
}

/// Canonical URL form for fingerprinting: trimmed, lowercased, no trailing
/// slash. Re-scrapes of the same page must hash identically.
fn normalize_url(url: &str) -> String {
    let mut u = url.trim().to_ascii_lowercase();
    while u.ends_with('/') {
        u.pop();
    }
    u
}

/// Stable content identity: SHA-256 over normalized URL + title.
pub fn fingerprint(url: &str, title: &str) -> String {
    let title_norm = normalize_text(title).to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"\n");
    hasher.update(title_norm.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run every adapter once and ingest what comes back. Adapter failures are
/// isolated: one broken source never aborts the run.
pub async fn run_scrape(store: &Store, adapters: &[Box<dyn SourceAdapter>]) -> ScrapeRunReport {
    let mut report = ScrapeRunReport::default();

    for adapter in adapters {
        let raw = match adapter.fetch_latest().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(source = adapter.name(), error = %e, "scrape adapter error");
                counter!("scrape_adapter_errors_total").increment(1);
                report.errors.push(format!("{}: {e}", adapter.name()));
                continue;
            }
        };
        report.sources_scraped += 1;
        report.items_found += raw.len();

        for mut item in raw {
            item.title = normalize_text(&item.title);
            item.body = normalize_text(&item.body);
            match store.ingest(item) {
                Ok(IngestOutcome::Inserted(_)) => report.items_new += 1,
                Ok(IngestOutcome::Deduplicated) => report.items_duplicate += 1,
                Err(e) => {
                    tracing::debug!(source = adapter.name(), error = %e, "item dropped");
                    report.items_invalid += 1;
                }
            }
        }
    }

    counter!("scrape_items_new_total").increment(report.items_new as u64);
    counter!("scrape_items_duplicate_total").increment(report.items_duplicate as u64);
    tracing::info!(
        sources = report.sources_scraped,
        found = report.items_found,
        new = report.items_new,
        duplicate = report.items_duplicate,
        invalid = report.items_invalid,
        "scrape run complete"
    );
    report
}
