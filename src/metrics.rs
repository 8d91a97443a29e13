use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and describe the pipeline series
    /// so they show up on `/metrics` before their first increment.
    pub fn init() -> Self {
        let builder = PrometheusBuilder::new();
        let handle = builder.install_recorder().expect("prometheus: install recorder");

        describe_counter!("scrape_items_new_total", "New content items stored by scrape runs.");
        describe_counter!("scrape_items_duplicate_total", "Items dropped by fingerprint dedup.");
        describe_counter!("scrape_adapter_errors_total", "Adapter fetch/parse errors.");
        describe_counter!("filter_approved_total", "Content items approved by the AI filter.");
        describe_counter!("filter_rejected_total", "Content items rejected by the AI filter.");
        describe_counter!("filter_errored_total", "Items left scraped after classification errors.");
        describe_counter!("newsletters_composed_total", "Newsletters drafted by the composer.");
        describe_counter!("newsletters_approved_total", "Newsletter approvals, by actor.");
        describe_counter!("newsletters_rejected_total", "Newsletters rejected by the operator.");
        describe_counter!("newsletters_sent_total", "Newsletters delivered to the campaign provider.");
        describe_counter!("newsletters_failed_total", "Newsletters parked in failed after delivery errors.");
        describe_counter!("job_runs_total", "Job executions, by job name.");
        describe_counter!("job_coalesced_total", "Coalesced duplicate triggers, by job name.");
        describe_gauge!("pipeline_pending_newsletter", "1 when a newsletter awaits approval/send.");

        Self { handle }
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
