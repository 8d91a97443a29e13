//! Binary entrypoint: wire configuration, the store, the external-service
//! clients, and the orchestrator, then serve the admin surface.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use civic_digest::api::{self, AppState};
use civic_digest::compose::Composer;
use civic_digest::config::{self, Settings};
use civic_digest::deliver::{
    CampaignProvider, DeliveryGateway, DryRunCampaignProvider, HttpCampaignProvider,
    LogPreviewSender, PreviewSender, SmtpPreviewSender,
};
use civic_digest::filter::client::build_client_from_env;
use civic_digest::filter::FilterEngine;
use civic_digest::ingest::adapters::build_adapters;
use civic_digest::metrics::Metrics;
use civic_digest::retry::RetryPolicy;
use civic_digest::scheduler::{Orchestrator, SchedulerCfg};
use civic_digest::store::Store;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("civic_digest=info,warn"));
    tracing_subscriber::registry().with(filter).with(fmt::layer().compact()).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env();
    let metrics = Metrics::init();

    let store = Arc::new(Store::open(&settings.data_path)?);

    let retry = RetryPolicy::new(
        settings.api_retry_attempts,
        Duration::from_millis(settings.api_retry_base_ms),
        Duration::from_millis(settings.api_retry_max_ms),
    );
    let timeout = settings.api_timeout();

    let reasoning = build_client_from_env(timeout);
    let engine = FilterEngine::new(Arc::clone(&reasoning), retry, timeout);
    let composer = Composer::new(Arc::clone(&reasoning), settings.featured_rule, retry, timeout);

    let campaign: Arc<dyn CampaignProvider> = match HttpCampaignProvider::from_env(timeout) {
        Some(p) => Arc::new(p),
        None => {
            tracing::warn!("campaign provider not configured, deliveries run dry");
            Arc::new(DryRunCampaignProvider::new())
        }
    };
    let gateway = DeliveryGateway::new(campaign, retry);

    let preview: Arc<dyn PreviewSender> = match settings
        .manager_email
        .as_deref()
        .and_then(SmtpPreviewSender::from_env)
    {
        Some(sender) => Arc::new(sender),
        None => {
            tracing::warn!("SMTP or MANAGER_EMAIL not configured, previews go to the log");
            Arc::new(LogPreviewSender)
        }
    };

    let sources = config::load_sources_default()?;
    tracing::info!(sources = sources.len(), "loaded scrape sources");
    let adapters = build_adapters(&sources);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        engine,
        composer,
        gateway,
        preview,
        adapters,
        SchedulerCfg::from_settings(&settings),
    ));
    orchestrator.reconcile_on_start()?;
    let _jobs = orchestrator.start();

    let state = AppState { store, orch: orchestrator };
    let app = api::create_router(state).merge(metrics.router());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "civic-digest listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
