//! Admin HTTP surface. Each route maps 1:1 onto a core operation and
//! returns the pipeline's error taxonomy as structured JSON. Duplicate
//! triggers of an in-flight job get the coalesced result, not an error.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::PipelineError;
use crate::model::ContentState;
use crate::scheduler::{JobOutcome, Orchestrator};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub orch: Arc<Orchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/admin/scrape/trigger", post(trigger_scrape))
        .route("/admin/filter/trigger", post(trigger_filter))
        .route("/admin/newsletter/generate", post(generate_newsletter))
        .route("/admin/newsletter/send", post(send_newsletter))
        .route("/admin/newsletter/approve", post(approve_newsletter))
        .route("/admin/newsletter/reject", post(reject_newsletter))
        .route("/content/pending", get(pending_content))
        .route("/content/approved", get(approved_content))
        .route("/stats/overview", get(stats_overview))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// JSON envelope for the pipeline error taxonomy.
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            PipelineError::NotApproved(_) => (StatusCode::CONFLICT, "not_approved"),
            PipelineError::InsufficientContent(_) => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_content"),
            PipelineError::Classification(_) => (StatusCode::BAD_GATEWAY, "classification"),
            PipelineError::Delivery(_) => (StatusCode::BAD_GATEWAY, "delivery"),
            PipelineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };
        let body = Json(json!({ "error": kind, "message": self.0.to_string() }));
        (status, body).into_response()
    }
}

fn already_running() -> Json<serde_json::Value> {
    Json(json!({ "status": "already_running" }))
}

async fn trigger_scrape(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.orch.trigger_scrape().await {
        JobOutcome::Completed(report) => Json(json!({ "status": "completed", "report": report })),
        JobOutcome::Coalesced => already_running(),
    }
}

async fn trigger_filter(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.orch.trigger_filter().await {
        JobOutcome::Completed(report) => Json(json!({ "status": "completed", "report": report })),
        JobOutcome::Coalesced => already_running(),
    }
}

async fn generate_newsletter(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orch.trigger_compose().await {
        JobOutcome::Completed(Ok(newsletter)) => {
            Ok(Json(json!({ "status": "completed", "newsletter": newsletter })))
        }
        JobOutcome::Completed(Err(e)) => Err(e.into()),
        JobOutcome::Coalesced => Ok(already_running()),
    }
}

async fn send_newsletter(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orch.send_now().await {
        JobOutcome::Completed(Ok(receipt)) => {
            Ok(Json(json!({ "status": "completed", "receipt": receipt })))
        }
        JobOutcome::Completed(Err(e)) => Err(e.into()),
        JobOutcome::Coalesced => Ok(already_running()),
    }
}

#[derive(Deserialize)]
struct NewsletterRef {
    newsletter_id: i64,
}

async fn approve_newsletter(
    State(state): State<AppState>,
    Json(body): Json<NewsletterRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let newsletter = state.orch.approve(body.newsletter_id).await?;
    Ok(Json(json!({ "status": "completed", "newsletter": newsletter })))
}

async fn reject_newsletter(
    State(state): State<AppState>,
    Json(body): Json<NewsletterRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let newsletter = state.orch.reject(body.newsletter_id)?;
    Ok(Json(json!({ "status": "completed", "newsletter": newsletter })))
}

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
}

async fn pending_content(
    State(state): State<AppState>,
    Query(q): Query<PendingQuery>,
) -> Json<serde_json::Value> {
    let items = state.store.list_content(ContentState::Scraped, q.limit.unwrap_or(50));
    Json(json!({ "count": items.len(), "items": items }))
}

#[derive(Deserialize)]
struct ApprovedQuery {
    days: Option<i64>,
}

async fn approved_content(
    State(state): State<AppState>,
    Query(q): Query<ApprovedQuery>,
) -> Json<serde_json::Value> {
    let cutoff = Utc::now() - chrono::Duration::days(q.days.unwrap_or(7).max(0));
    let items = state.store.list_approved_since(cutoff);
    Json(json!({ "count": items.len(), "items": items }))
}

async fn stats_overview(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "content": state.store.stats(),
        "scheduler": state.store.load_scheduler_state(),
        "last_scrape": state.orch.last_scrape_report(),
    }))
}
