//! Error taxonomy for the pipeline. Variants map 1:1 to the admin surface's
//! structured error responses; see `api::ApiError` for the HTTP side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input. Not retried, surfaced to the caller.
    #[error("validation: {0}")]
    Validation(String),

    /// Invariant violation (duplicate verdict, concurrent in-flight
    /// newsletter, bad state transition). Not retried.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// AI provider failure or malformed reply. The item stays `scraped`
    /// so a later batch retries it.
    #[error("classification: {0}")]
    Classification(String),

    /// Email-campaign provider failure. The newsletter moves to `failed`;
    /// re-sending requires a manual trigger.
    #[error("delivery: {0}")]
    Delivery(String),

    /// Only sendable newsletters reach the gateway.
    #[error("newsletter {0} is not approved")]
    NotApproved(i64),

    /// Empty selection window. Informational, not a fault: no newsletter
    /// record is created.
    #[error("insufficient content: {0}")]
    InsufficientContent(String),

    /// Snapshot I/O or corruption. Genuine fault, always propagated.
    #[error("storage: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
