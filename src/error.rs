// 🧯 Pipeline Errors - Typed Failures at the Seams
// Transient extraction failures are retried; integrity failures surface the
// document as FAILED; illegal lifecycle moves are rejected, never silently dropped.

use thiserror::Error;

use crate::document::DocumentStatus;

/// Errors produced by the extraction client and its retry loop.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Retryable upstream failure (HTTP 408/429/5xx, dropped connection).
    /// Consumes one attempt from the retry budget.
    #[error("transient extraction failure (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// The call exceeded its deadline. Counts as a failed attempt,
    /// never a silent hang.
    #[error("extraction attempt timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Non-retryable rejection from the model endpoint (4xx other than 408/429).
    #[error("extraction rejected by model endpoint (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The model answered but the payload is unusable (missing classification
    /// or extracted fields). Surfaces the document as FAILED.
    #[error("extraction payload missing required structure: {0}")]
    MalformedPayload(String),

    /// Every attempt and the OCR fallback failed.
    #[error("extraction exhausted after {attempts} attempts and OCR fallback: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ExtractError {
    /// Whether this failure should consume a retry attempt and try again.
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractError::Transient { .. } | ExtractError::Timeout { .. } => true,
            ExtractError::Http(e) => e.is_timeout() || e.is_connect(),
            ExtractError::Rejected { .. }
            | ExtractError::MalformedPayload(_)
            | ExtractError::Exhausted { .. } => false,
        }
    }
}

/// Rejected document lifecycle transition (e.g. approving a FAILED document).
#[derive(Debug, Error)]
#[error("illegal status transition {from:?} -> {to:?}: {detail}")]
pub struct StateError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
    pub detail: String,
}

impl StateError {
    pub fn new(from: DocumentStatus, to: DocumentStatus, detail: impl Into<String>) -> Self {
        StateError {
            from,
            to,
            detail: detail.into(),
        }
    }
}

/// Push of a learned rule to the external memory channel failed.
/// Retried on the next cycle; never blocks document processing.
#[derive(Debug, Error)]
#[error("learning sync failed for field '{field}': {message}")]
pub struct LearningSyncError {
    pub field: String,
    pub message: String,
}
