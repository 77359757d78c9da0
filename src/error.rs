//! Typed failures returned by the planning and persistence layers.
//!
//! Nothing here is thrown: callers pattern-match on the variant to pick a
//! recovery path (revert, retry, or re-fetch to discover the real state).

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorderError {
    /// The move is structurally impossible. Detected before any store call.
    #[error("invalid move: {0}")]
    InvalidMove(String),

    /// A computed position set is not exactly `0..N-1`. Indicates a bug in
    /// the flattening step; never retried.
    #[error("invalid sort order payload: {0}")]
    InvalidPayload(String),

    /// The store returned an error or a non-success result.
    #[error("persistence failed after {attempts} attempt(s): {error}")]
    PersistenceFailure {
        error: String,
        message: Option<String>,
        attempts: u32,
    },

    /// The deadline elapsed first. The store call may still commit.
    #[error("persistence did not finish within {0:?}; outcome unknown")]
    Timeout(Duration),
}

impl ReorderError {
    pub fn invalid_move(reason: impl Into<String>) -> Self {
        Self::InvalidMove(reason.into())
    }

    /// Wrap a collaborator error from a single, non-retried store call.
    pub fn store(err: anyhow::Error) -> Self {
        Self::PersistenceFailure {
            error: format!("{:#}", err),
            message: None,
            attempts: 1,
        }
    }

    /// Stable tag exposed to HTTP callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMove(_) => "invalid_move",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::PersistenceFailure { .. } => "persistence_failure",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidMove(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidPayload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PersistenceFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}
