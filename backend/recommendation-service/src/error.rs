/// Error types for the recommendation service
///
/// Strategy-level and cache-level failures are absorbed inside the request
/// pipeline (see `ScoringError` and `FeatureError`). Only the variants below
/// reach callers.
use crate::services::artifacts::ArtifactError;
use crate::services::experiment::ExperimentError;
use crate::services::features::FeatureError;
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// Fatal for a request: nothing could be ranked.
    #[error("No candidates: {reason}")]
    NoCandidates { reason: String, degraded: bool },

    /// Invalid experiment, blend or service configuration. Raised at load time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cache fetch failure: {0}")]
    CacheFetchFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn no_candidates(reason: impl Into<String>, degraded: bool) -> Self {
        AppError::NoCandidates {
            reason: reason.into(),
            degraded,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ArtifactUnavailable(_) => "artifact_unavailable",
            AppError::NoCandidates { .. } => "no_candidates",
            AppError::Configuration(_) => "configuration_error",
            AppError::CacheFetchFailure(_) => "cache_fetch_failure",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether the failure happened while some signals were already missing.
    pub fn is_degraded(&self) -> bool {
        match self {
            AppError::NoCandidates { degraded, .. } => *degraded,
            AppError::ArtifactUnavailable(_) | AppError::CacheFetchFailure(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    degraded: bool,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NoCandidates { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ArtifactUnavailable(_) | AppError::CacheFetchFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
            degraded: self.is_degraded(),
        })
    }
}

impl From<ArtifactError> for AppError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Unavailable(_) => AppError::ArtifactUnavailable(err.to_string()),
            ArtifactError::Unregistered(_) => AppError::Configuration(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ExperimentError> for AppError {
    fn from(err: ExperimentError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<FeatureError> for AppError {
    fn from(err: FeatureError) -> Self {
        AppError::CacheFetchFailure(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}
