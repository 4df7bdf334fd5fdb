//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::pipeline::orchestrator::{RunFailure, RunStage};
use crate::pipeline::{ErrorKind, PipelineError};

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    /// Pipeline stage that failed, for run errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<RunStage>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Pipeline failed: {error}")]
    Pipeline {
        error: PipelineError,
        stage: Option<RunStage>,
    },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", detail.clone())
            }
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone()),
            ApiError::Pipeline { error, .. } => match error.kind() {
                ErrorKind::InvalidRequest => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST", error.to_string())
                }
                ErrorKind::InvalidImage => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "INVALID_IMAGE",
                    error.to_string(),
                ),
                ErrorKind::OcrFailure => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "OCR_FAILURE",
                    error.to_string(),
                ),
                ErrorKind::InferenceFailure => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INFERENCE_FAILURE",
                    error.to_string(),
                ),
                ErrorKind::RenderingFailure => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "RENDERING_FAILURE",
                    error.to_string(),
                ),
                ErrorKind::ExplanationUnavailable | ErrorKind::Storage => {
                    tracing::error!(error = %error, "Pipeline internal error");
                    internal()
                }
            },
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                internal()
            }
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "An internal error occurred".to_string(),
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let stage = match &self {
            ApiError::Pipeline { stage, .. } => *stage,
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message,
                stage,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        ApiError::Pipeline { error, stage: None }
    }
}

impl From<RunFailure> for ApiError {
    fn from(failure: RunFailure) -> Self {
        ApiError::Pipeline {
            error: failure.error,
            stage: Some(failure.stage),
        }
    }
}
