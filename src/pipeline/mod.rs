//! Dual-modality triage pipeline.
//!
//! raw bytes → detection → {CT image path | text report path} → inference →
//! explanation → report assembly → rendering. Every stage is a trait-backed
//! service so the orchestrator stays testable with mock oracles.

pub mod types;
pub mod artifact;
pub mod ocr;
pub mod detection;
pub mod preprocess;
pub mod text;
pub mod models;
pub mod inference;
pub mod explain;
pub mod report;
pub mod render;
pub mod store;
pub mod orchestrator; // Run state machine + artifact lifecycle

pub use types::*;
pub use orchestrator::{PipelineOrchestrator, PipelineRun, RunOptions, RunStage};

use serde::Serialize;
use thiserror::Error;

use models::OracleError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("OCR failed: {0}")]
    OcrFailure(String),

    #[error("Inference failed: {0}")]
    InferenceFailure(String),

    #[error("Explanation unavailable: {0}")]
    ExplanationUnavailable(String),

    #[error("Rendering failed: {0}")]
    RenderingFailure(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Caller-visible error category, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidImage,
    OcrFailure,
    InferenceFailure,
    ExplanationUnavailable,
    RenderingFailure,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidImage => "invalid_image",
            Self::OcrFailure => "ocr_failure",
            Self::InferenceFailure => "inference_failure",
            Self::ExplanationUnavailable => "explanation_unavailable",
            Self::RenderingFailure => "rendering_failure",
            Self::Storage => "storage",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InvalidImage(_) => ErrorKind::InvalidImage,
            Self::OcrFailure(_) => ErrorKind::OcrFailure,
            Self::InferenceFailure(_) => ErrorKind::InferenceFailure,
            Self::ExplanationUnavailable(_) => ErrorKind::ExplanationUnavailable,
            Self::RenderingFailure(_) => ErrorKind::RenderingFailure,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only a missing explanation is absorbed; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ExplanationUnavailable(_))
    }
}

impl From<OracleError> for PipelineError {
    fn from(err: OracleError) -> Self {
        PipelineError::InferenceFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explanation_unavailable_is_the_only_non_fatal_kind() {
        let errors = [
            PipelineError::InvalidRequest("empty".into()),
            PipelineError::InvalidImage("garbage".into()),
            PipelineError::OcrFailure("exit 1".into()),
            PipelineError::InferenceFailure("shape".into()),
            PipelineError::RenderingFailure("font".into()),
            PipelineError::Storage(std::io::Error::new(std::io::ErrorKind::Other, "disk")),
        ];
        assert!(errors.iter().all(PipelineError::is_fatal));
        assert!(!PipelineError::ExplanationUnavailable("explainer".into()).is_fatal());
    }

    #[test]
    fn oracle_errors_surface_as_inference_failures() {
        let err: PipelineError = OracleError::MalformedOutput("2 scores".into()).into();
        assert_eq!(err.kind(), ErrorKind::InferenceFailure);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidImage).unwrap();
        assert_eq!(json, "\"invalid_image\"");
        assert_eq!(ErrorKind::RenderingFailure.as_str(), "rendering_failure");
    }
}
