//! Upload endpoint: one pipeline run per request.
//!
//! `POST /predict` takes a multipart form with a `file` part (the image) and
//! an optional `modality` part that bypasses OCR-based detection.

use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::pipeline::orchestrator::RunOptions;
use crate::pipeline::report::ReportSummary;
use crate::pipeline::{Modality, PipelineError};

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub status: &'static str,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub summary: ReportSummary,
    /// Relative URL of the one-shot PDF download.
    pub pdf_report: String,
    pub elapsed_ms: u64,
}

struct UploadForm {
    bytes: Vec<u8>,
    content_type: Option<String>,
    modality: Option<Modality>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut file: Option<(Vec<u8>, Option<String>)> = None;
    let mut modality = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Cannot read file part: {e}")))?;
                file = Some((bytes.to_vec(), content_type));
            }
            Some("modality") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Cannot read modality: {e}")))?;
                if !value.trim().is_empty() {
                    modality = Some(Modality::parse(&value).ok_or_else(|| {
                        ApiError::BadRequest(format!(
                            "Unknown modality {value:?}; expected ct_scan or text_report"
                        ))
                    })?);
                }
            }
            _ => {}
        }
    }

    let (bytes, content_type) =
        file.ok_or_else(|| ApiError::BadRequest("No file part in the request".into()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("No selected file".into()));
    }
    Ok(UploadForm {
        bytes,
        content_type,
        modality,
    })
}

/// `POST /predict`
pub async fn predict(
    State(ctx): State<ApiContext>,
    multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let form = read_form(multipart).await?;
    let core = ctx.core.clone();

    // The pipeline is synchronous and CPU-bound.
    let run = tokio::task::spawn_blocking(move || {
        let artifact = core.stage_upload(&form.bytes, form.content_type.as_deref())?;
        let options = RunOptions {
            modality_override: form.modality,
        };
        Ok::<_, PipelineError>(core.run_pipeline(artifact, options))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Pipeline task failed: {e}")))??;

    let elapsed_ms = run.elapsed.as_millis() as u64;
    let completed = run.outcome?;

    Ok(Json(PredictResponse {
        status: "success",
        run_id: run.run_id,
        summary: completed.summary,
        pdf_report: format!("/download_report/{}", completed.report_id),
        elapsed_ms,
    }))
}
