//! One-shot report download.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

/// `GET /download_report/:id`: serve the PDF once, then it is gone.
pub async fn download(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    // Anything that is not a UUID cannot name a report.
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Report not found".into()))?;
    let core = ctx.core.clone();

    let bytes = tokio::task::spawn_blocking(move || core.take_report(&id))
        .await
        .map_err(|e| ApiError::Internal(format!("Download task failed: {e}")))??
        .ok_or_else(|| ApiError::NotFound("Report not found or already downloaded".into()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"report_{id}.pdf\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
