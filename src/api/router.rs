//! HTTP router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//!
//! NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Room for multipart boundaries and headers on top of the file itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn api_router(core: Arc<CoreState>) -> Router {
    let body_limit = core.config().max_upload_bytes + FORM_OVERHEAD_BYTES;
    let ctx = ApiContext::new(core);

    Router::new()
        .route("/predict", post(endpoints::predict::predict))
        .route("/download_report/:id", get(endpoints::reports::download))
        .route("/health", get(endpoints::health::check))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}
