//! HTTP surface.
//!
//! `POST /predict` runs the pipeline over one upload, `GET
//! /download_report/:id` hands out the rendered PDF once, `GET /health`
//! reports liveness. Handlers stay thin: the pipeline runs on the blocking
//! pool through `CoreState`.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer, ServerSession};
pub use types::ApiContext;
