pub mod api;
pub mod config;
pub mod core_state;
pub mod pipeline;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::ServiceConfig;
use crate::core_state::{CoreError, CoreState};

/// Initialise the global subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

/// Load configuration and oracles, then serve until Ctrl-C.
pub async fn run() -> Result<(), CoreError> {
    init_tracing();
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = ServiceConfig::from_env()?;
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        work_dir = %config.work_dir.display(),
        "Configuration loaded"
    );

    let bind = config.bind;
    let core = Arc::new(CoreState::initialize(config)?);

    let mut server = api::start_api_server(core, bind)
        .await
        .map_err(CoreError::Server)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {e}");
    }
    server.shutdown();
    server.join().await;
    Ok(())
}
