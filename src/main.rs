//! This file defines the det-ingest binary entry point.

use det_ingest::app;
use det_ingest::app_state::AppState;
use det_ingest::cli;
use det_ingest::metrics;
use det_ingest::server;
use det_ingest::tracing;

use std::process::exit;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    ::tracing::debug!("{:?}", args);
    metrics::register_metrics();
    let state = match AppState::new(&args).await {
        Ok(state) => state,
        Err(err) => {
            ::tracing::error!("failed to initialise: {}", err.to_detail_string());
            exit(1)
        }
    };
    let service = app::service(state);
    server::serve(&args, service).await;
    tracing::shutdown_tracing();
}
