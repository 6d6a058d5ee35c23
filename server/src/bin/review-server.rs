//! Manual-review HTTP server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use barcode_core::PipelineConfig;
use barcode_pipeline_server::config::{init_tracing, ReviewServerArgs};
use barcode_pipeline_server::review_api::{router, ReviewState};
use barcode_store::{MetadataStore, MongoMetadataStore};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ReviewServerArgs::parse();
    let config = PipelineConfig::from_env_without_gemini().context("loading pipeline configuration")?;
    init_tracing(&config.log_level, &config.log_format);

    let metadata_store: Arc<dyn MetadataStore> = Arc::new(
        MongoMetadataStore::connect(&config.mongodb_uri, "barcode_pipeline")
            .await
            .context("connecting to metadata store")?,
    );

    let app = router(ReviewState::new(metadata_store)).layer(tower_http::trace::TraceLayer::new_for_http()).layer(tower_http::cors::CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.addr).await.context("binding review server address")?;
    tracing::info!(addr = %args.addr, "review server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("review server exited")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
