//! Dispatcher binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use barcode_core::PipelineConfig;
use barcode_engine::{Dispatcher, DispatcherConfig};
use barcode_pipeline_server::config::{init_tracing, DispatcherArgs};
use barcode_queue::JobQueue;
use barcode_store::{MetadataStore, MongoMetadataStore};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = DispatcherArgs::parse();
    let config = PipelineConfig::from_env_without_gemini().context("loading pipeline configuration")?;
    init_tracing(&config.log_level, &config.log_format);

    let metadata_store: Arc<dyn MetadataStore> = Arc::new(
        MongoMetadataStore::connect(&config.mongodb_uri, "barcode_pipeline")
            .await
            .context("connecting to metadata store")?,
    );

    if args.stats {
        let stats = metadata_store.stats(args.batch_id.as_deref()).await.context("computing stats")?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let queue = Arc::new(JobQueue::new(metadata_store.clone()));
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            poll_interval: args.poll_interval(),
            batch_size: args.batch_size,
            once: args.once,
        },
        queue,
        metadata_store,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;
    Ok(())
}
