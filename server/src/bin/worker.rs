//! Worker binary: leases and processes jobs of one `--job-type`.
//!
//! The primary decoder and the pixel-level normalizer are external
//! collaborators whose interfaces are specified but whose implementations
//! are not; no concrete crate in this workspace's dependency stack
//! implements either. This binary runs those two stages against their
//! in-memory reference collaborators and logs a warning — a real deployment
//! supplies its own `ImageNormalizer`/`PrimaryDecoder` and links them in
//! here.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use barcode_core::{JobType, PipelineConfig};
use barcode_engine::clients::fakes::{PassthroughNormalizer, ScriptedPrimaryDecoder};
use barcode_engine::clients::GeminiLlmClient;
use barcode_engine::handlers::cleanup::CleanupHandler;
use barcode_engine::handlers::decode_fallback::DecodeFallbackHandler;
use barcode_engine::handlers::decode_primary::DecodePrimaryHandler;
use barcode_engine::handlers::preprocess::PreprocessHandler;
use barcode_engine::{StageHandler, Worker, WorkerConfig};
use barcode_pipeline_server::config::{build_blob_store, init_tracing, WorkerArgs};
use barcode_queue::JobQueue;
use barcode_store::{BlobStore, MetadataStore, MongoMetadataStore};
use chrono::Duration;
use clap::Parser;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let args = WorkerArgs::parse();
    let job_type: JobType = args.job_type.into();

    let config = if job_type == JobType::DecodeFallback {
        PipelineConfig::from_env().context("loading pipeline configuration")?
    } else {
        PipelineConfig::from_env_without_gemini().context("loading pipeline configuration")?
    };
    init_tracing(&config.log_level, &config.log_format);

    let metadata_store: Arc<dyn MetadataStore> = Arc::new(
        MongoMetadataStore::connect(&config.mongodb_uri, "barcode_pipeline")
            .await
            .context("connecting to metadata store")?,
    );
    let blob_store: Arc<dyn BlobStore> = Arc::new(build_blob_store(&config)?);

    if job_type == JobType::Cleanup {
        let handler = CleanupHandler::new(blob_store, metadata_store, config.retention_days as i64);
        let report = handler.run_once(args.batch_size).await.context("running cleanup sweep")?;
        tracing::info!(moved = report.moved, skipped = report.skipped, "cleanup sweep complete");
        return Ok(());
    }

    let handler: Arc<dyn StageHandler> = match job_type {
        JobType::Preprocess => {
            tracing::warn!("preprocess stage is running against the in-memory reference normalizer; wire a real ImageNormalizer for production use");
            Arc::new(PreprocessHandler::new(
                blob_store,
                metadata_store.clone(),
                Arc::new(PassthroughNormalizer),
                config.preprocess_max_dimension,
                config.preprocess_denoise_strength,
            ))
        }
        JobType::DecodePrimary => {
            tracing::warn!("decode_primary stage is running against the in-memory reference decoder; wire a real PrimaryDecoder for production use");
            Arc::new(DecodePrimaryHandler::new(blob_store, Arc::new(ScriptedPrimaryDecoder::returning_none())))
        }
        JobType::DecodeFallback => {
            let llm = GeminiLlmClient::new(
                config.gemini_api_key.clone(),
                config.gemini_model.clone(),
                config.gemini_max_tokens,
                config.gemini_temperature,
                StdDuration::from_secs(config.gemini_timeout_secs),
            )?;
            Arc::new(DecodeFallbackHandler::new(blob_store, Arc::new(llm)))
        }
        JobType::Cleanup => unreachable!("handled above"),
    };

    let worker_id = args.worker_id.clone().unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let queue = Arc::new(JobQueue::new(metadata_store.clone()));
    let worker = Worker::new(
        WorkerConfig {
            job_type,
            worker_id,
            poll_interval: args.poll_interval(),
            lease_duration: Duration::seconds(args.lease_seconds),
            batch_size: args.batch_size,
            once: args.run_once(),
        },
        queue,
        metadata_store,
        handler,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}
