//! CLI argument parsing, layered over the env-driven `PipelineConfig` from
//! `barcode-core`: a flag wins over its matching env var where `clap`'s
//! `env` feature supplies one, otherwise the env value (or the built-in
//! default) applies.

use std::time::Duration;

use anyhow::{Context, Result};
use barcode_core::{JobType, PipelineConfig};
use barcode_store::AzureBlobStore;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Reaps expired leases and seeds new jobs from pipeline state")]
pub struct DispatcherArgs {
    #[arg(long, env = "WORKER_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: u32,

    #[arg(long, env = "WORKER_POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval: u64,

    /// Run exactly one reap-and-seed cycle, then exit.
    #[arg(long)]
    pub once: bool,

    /// Print the stats histogram and exit without running the control loop.
    #[arg(long)]
    pub stats: bool,

    #[arg(long)]
    pub batch_id: Option<String>,
}

impl DispatcherArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

#[derive(Debug, Parser)]
#[command(about = "Leases and processes jobs of one job type")]
pub struct WorkerArgs {
    #[arg(long, value_enum)]
    pub job_type: CliJobType,

    #[arg(long, env = "WORKER_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: u32,

    #[arg(long, env = "WORKER_POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval: u64,

    /// Run a single lease-and-process cycle, then exit.
    #[arg(long)]
    pub once: bool,

    /// Loop until terminated (the default if neither flag is passed).
    #[arg(long)]
    pub continuous: bool,

    #[arg(long, default_value_t = 60)]
    pub lease_seconds: i64,

    /// Worker identity recorded on leased jobs; defaults to a generated id.
    #[arg(long)]
    pub worker_id: Option<String>,
}

impl WorkerArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn run_once(&self) -> bool {
        self.once && !self.continuous
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliJobType {
    Preprocess,
    DecodePrimary,
    DecodeFallback,
    Cleanup,
}

impl From<CliJobType> for JobType {
    fn from(v: CliJobType) -> Self {
        match v {
            CliJobType::Preprocess => JobType::Preprocess,
            CliJobType::DecodePrimary => JobType::DecodePrimary,
            CliJobType::DecodeFallback => JobType::DecodeFallback,
            CliJobType::Cleanup => JobType::Cleanup,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Manual-review HTTP surface")]
pub struct ReviewServerArgs {
    #[arg(long, env = "REVIEW_SERVER_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,
}

/// Initializes the global `tracing` subscriber honoring `LOG_LEVEL`
/// (env-filter directive) and `LOG_FORMAT` (`text` default, `json`).
pub fn init_tracing(log_level: &str, log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Builds the Azure blob store from whichever credential `PipelineConfig`
/// found: connection string or account URL, mutually exclusive.
pub fn build_blob_store(config: &PipelineConfig) -> Result<AzureBlobStore> {
    if let Some(conn) = &config.azure_storage_connection_string {
        AzureBlobStore::from_connection_string(conn, &config.azure_storage_container).map_err(|e| anyhow::anyhow!(e))
    } else {
        let url = config
            .azure_storage_account_url
            .as_deref()
            .context("no Azure storage credentials configured")?;
        AzureBlobStore::from_account_url(url, &config.azure_storage_container).map_err(|e| anyhow::anyhow!(e))
    }
}
