//! Environment-driven configuration.
//!
//! Hand-parsed from `std::env`, reading individual env vars with
//! `unwrap_or_else` defaults rather than pulling in a schema-validated
//! config crate. Required keys missing at startup are a fatal configuration
//! error: the caller is expected to log and exit non-zero.

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mongodb_uri: String,
    pub azure_storage_connection_string: Option<String>,
    pub azure_storage_account_url: Option<String>,
    pub azure_storage_container: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_max_tokens: u32,
    pub gemini_temperature: f32,
    pub gemini_timeout_secs: u64,
    pub worker_poll_interval_secs: u64,
    pub worker_batch_size: u32,
    pub worker_max_retries: u32,
    pub preprocess_max_dimension: u32,
    pub preprocess_denoise_strength: f32,
    pub log_level: String,
    pub log_format: String,
    pub retention_days: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String, PipelineError> {
    std::env::var(key).map_err(|_| {
        PipelineError::FatalConfig(format!("missing required environment variable {key}"))
    })
}

impl PipelineConfig {
    /// Load configuration from the process environment. Fails fast on any
    /// missing required key.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::load(true)
    }

    /// Load configuration that doesn't need the Gemini/fallback client
    /// (e.g. the preprocess-only worker or the review server), so those
    /// binaries don't fail startup over an unrelated missing key.
    pub fn from_env_without_gemini() -> Result<Self, PipelineError> {
        Self::load(false)
    }

    fn load(require_gemini: bool) -> Result<Self, PipelineError> {
        let mongodb_uri = env_required("MONGODB_URI")?;

        let azure_storage_connection_string = std::env::var("AZURE_STORAGE_CONNECTION_STRING").ok();
        let azure_storage_account_url = std::env::var("AZURE_STORAGE_ACCOUNT_URL").ok();
        if azure_storage_connection_string.is_none() && azure_storage_account_url.is_none() {
            return Err(PipelineError::FatalConfig(
                "one of AZURE_STORAGE_CONNECTION_STRING or AZURE_STORAGE_ACCOUNT_URL is required"
                    .to_string(),
            ));
        }

        let gemini_api_key = if require_gemini {
            env_required("GEMINI_API_KEY")?
        } else {
            std::env::var("GEMINI_API_KEY").unwrap_or_default()
        };

        Ok(Self {
            mongodb_uri,
            azure_storage_connection_string,
            azure_storage_account_url,
            azure_storage_container: env_or("AZURE_STORAGE_CONTAINER", "images"),
            gemini_api_key,
            gemini_model: env_or("GEMINI_MODEL", "gemini-1.5-flash"),
            gemini_max_tokens: env_parse_or("GEMINI_MAX_TOKENS", 1024),
            gemini_temperature: env_parse_or("GEMINI_TEMPERATURE", 0.0),
            gemini_timeout_secs: env_parse_or("GEMINI_TIMEOUT", 30),
            worker_poll_interval_secs: env_parse_or("WORKER_POLL_INTERVAL", 5),
            worker_batch_size: env_parse_or("WORKER_BATCH_SIZE", 10),
            worker_max_retries: env_parse_or("WORKER_MAX_RETRIES", 3),
            preprocess_max_dimension: env_parse_or("PREPROCESS_MAX_DIMENSION", 2048),
            preprocess_denoise_strength: env_parse_or("PREPROCESS_DENOISE_STRENGTH", 0.5),
            log_level: env_or("LOG_LEVEL", "info"),
            log_format: env_or("LOG_FORMAT", "text"),
            retention_days: env_parse_or("RETENTION_DAYS", 30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_mongodb_uri_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("MONGODB_URI");
        let result = PipelineConfig::from_env();
        assert!(matches!(result, Err(PipelineError::FatalConfig(_))));
    }

    #[test]
    fn full_env_parses_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MONGODB_URI", "mongodb://localhost:27017");
        std::env::set_var("AZURE_STORAGE_ACCOUNT_URL", "https://acct.blob.core.windows.net");
        std::env::set_var("GEMINI_API_KEY", "test-key");
        std::env::remove_var("AZURE_STORAGE_CONNECTION_STRING");

        let cfg = PipelineConfig::from_env().unwrap();
        assert_eq!(cfg.azure_storage_container, "images");
        assert_eq!(cfg.worker_max_retries, 3);
        assert_eq!(cfg.retention_days, 30);

        std::env::remove_var("MONGODB_URI");
        std::env::remove_var("AZURE_STORAGE_ACCOUNT_URL");
        std::env::remove_var("GEMINI_API_KEY");
    }
}
