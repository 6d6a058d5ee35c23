//! Error taxonomy. These are error *kinds*, not a single enum of every
//! possible failure — handlers classify whatever underlying error they hit
//! (blob I/O, store I/O, LLM transport, malformed input) into one of these
//! and hand the classification to the Job Queue, which owns retry policy.

use thiserror::Error;

/// A classified pipeline failure, as produced by a Stage Handler.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Blob fetch/put, store, or LLM network fault.
    #[error("transient I/O error in {stage}: {message}")]
    TransientIo { stage: String, message: String },

    /// LLM 429 or equivalent.
    #[error("rate limited in {stage}: {message}")]
    RateLimited { stage: String, message: String },

    /// Unreadable/empty blob or malformed response.
    #[error("invalid input in {stage}: {message}")]
    InputInvalid { stage: String, message: String },

    /// Conditional update lost the race; not a failure.
    #[error("state conflict in {stage}: expected image to still be in its prior status")]
    StateConflict { stage: String },

    /// Worker's lease expired before it could commit.
    #[error("lease expired in {stage} before handler completed")]
    LeaseExpired { stage: String },

    /// Required configuration missing at startup.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl PipelineError {
    /// Whether the Job Queue should requeue this job.
    /// `StateConflict` is handled separately by the worker (it completes
    /// the job with `skipped=true` rather than failing it) and should never
    /// reach `fail()`, but is classified `false` here defensively.
    pub fn retriable(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::RateLimited { .. })
    }

    pub fn stage(&self) -> &str {
        match self {
            Self::TransientIo { stage, .. }
            | Self::RateLimited { stage, .. }
            | Self::InputInvalid { stage, .. }
            | Self::StateConflict { stage }
            | Self::LeaseExpired { stage } => stage,
            Self::FatalConfig(_) => "config",
        }
    }

    pub fn transient_io(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::TransientIo {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn rate_limited(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::RateLimited {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn input_invalid(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InputInvalid {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn state_conflict(stage: impl Into<String>) -> Self {
        Self::StateConflict { stage: stage.into() }
    }

    pub fn lease_expired(stage: impl Into<String>) -> Self {
        Self::LeaseExpired { stage: stage.into() }
    }
}
