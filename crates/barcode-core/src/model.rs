//! Domain types for the barcode pipeline: `Image`, `Detection`, `Job`, and
//! their status enums.
//!
//! These are plain serializable records — no document-modeling library with
//! runtime schema validation. Validation of untrusted input happens at the
//! store/HTTP boundary, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validator::Symbology;

/// Image status machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Preprocessing,
    Preprocessed,
    DecodingPrimary,
    DecodedPrimary,
    DecodingFallback,
    DecodedFallback,
    ManualReview,
    DecodedManual,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preprocessing => "preprocessing",
            Self::Preprocessed => "preprocessed",
            Self::DecodingPrimary => "decoding_primary",
            Self::DecodedPrimary => "decoded_primary",
            Self::DecodingFallback => "decoding_fallback",
            Self::DecodedFallback => "decoded_fallback",
            Self::ManualReview => "manual_review",
            Self::DecodedManual => "decoded_manual",
            Self::Failed => "failed",
        }
    }

    /// Terminal states: no handler ever transitions out of these except
    /// `Failed`, which can re-enter `decoding_fallback`.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            Self::DecodedPrimary | Self::DecodedFallback | Self::DecodedManual
        )
    }

    /// The exhaustive transition table. Returns `true` iff
    /// `self -> to` is a permitted transition for the image status machine
    /// alone (additional guards such as `needs_fallback` or
    /// `fallback_attempts < 3` are checked by the caller, since they depend
    /// on fields outside this enum).
    pub fn can_transition_to(&self, to: ImageStatus) -> bool {
        use ImageStatus::*;
        matches!(
            (*self, to),
            (Pending, Preprocessing)
                | (Preprocessing, Preprocessed)
                | (Preprocessed, DecodingPrimary)
                | (DecodingPrimary, DecodedPrimary)
                | (DecodingPrimary, Preprocessed) // needs_fallback=true branch
                | (DecodingPrimary, ManualReview) // primary-path ambiguity
                | (Preprocessed, DecodingFallback)
                | (DecodingFallback, DecodedFallback)
                | (DecodingFallback, ManualReview)
                | (DecodingFallback, Failed)
                | (Failed, DecodingFallback)
                | (ManualReview, DecodedManual)
                | (ManualReview, Failed)
        )
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ImageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "preprocessing" => Ok(Self::Preprocessing),
            "preprocessed" => Ok(Self::Preprocessed),
            "decoding_primary" => Ok(Self::DecodingPrimary),
            "decoded_primary" => Ok(Self::DecodedPrimary),
            "decoding_fallback" => Ok(Self::DecodingFallback),
            "decoded_fallback" => Ok(Self::DecodedFallback),
            "manual_review" => Ok(Self::ManualReview),
            "decoded_manual" => Ok(Self::DecodedManual),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown image status: {other}")),
        }
    }
}

/// One recorded pipeline error; every error is appended here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineErrorRecord {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Preprocessing outputs recorded on an `Image`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessingRecord {
    pub normalized_path: Option<String>,
    pub rotation_paths: Vec<RotationArtifact>,
    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub processed_width: Option<u32>,
    pub processed_height: Option<u32>,
    pub grayscale: bool,
    pub clahe: bool,
    pub denoise: bool,
    pub duration_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationArtifact {
    pub angle_degrees: u16,
    pub path: String,
}

/// Decode attempt bookkeeping and fallback/retry counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub primary_attempts: u32,
    pub fallback_attempts: u32,
    pub needs_fallback: bool,
    pub llm_token_count: u64,
    pub errors: Vec<PipelineErrorRecord>,
}

/// The unit traversing the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub image_id: String,
    pub batch_id: String,
    pub source_path: String,
    pub source_filename: String,
    pub external_id: Option<String>,

    pub status: ImageStatus,
    pub status_updated_at: DateTime<Utc>,

    pub preprocessing: PreprocessingRecord,
    pub processing: ProcessingRecord,

    pub final_blob_path: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Image {
    pub fn new(image_id: impl Into<String>, batch_id: impl Into<String>, source_filename: impl Into<String>) -> Self {
        let now = Utc::now();
        let batch_id = batch_id.into();
        let source_filename = source_filename.into();
        Self {
            source_path: format!("incoming/{batch_id}/{source_filename}"),
            image_id: image_id.into(),
            batch_id,
            source_filename,
            external_id: None,
            status: ImageStatus::Pending,
            status_updated_at: now,
            preprocessing: PreprocessingRecord::default(),
            processing: ProcessingRecord::default(),
            final_blob_path: None,
            created_at: now,
        }
    }

    /// Moves the image to `to`, bumping `status_updated_at` (monotonic per
    /// image) so the Dispatcher's Failed-Retry delay and the cleanup
    /// sweep's retention window both measure from the most recent
    /// transition, not image creation.
    pub fn set_status(&mut self, to: ImageStatus) {
        self.status = to;
        self.status_updated_at = Utc::now();
    }

    pub fn record_error(&mut self, stage: &str, message: impl Into<String>, details: serde_json::Value) {
        self.processing.errors.push(PipelineErrorRecord {
            stage: stage.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            details,
        });
    }
}

/// Where a Detection came from. `PrimaryZxing` has no producing
/// worker yet — kept as a forward-compatible slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    PrimaryZbar,
    PrimaryZxing,
    FallbackGemini,
    Manual,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryZbar => "primary_zbar",
            Self::PrimaryZxing => "primary_zxing",
            Self::FallbackGemini => "fallback_gemini",
            Self::Manual => "manual",
        }
    }
}

/// One extracted barcode candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub detection_id: Uuid,
    pub image_id: String,
    pub code: String,
    pub normalized_code: Option<String>,
    pub symbology: Symbology,
    pub source: DetectionSource,
    pub confidence: f64,
    pub rotation: u16,

    pub checksum_valid: bool,
    pub length_valid: bool,
    pub numeric_only: bool,

    pub ambiguous: bool,
    pub chosen: bool,
    pub rejected: bool,

    pub product_found: bool,
    pub product_id: Option<String>,

    pub gemini_confidence: Option<f64>,
    pub gemini_symbology: Option<String>,

    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Detection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image_id: impl Into<String>,
        code: impl Into<String>,
        normalized_code: Option<String>,
        symbology: Symbology,
        source: DetectionSource,
        confidence: f64,
        rotation: u16,
        checksum_valid: bool,
        length_valid: bool,
        numeric_only: bool,
    ) -> Self {
        Self {
            detection_id: Uuid::new_v4(),
            image_id: image_id.into(),
            code: code.into(),
            normalized_code,
            symbology,
            source,
            confidence,
            rotation,
            checksum_valid,
            length_valid,
            numeric_only,
            ambiguous: false,
            chosen: false,
            rejected: false,
            product_found: false,
            product_id: None,
            gemini_confidence: None,
            gemini_symbology: None,
            reviewed_at: None,
            reviewed_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn accepted(&self) -> bool {
        self.numeric_only && self.length_valid && self.checksum_valid
    }
}

/// Job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Preprocess,
    DecodePrimary,
    DecodeFallback,
    Cleanup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::DecodePrimary => "decode_primary",
            Self::DecodeFallback => "decode_fallback",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprocess" => Ok(Self::Preprocess),
            "decode_primary" => Ok(Self::DecodePrimary),
            "decode_fallback" => Ok(Self::DecodeFallback),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub image_id: String,
    pub batch_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub attempt: u32,
    pub max_retries: u32,
    pub worker_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    pub lock_until: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        image_id: impl Into<String>,
        batch_id: impl Into<String>,
        priority: i32,
        scheduled_for: DateTime<Utc>,
        max_retries: u32,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type,
            image_id: image_id.into(),
            batch_id: batch_id.into(),
            status: JobStatus::Pending,
            priority,
            attempt: 0,
            max_retries,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            scheduled_for,
            lock_until: None,
            result: None,
            error: None,
            error_details: None,
        }
    }
}
