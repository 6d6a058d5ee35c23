//! Metadata Store Abstraction
//!
//! The single authority for Image/Detection/Job state. Every mutation is a
//! conditional update keyed on the caller's expected prior state; a lost
//! race is reported back as `Ok(false)`, never as an error, so handlers can
//! treat it as a state conflict.

use async_trait::async_trait;
use barcode_core::{Detection, Image, ImageStatus, Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("detection not found: {0}")]
    DetectionNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("store error: {0}")]
    Backend(String),
}

/// Aggregate counts behind the `/api/stats` endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PipelineStats {
    pub total_images: u64,
    pub by_status: std::collections::BTreeMap<String, u64>,
    pub by_job_type: std::collections::BTreeMap<String, u64>,
    pub success_rate: f64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // --- images ---------------------------------------------------------

    async fn insert_image(&self, image: Image) -> Result<(), MetadataStoreError>;

    async fn get_image(&self, image_id: &str) -> Result<Image, MetadataStoreError>;

    /// Conditionally apply `mutate` to the stored image, provided its
    /// status still equals `expected`. Returns `Ok(false)` on a lost race
    /// rather than an error; the caller never observes a torn write because
    /// the check-and-set happens as one store operation.
    async fn update_image_cas(
        &self,
        image_id: &str,
        expected: ImageStatus,
        mutate: Box<dyn FnOnce(&mut Image) + Send>,
    ) -> Result<bool, MetadataStoreError>;

    async fn list_images_for_review(
        &self,
        batch_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError>;

    /// Images currently in `status`, used by the Dispatcher's seed step to
    /// find work without scanning the whole collection.
    async fn list_images_by_status(
        &self,
        status: ImageStatus,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError>;

    // --- detections ------------------------------------------------------

    async fn insert_detection(&self, detection: Detection) -> Result<(), MetadataStoreError>;

    async fn list_detections(&self, image_id: &str) -> Result<Vec<Detection>, MetadataStoreError>;

    async fn get_detection(&self, detection_id: Uuid) -> Result<Detection, MetadataStoreError>;

    async fn update_detection(
        &self,
        detection_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Detection) + Send>,
    ) -> Result<(), MetadataStoreError>;

    // --- jobs --------------------------------------------------------------

    async fn insert_job(&self, job: Job) -> Result<(), MetadataStoreError>;

    /// An active job (pending or in_progress) for this `(job_type, image_id)`
    /// pair, if one exists — the enqueue idempotence check.
    async fn find_active_job(
        &self,
        job_type: JobType,
        image_id: &str,
    ) -> Result<Option<Job>, MetadataStoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, MetadataStoreError>;

    /// Atomically claim up to `limit` pending jobs of `job_type` whose
    /// `scheduled_for <= now`, ordered by `priority` then `scheduled_for`,
    /// setting `status=in_progress`, `worker_id`, `started_at`, `lock_until`.
    async fn lease_jobs(
        &self,
        job_type: JobType,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Job>, MetadataStoreError>;

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), MetadataStoreError>;

    /// Record a failed attempt. If `retry` is true the job returns to
    /// `pending` with `scheduled_for` pushed out by the caller's backoff;
    /// otherwise it is marked `failed` terminally.
    async fn fail_job(
        &self,
        job_id: Uuid,
        error: String,
        error_details: Option<serde_json::Value>,
        retry: bool,
        next_scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<(), MetadataStoreError>;

    /// Reset any `in_progress` job whose `lock_until` has passed back to
    /// `pending`, incrementing nothing (the worker's own `attempt` bump
    /// happens at lease time) — the Dispatcher's reap sweep.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, MetadataStoreError>;

    async fn stats(&self, batch_id: Option<&str>) -> Result<PipelineStats, MetadataStoreError>;
}

pub mod mongo;

#[cfg(any(test, feature = "testing"))]
pub mod memory;
