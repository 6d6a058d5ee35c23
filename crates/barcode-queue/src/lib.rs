//! Job Queue: a thin, durable wrapper over `MetadataStore`'s job
//! collection. All state lives in the store; this crate owns only the
//! idempotent-enqueue check, lease bookkeeping, and backoff policy.

use std::sync::Arc;

use barcode_core::{Job, JobType, PipelineError};
use barcode_store::MetadataStore;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Exponential backoff, base 2^attempt seconds, capped at 120s.
pub fn backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(120);
    Duration::seconds(secs as i64)
}

/// Outcome of `enqueue`: whether a new job was created or an existing
/// active job was found (the idempotence guarantee).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created,
    AlreadyActive,
}

/// Outcome of `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Dead,
}

pub struct JobQueue {
    store: Arc<dyn MetadataStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Idempotent per `(job_type, image_id)`: returns the existing job id
    /// if one is already pending or in_progress for this pair.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        image_id: &str,
        batch_id: &str,
        priority: i32,
        scheduled_for: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<(Uuid, EnqueueOutcome), PipelineError> {
        if let Some(existing) = self
            .store
            .find_active_job(job_type, image_id)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.enqueue", e))?
        {
            return Ok((existing.job_id, EnqueueOutcome::AlreadyActive));
        }

        let job = Job::new(job_type, image_id, batch_id, priority, scheduled_for, max_retries);
        let job_id = job.job_id;
        self.store
            .insert_job(job)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.enqueue", e))?;
        Ok((job_id, EnqueueOutcome::Created))
    }

    /// Atomically claim up to `batch_size` pending jobs of `job_type`.
    pub async fn lease(
        &self,
        job_type: JobType,
        worker_id: &str,
        lease_duration: Duration,
        batch_size: u32,
    ) -> Result<Vec<Job>, PipelineError> {
        let now = Utc::now();
        self.store
            .lease_jobs(job_type, worker_id, now, now + lease_duration, batch_size)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.lease", e))
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        self.store
            .complete_job(job_id, result)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.complete", e))
    }

    /// Records a failed attempt. Requeues with exponential backoff if
    /// `retriable` and the job hasn't exhausted `max_retries`; otherwise
    /// marks the job terminally `failed`.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: impl Into<String>,
        error_details: Option<serde_json::Value>,
        retriable: bool,
    ) -> Result<FailOutcome, PipelineError> {
        let job = self
            .store
            .get_job(job_id)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.fail", e))?;

        let retry = retriable && job.attempt < job.max_retries;
        let next_scheduled_for = retry.then(|| Utc::now() + backoff(job.attempt));

        self.store
            .fail_job(job_id, error.into(), error_details, retry, next_scheduled_for)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.fail", e))?;

        Ok(if retry { FailOutcome::Requeued } else { FailOutcome::Dead })
    }

    /// Resets any job whose lease has expired back to `pending`, treating
    /// it as a retriable failure.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, PipelineError> {
        self.store
            .reap_expired_leases(now)
            .await
            .map_err(|e| PipelineError::transient_io("job_queue.reap", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barcode_store::InMemoryMetadataStore;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(InMemoryMetadataStore::new()))
    }

    #[test]
    fn backoff_caps_at_120_seconds() {
        assert_eq!(backoff(0), Duration::seconds(1));
        assert_eq!(backoff(5), Duration::seconds(32));
        assert_eq!(backoff(10), Duration::seconds(120));
        assert_eq!(backoff(20), Duration::seconds(120));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_for_active_jobs() {
        let q = queue();
        let (id1, outcome1) = q
            .enqueue(JobType::Preprocess, "img-1", "b1", 0, Utc::now(), 3)
            .await
            .unwrap();
        assert_eq!(outcome1, EnqueueOutcome::Created);

        let (id2, outcome2) = q
            .enqueue(JobType::Preprocess, "img-1", "b1", 0, Utc::now(), 3)
            .await
            .unwrap();
        assert_eq!(outcome2, EnqueueOutcome::AlreadyActive);
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn lease_then_complete_round_trip() {
        let q = queue();
        let (job_id, _) = q
            .enqueue(JobType::Preprocess, "img-1", "b1", 0, Utc::now(), 3)
            .await
            .unwrap();

        let leased = q.lease(JobType::Preprocess, "worker-1", Duration::seconds(60), 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].job_id, job_id);

        q.complete(job_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn fail_retriable_requeues_until_max_retries_exhausted() {
        let q = queue();
        let (job_id, _) = q
            .enqueue(JobType::DecodePrimary, "img-1", "b1", 0, Utc::now(), 1)
            .await
            .unwrap();

        q.lease(JobType::DecodePrimary, "worker-1", Duration::seconds(60), 1)
            .await
            .unwrap();
        let outcome = q.fail(job_id, "timeout", None, true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Dead); // attempt=1 already == max_retries=1
    }

    #[tokio::test]
    async fn fail_non_retriable_is_always_dead() {
        let q = queue();
        let (job_id, _) = q
            .enqueue(JobType::DecodeFallback, "img-1", "b1", 0, Utc::now(), 5)
            .await
            .unwrap();
        q.lease(JobType::DecodeFallback, "worker-1", Duration::seconds(60), 1)
            .await
            .unwrap();

        let outcome = q.fail(job_id, "bad input", None, false).await.unwrap();
        assert_eq!(outcome, FailOutcome::Dead);
    }
}
