//! In-memory `MetadataStore` fake used by handler, worker, and dispatcher
//! tests. CAS semantics mirror the Mongo implementation exactly: a
//! `replace` only succeeds if the stored status still equals `expected`.

use async_trait::async_trait;
use barcode_core::{Detection, Image, ImageStatus, Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{MetadataStore, MetadataStoreError, PipelineStats};

#[derive(Default)]
pub struct InMemoryMetadataStore {
    images: Mutex<HashMap<String, Image>>,
    detections: Mutex<HashMap<Uuid, Detection>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert_image(&self, image: Image) -> Result<(), MetadataStoreError> {
        self.images.lock().unwrap().insert(image.image_id.clone(), image);
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> Result<Image, MetadataStoreError> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .cloned()
            .ok_or_else(|| MetadataStoreError::ImageNotFound(image_id.to_string()))
    }

    async fn update_image_cas(
        &self,
        image_id: &str,
        expected: ImageStatus,
        mutate: Box<dyn FnOnce(&mut Image) + Send>,
    ) -> Result<bool, MetadataStoreError> {
        let mut images = self.images.lock().unwrap();
        let image = images
            .get_mut(image_id)
            .ok_or_else(|| MetadataStoreError::ImageNotFound(image_id.to_string()))?;
        if image.status != expected {
            return Ok(false);
        }
        mutate(image);
        Ok(true)
    }

    async fn list_images_for_review(
        &self,
        batch_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError> {
        let images = self.images.lock().unwrap();
        let mut out: Vec<Image> = images
            .values()
            .filter(|img| img.status == ImageStatus::ManualReview)
            .filter(|img| batch_id.map(|b| b == img.batch_id).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn list_images_by_status(
        &self,
        status: ImageStatus,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError> {
        let images = self.images.lock().unwrap();
        let mut out: Vec<Image> = images.values().filter(|img| img.status == status).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn insert_detection(&self, detection: Detection) -> Result<(), MetadataStoreError> {
        self.detections.lock().unwrap().insert(detection.detection_id, detection);
        Ok(())
    }

    async fn list_detections(&self, image_id: &str) -> Result<Vec<Detection>, MetadataStoreError> {
        Ok(self
            .detections
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn get_detection(&self, detection_id: Uuid) -> Result<Detection, MetadataStoreError> {
        self.detections
            .lock()
            .unwrap()
            .get(&detection_id)
            .cloned()
            .ok_or(MetadataStoreError::DetectionNotFound(detection_id))
    }

    async fn update_detection(
        &self,
        detection_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Detection) + Send>,
    ) -> Result<(), MetadataStoreError> {
        let mut detections = self.detections.lock().unwrap();
        let detection = detections
            .get_mut(&detection_id)
            .ok_or(MetadataStoreError::DetectionNotFound(detection_id))?;
        mutate(detection);
        Ok(())
    }

    async fn insert_job(&self, job: Job) -> Result<(), MetadataStoreError> {
        self.jobs.lock().unwrap().insert(job.job_id, job);
        Ok(())
    }

    async fn find_active_job(
        &self,
        job_type: JobType,
        image_id: &str,
    ) -> Result<Option<Job>, MetadataStoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| {
                j.job_type == job_type
                    && j.image_id == image_id
                    && matches!(j.status, JobStatus::Pending | JobStatus::InProgress)
            })
            .cloned())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, MetadataStoreError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(MetadataStoreError::JobNotFound(job_id))
    }

    async fn lease_jobs(
        &self,
        job_type: JobType,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Job>, MetadataStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut candidates: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.job_type == job_type && j.status == JobStatus::Pending && j.scheduled_for <= now)
            .map(|j| j.job_id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &jobs[id];
            (std::cmp::Reverse(j.priority), j.scheduled_for)
        });
        candidates.truncate(limit as usize);

        let mut leased = Vec::new();
        for id in candidates {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::InProgress;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.lock_until = Some(lease_until);
            job.attempt += 1;
            leased.push(job.clone());
        }
        Ok(leased)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), MetadataStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(MetadataStoreError::JobNotFound(job_id))?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = result;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: String,
        error_details: Option<serde_json::Value>,
        retry: bool,
        next_scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<(), MetadataStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(MetadataStoreError::JobNotFound(job_id))?;
        job.status = if retry { JobStatus::Pending } else { JobStatus::Failed };
        job.error = Some(error);
        job.error_details = error_details;
        if let Some(scheduled_for) = next_scheduled_for {
            job.scheduled_for = scheduled_for;
        }
        if !retry {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, MetadataStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut reaped = Vec::new();
        for job in jobs.values_mut() {
            if job.status == JobStatus::InProgress && job.lock_until.map(|l| l < now).unwrap_or(false) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.lock_until = None;
                reaped.push(job.job_id);
            }
        }
        Ok(reaped)
    }

    async fn stats(&self, batch_id: Option<&str>) -> Result<PipelineStats, MetadataStoreError> {
        let images = self.images.lock().unwrap();
        let jobs = self.jobs.lock().unwrap();

        let mut by_status = std::collections::BTreeMap::new();
        let mut total_images = 0u64;
        for image in images.values() {
            if batch_id.map(|b| b == image.batch_id).unwrap_or(true) {
                *by_status.entry(image.status.as_str().to_string()).or_insert(0) += 1;
                total_images += 1;
            }
        }

        let mut by_job_type = std::collections::BTreeMap::new();
        for job in jobs.values() {
            *by_job_type.entry(job.job_type.as_str().to_string()).or_insert(0) += 1;
        }

        let successes = by_status.get("decoded_primary").copied().unwrap_or(0)
            + by_status.get("decoded_fallback").copied().unwrap_or(0)
            + by_status.get("decoded_manual").copied().unwrap_or(0);
        let success_rate = if total_images == 0 {
            0.0
        } else {
            successes as f64 / total_images as f64
        };

        Ok(PipelineStats {
            total_images,
            by_status,
            by_job_type,
            success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_update_rejects_stale_expected_status() {
        let store = InMemoryMetadataStore::new();
        let image = Image::new("img-1", "b1", "p.jpg");
        store.insert_image(image).await.unwrap();

        let ok = store
            .update_image_cas(
                "img-1",
                ImageStatus::Pending,
                Box::new(|img| img.status = ImageStatus::Preprocessing),
            )
            .await
            .unwrap();
        assert!(ok);

        // Second caller still thinks the image is Pending: loses the race.
        let conflict = store
            .update_image_cas(
                "img-1",
                ImageStatus::Pending,
                Box::new(|img| img.status = ImageStatus::Preprocessing),
            )
            .await
            .unwrap();
        assert!(!conflict);
    }

    #[tokio::test]
    async fn enqueue_idempotence_finds_existing_active_job() {
        let store = InMemoryMetadataStore::new();
        let job = Job::new(JobType::Preprocess, "img-1", "b1", 0, Utc::now(), 3);
        let job_id = job.job_id;
        store.insert_job(job).await.unwrap();

        let found = store.find_active_job(JobType::Preprocess, "img-1").await.unwrap();
        assert_eq!(found.unwrap().job_id, job_id);
    }

    #[tokio::test]
    async fn lease_jobs_claims_pending_in_priority_order() {
        let store = InMemoryMetadataStore::new();
        let low = Job::new(JobType::Preprocess, "img-low", "b1", 0, Utc::now(), 3);
        let high = Job::new(JobType::Preprocess, "img-high", "b1", 10, Utc::now(), 3);
        store.insert_job(low).await.unwrap();
        store.insert_job(high.clone()).await.unwrap();

        let now = Utc::now();
        let leased = store
            .lease_jobs(JobType::Preprocess, "worker-1", now, now + chrono::Duration::seconds(60), 1)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].job_id, high.job_id);
        assert_eq!(leased[0].attempt, 1);
    }

    #[tokio::test]
    async fn reap_resets_stale_in_progress_jobs() {
        let store = InMemoryMetadataStore::new();
        let mut job = Job::new(JobType::Preprocess, "img-1", "b1", 0, Utc::now(), 3);
        job.status = JobStatus::InProgress;
        job.lock_until = Some(Utc::now() - chrono::Duration::seconds(1));
        let job_id = job.job_id;
        store.insert_job(job).await.unwrap();

        let reaped = store.reap_expired_leases(Utc::now()).await.unwrap();
        assert_eq!(reaped, vec![job_id]);
        assert_eq!(store.get_job(job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn stats_success_rate_uses_total_images_denominator() {
        let store = InMemoryMetadataStore::new();
        let mut decoded = Image::new("img-1", "b1", "p.jpg");
        decoded.status = ImageStatus::DecodedPrimary;
        store.insert_image(decoded).await.unwrap();
        store.insert_image(Image::new("img-2", "b1", "q.jpg")).await.unwrap();

        let stats = store.stats(Some("b1")).await.unwrap();
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.success_rate, 0.5);
    }
}
