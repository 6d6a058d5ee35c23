//! MongoDB-backed `MetadataStore`.
//!
//! Collections: `images`, `detections`, `jobs`, with indexes on the query
//! keys the pipeline actually uses (`image_id`, `batch_id`, `status`,
//! `job_type`, `code`). CAS on images is a `replace_one` filtered on both
//! `image_id` and the caller's expected `status`: a `matched_count` of zero
//! means the document had already moved and is reported as a lost race
//! rather than an error.

use async_trait::async_trait;
use barcode_core::{Detection, Image, ImageStatus, Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, to_bson};
use mongodb::options::FindOptions;
use mongodb::{Client, Collection, Database};
use uuid::Uuid;

use super::{MetadataStore, MetadataStoreError, PipelineStats};

pub struct MongoMetadataStore {
    db: Database,
}

impl MongoMetadataStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, MetadataStoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        let db = client.database(db_name);
        let store = Self { db };
        store.ensure_indexes().await?;
        Ok(store)
    }

    fn images(&self) -> Collection<Image> {
        self.db.collection("images")
    }

    fn detections(&self) -> Collection<Detection> {
        self.db.collection("detections")
    }

    fn jobs(&self) -> Collection<Job> {
        self.db.collection("jobs")
    }

    async fn ensure_indexes(&self) -> Result<(), MetadataStoreError> {
        use mongodb::options::IndexOptions;
        use mongodb::IndexModel;

        let images_idx = IndexModel::builder()
            .keys(doc! { "image_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let batch_idx = IndexModel::builder().keys(doc! { "batch_id": 1 }).build();
        let status_idx = IndexModel::builder().keys(doc! { "status": 1 }).build();
        self.images()
            .create_indexes([images_idx, batch_idx, status_idx])
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let det_image_idx = IndexModel::builder().keys(doc! { "image_id": 1 }).build();
        let det_code_idx = IndexModel::builder().keys(doc! { "code": 1 }).build();
        self.detections()
            .create_indexes([det_image_idx, det_code_idx])
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let job_type_idx = IndexModel::builder().keys(doc! { "job_type": 1, "status": 1 }).build();
        let job_image_idx = IndexModel::builder().keys(doc! { "image_id": 1 }).build();
        self.jobs()
            .create_indexes([job_type_idx, job_image_idx])
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MongoMetadataStore {
    async fn insert_image(&self, image: Image) -> Result<(), MetadataStoreError> {
        self.images()
            .insert_one(image)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> Result<Image, MetadataStoreError> {
        self.images()
            .find_one(doc! { "image_id": image_id })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
            .ok_or_else(|| MetadataStoreError::ImageNotFound(image_id.to_string()))
    }

    async fn update_image_cas(
        &self,
        image_id: &str,
        expected: ImageStatus,
        mutate: Box<dyn FnOnce(&mut Image) + Send>,
    ) -> Result<bool, MetadataStoreError> {
        let mut image = self.get_image(image_id).await?;
        if image.status != expected {
            return Ok(false);
        }
        mutate(&mut image);

        let result = self
            .images()
            .replace_one(
                doc! { "image_id": image_id, "status": to_bson(&expected).unwrap() },
                image,
            )
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(result.matched_count == 1)
    }

    async fn list_images_for_review(
        &self,
        batch_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError> {
        let mut filter = doc! { "status": "manual_review" };
        if let Some(batch_id) = batch_id {
            filter.insert("batch_id", batch_id);
        }
        let options = FindOptions::builder().limit(limit as i64).build();
        let mut cursor = self
            .images()
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        use futures::stream::TryStreamExt;
        while let Some(image) = cursor
            .try_next()
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
        {
            out.push(image);
        }
        Ok(out)
    }

    async fn list_images_by_status(
        &self,
        status: ImageStatus,
        limit: u32,
    ) -> Result<Vec<Image>, MetadataStoreError> {
        let filter = doc! { "status": to_bson(&status).unwrap() };
        let options = FindOptions::builder().limit(limit as i64).build();
        let mut cursor = self
            .images()
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        use futures::stream::TryStreamExt;
        while let Some(image) = cursor
            .try_next()
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
        {
            out.push(image);
        }
        Ok(out)
    }

    async fn insert_detection(&self, detection: Detection) -> Result<(), MetadataStoreError> {
        self.detections()
            .insert_one(detection)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_detections(&self, image_id: &str) -> Result<Vec<Detection>, MetadataStoreError> {
        let mut cursor = self
            .detections()
            .find(doc! { "image_id": image_id })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        use futures::stream::TryStreamExt;
        while let Some(detection) = cursor
            .try_next()
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
        {
            out.push(detection);
        }
        Ok(out)
    }

    async fn get_detection(&self, detection_id: Uuid) -> Result<Detection, MetadataStoreError> {
        self.detections()
            .find_one(doc! { "detection_id": detection_id.to_string() })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
            .ok_or(MetadataStoreError::DetectionNotFound(detection_id))
    }

    async fn update_detection(
        &self,
        detection_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Detection) + Send>,
    ) -> Result<(), MetadataStoreError> {
        let mut detection = self.get_detection(detection_id).await?;
        mutate(&mut detection);
        self.detections()
            .replace_one(doc! { "detection_id": detection_id.to_string() }, detection)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn insert_job(&self, job: Job) -> Result<(), MetadataStoreError> {
        self.jobs()
            .insert_one(job)
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn find_active_job(
        &self,
        job_type: JobType,
        image_id: &str,
    ) -> Result<Option<Job>, MetadataStoreError> {
        self.jobs()
            .find_one(doc! {
                "image_id": image_id,
                "job_type": to_bson(&job_type).unwrap(),
                "status": { "$in": ["pending", "in_progress"] },
            })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, MetadataStoreError> {
        self.jobs()
            .find_one(doc! { "job_id": job_id.to_string() })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
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
        let mut leased = Vec::new();
        for _ in 0..limit {
            let filter = doc! {
                "job_type": to_bson(&job_type).unwrap(),
                "status": "pending",
                "scheduled_for": { "$lte": to_bson(&now).unwrap() },
            };
            let sort = doc! { "priority": -1, "scheduled_for": 1 };
            let update = doc! {
                "$set": {
                    "status": "in_progress",
                    "worker_id": worker_id,
                    "started_at": to_bson(&now).unwrap(),
                    "lock_until": to_bson(&lease_until).unwrap(),
                },
                "$inc": { "attempt": 1 },
            };
            let leased_job = self
                .jobs()
                .find_one_and_update(filter, update)
                .sort(sort)
                .return_document(mongodb::options::ReturnDocument::After)
                .await
                .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
            match leased_job {
                Some(job) => leased.push(job),
                None => break,
            }
        }
        Ok(leased)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), MetadataStoreError> {
        self.jobs()
            .update_one(
                doc! { "job_id": job_id.to_string() },
                doc! {
                    "$set": {
                        "status": "completed",
                        "completed_at": to_bson(&Utc::now()).unwrap(),
                        "result": result.map(|v| to_bson(&v).unwrap()),
                    }
                },
            )
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
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
        let status = if retry { JobStatus::Pending } else { JobStatus::Failed };
        let mut set = doc! {
            "status": to_bson(&status).unwrap(),
            "error": &error,
        };
        if let Some(details) = error_details {
            set.insert("error_details", to_bson(&details).unwrap());
        }
        if let Some(scheduled_for) = next_scheduled_for {
            set.insert("scheduled_for", to_bson(&scheduled_for).unwrap());
        }
        if !retry {
            set.insert("completed_at", to_bson(&Utc::now()).unwrap());
        }
        self.jobs()
            .update_one(doc! { "job_id": job_id.to_string() }, doc! { "$set": set })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, MetadataStoreError> {
        let mut cursor = self
            .jobs()
            .find(doc! {
                "status": "in_progress",
                "lock_until": { "$lt": to_bson(&now).unwrap() },
            })
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;

        let mut reaped = Vec::new();
        use futures::stream::TryStreamExt;
        while let Some(job) = cursor
            .try_next()
            .await
            .map_err(|e| MetadataStoreError::Backend(e.to_string()))?
        {
            self.jobs()
                .update_one(
                    doc! { "job_id": job.job_id.to_string(), "status": "in_progress" },
                    doc! { "$set": { "status": "pending", "worker_id": mongodb::bson::Bson::Null, "lock_until": mongodb::bson::Bson::Null } },
                )
                .await
                .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
            reaped.push(job.job_id);
        }
        Ok(reaped)
    }

    async fn stats(&self, batch_id: Option<&str>) -> Result<PipelineStats, MetadataStoreError> {
        let mut filter = doc! {};
        if let Some(batch_id) = batch_id {
            filter.insert("batch_id", batch_id);
        }

        let mut by_status = std::collections::BTreeMap::new();
        for status in [
            ImageStatus::Pending,
            ImageStatus::Preprocessing,
            ImageStatus::Preprocessed,
            ImageStatus::DecodingPrimary,
            ImageStatus::DecodedPrimary,
            ImageStatus::DecodingFallback,
            ImageStatus::DecodedFallback,
            ImageStatus::ManualReview,
            ImageStatus::DecodedManual,
            ImageStatus::Failed,
        ] {
            let mut status_filter = filter.clone();
            status_filter.insert("status", to_bson(&status).unwrap());
            let count = self
                .images()
                .count_documents(status_filter)
                .await
                .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
            by_status.insert(status.as_str().to_string(), count);
        }

        let mut by_job_type = std::collections::BTreeMap::new();
        for job_type in [
            JobType::Preprocess,
            JobType::DecodePrimary,
            JobType::DecodeFallback,
            JobType::Cleanup,
        ] {
            let count = self
                .jobs()
                .count_documents(doc! { "job_type": to_bson(&job_type).unwrap() })
                .await
                .map_err(|e| MetadataStoreError::Backend(e.to_string()))?;
            by_job_type.insert(job_type.as_str().to_string(), count);
        }

        let total_images: u64 = by_status.values().sum();
        // total_images mixes terminal and in-flight counts in the denominator.
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
