//! Worker Runtime: a long-lived loop bound to one `JobType`. Leases jobs,
//! drives the Image through its entry "-ing" transition and the Stage
//! Handler's outcome transition, and reports completion/failure back to
//! the Job Queue.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use barcode_core::{ImageStatus, Job, JobType, PipelineError};
use barcode_queue::JobQueue;
use barcode_store::MetadataStore;
use chrono::Duration;
use serde_json::json;

use crate::handlers::StageHandler;

/// Safety margin subtracted from the lease deadline so a handler that is
/// running close to its `lock_until` abandons the transition attempt
/// rather than racing a Dispatcher reap.
const LEASE_SAFETY_MARGIN: StdDuration = StdDuration::from_secs(5);

fn entering_status(job_type: JobType) -> ImageStatus {
    match job_type {
        JobType::Preprocess => ImageStatus::Preprocessing,
        JobType::DecodePrimary => ImageStatus::DecodingPrimary,
        JobType::DecodeFallback => ImageStatus::DecodingFallback,
        JobType::Cleanup => unreachable!("cleanup jobs are operator-triggered and never leased by a Worker"),
    }
}

pub struct WorkerConfig {
    pub job_type: JobType,
    pub worker_id: String,
    pub poll_interval: StdDuration,
    pub lease_duration: Duration,
    pub batch_size: u32,
    /// Run exactly one lease-and-process cycle then return, instead of
    /// looping forever (the `--once` CLI flag).
    pub once: bool,
}

pub struct Worker {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    metadata_store: Arc<dyn MetadataStore>,
    handler: Arc<dyn StageHandler>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        metadata_store: Arc<dyn MetadataStore>,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            config,
            queue,
            metadata_store,
            handler,
        }
    }

    /// Run until cancelled, or until one empty poll if `config.once`.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.config.worker_id, job_type = %self.config.job_type, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(0) => {
                    if self.config.once {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(_) => {
                    if self.config.once {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "poll cycle failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Lease and process up to `batch_size` jobs. Returns the number leased.
    pub async fn poll_once(&self) -> Result<usize, PipelineError> {
        let jobs = self
            .queue
            .lease(self.config.job_type, &self.config.worker_id, self.config.lease_duration, self.config.batch_size)
            .await?;

        for job in &jobs {
            self.process_job(job).await;
        }
        Ok(jobs.len())
    }

    async fn process_job(&self, job: &Job) {
        if let Err(e) = self.process_job_inner(job).await {
            tracing::warn!(job_id = %job.job_id, image_id = %job.image_id, error = %e, "job processing failed unexpectedly");
        }
    }

    async fn process_job_inner(&self, job: &Job) -> Result<(), PipelineError> {
        let image = self
            .metadata_store
            .get_image(&job.image_id)
            .await
            .map_err(|e| PipelineError::transient_io("worker", e))?;

        let entering = entering_status(self.config.job_type);
        if !image.status.can_transition_to(entering) {
            // Stale job: another path already moved this image on.
            self.queue.complete(job.job_id, Some(json!({ "skipped": true }))).await?;
            return Ok(());
        }

        let cas_ok = self
            .metadata_store
            .update_image_cas(&job.image_id, image.status, Box::new(move |img| img.set_status(entering)))
            .await
            .map_err(|e| PipelineError::transient_io("worker", e))?;
        if !cas_ok {
            self.queue.complete(job.job_id, Some(json!({ "skipped": true }))).await?;
            return Ok(());
        }

        let mut working_image = image;
        working_image.set_status(entering);

        let deadline = self.config.lease_duration.to_std().unwrap_or(StdDuration::ZERO).saturating_sub(LEASE_SAFETY_MARGIN);
        let started = tokio::time::Instant::now();

        let outcome = self.handler.run(&working_image).await;
        if started.elapsed() > deadline {
            tracing::warn!(
                job_id = %job.job_id,
                image_id = %job.image_id,
                "handler exceeded its lease safety margin; another worker may already be reaping this job"
            );
            return Err(PipelineError::lease_expired(self.config.job_type.as_str()));
        }

        match outcome {
            Ok(outcome) => {
                let to = outcome.to;
                let applied = self
                    .metadata_store
                    .update_image_cas(&job.image_id, entering, {
                        let mutate = outcome.mutate;
                        Box::new(move |img| {
                            mutate(img);
                            img.set_status(to);
                        })
                    })
                    .await
                    .map_err(|e| PipelineError::transient_io("worker", e))?;

                for detection in outcome.detections {
                    self.metadata_store
                        .insert_detection(detection)
                        .await
                        .map_err(|e| PipelineError::transient_io("worker", e))?;
                }

                if applied {
                    self.queue.complete(job.job_id, Some(json!({ "to": to.as_str() }))).await?;
                } else {
                    self.queue.complete(job.job_id, Some(json!({ "skipped": true }))).await?;
                }
            }
            Err(handler_err) => {
                if handler_err.retriable() {
                    self.queue.fail(job.job_id, handler_err.to_string(), None, true).await?;
                } else {
                    let stage = handler_err.stage().to_string();
                    let message = handler_err.to_string();
                    self.metadata_store
                        .update_image_cas(&job.image_id, entering, {
                            let message = message.clone();
                            Box::new(move |img| {
                                img.set_status(ImageStatus::Failed);
                                img.record_error(&stage, message, serde_json::Value::Null);
                            })
                        })
                        .await
                        .map_err(|e| PipelineError::transient_io("worker", e))?;
                    self.queue.fail(job.job_id, message, None, false).await?;
                }
            }
        }
        Ok(())
    }
}
