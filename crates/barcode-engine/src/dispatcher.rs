//! Dispatcher: the control loop that reaps expired leases and seeds new
//! jobs from whatever Images are sitting in a state that needs work.
//! Logically single-instance but safe to run redundantly, since every
//! `enqueue` is idempotent.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use barcode_core::{ImageStatus, JobType, PipelineError};
use barcode_queue::JobQueue;
use barcode_store::{MetadataStore, PipelineStats};
use chrono::Utc;

/// Minimum delay between fallback retry attempts on a failed image: the
/// per-attempt delay is at least 30 s.
const FAILED_RETRY_DELAY: chrono::Duration = chrono::Duration::seconds(30);

/// Fallback attempts beyond which a failed image is no longer retried
/// automatically.
const MAX_FALLBACK_ATTEMPTS: u32 = 3;

pub struct DispatcherConfig {
    pub poll_interval: StdDuration,
    pub batch_size: u32,
    pub once: bool,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<JobQueue>,
    metadata_store: Arc<dyn MetadataStore>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, queue: Arc<JobQueue>, metadata_store: Arc<dyn MetadataStore>) -> Self {
        Self {
            config,
            queue,
            metadata_store,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!("dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "dispatcher cycle failed");
            }
            if self.config.once {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {},
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("dispatcher stopped");
    }

    /// One reap-then-seed cycle. Returns the number of jobs enqueued.
    pub async fn run_cycle(&self) -> Result<u32, PipelineError> {
        let reaped = self.queue.reap(Utc::now()).await?;
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "reaped expired leases");
        }

        let mut enqueued = 0u32;
        enqueued += self.seed_preprocess(enqueued).await?;
        enqueued += self.seed_decode_primary(enqueued).await?;
        enqueued += self.seed_decode_fallback(enqueued).await?;
        enqueued += self.seed_failed_retry(enqueued).await?;
        Ok(enqueued)
    }

    fn remaining(&self, already: u32) -> u32 {
        self.config.batch_size.saturating_sub(already)
    }

    async fn seed_preprocess(&self, already: u32) -> Result<u32, PipelineError> {
        let remaining = self.remaining(already);
        if remaining == 0 {
            return Ok(0);
        }
        let images = self
            .metadata_store
            .list_images_by_status(ImageStatus::Pending, remaining)
            .await
            .map_err(|e| PipelineError::transient_io("dispatcher", e))?;

        let mut count = 0;
        for image in images {
            let (_, outcome) = self
                .queue
                .enqueue(JobType::Preprocess, &image.image_id, &image.batch_id, 0, Utc::now(), 3)
                .await?;
            if outcome == barcode_queue::EnqueueOutcome::Created {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn seed_decode_primary(&self, already: u32) -> Result<u32, PipelineError> {
        let remaining = self.remaining(already);
        if remaining == 0 {
            return Ok(0);
        }
        let images = self
            .metadata_store
            .list_images_by_status(ImageStatus::Preprocessed, remaining)
            .await
            .map_err(|e| PipelineError::transient_io("dispatcher", e))?;

        let mut count = 0;
        for image in images.iter().filter(|img| !img.processing.needs_fallback) {
            let (_, outcome) = self
                .queue
                .enqueue(JobType::DecodePrimary, &image.image_id, &image.batch_id, 0, Utc::now(), 1)
                .await?;
            if outcome == barcode_queue::EnqueueOutcome::Created {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn seed_decode_fallback(&self, already: u32) -> Result<u32, PipelineError> {
        let remaining = self.remaining(already);
        if remaining == 0 {
            return Ok(0);
        }
        let images = self
            .metadata_store
            .list_images_by_status(ImageStatus::Preprocessed, remaining)
            .await
            .map_err(|e| PipelineError::transient_io("dispatcher", e))?;

        let mut count = 0;
        for image in images.iter().filter(|img| img.processing.needs_fallback) {
            let (_, outcome) = self
                .queue
                .enqueue(JobType::DecodeFallback, &image.image_id, &image.batch_id, 5, Utc::now(), 3)
                .await?;
            if outcome == barcode_queue::EnqueueOutcome::Created {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Failed-Retry seeding: images in `failed` with fallback attempts
    /// remaining and enough time elapsed since the last attempt.
    async fn seed_failed_retry(&self, already: u32) -> Result<u32, PipelineError> {
        let remaining = self.remaining(already);
        if remaining == 0 {
            return Ok(0);
        }
        let now = Utc::now();
        let images = self
            .metadata_store
            .list_images_by_status(ImageStatus::Failed, remaining)
            .await
            .map_err(|e| PipelineError::transient_io("dispatcher", e))?;

        let mut count = 0;
        for image in images.iter().filter(|img| {
            img.processing.fallback_attempts < MAX_FALLBACK_ATTEMPTS
                && now - img.status_updated_at >= FAILED_RETRY_DELAY
        }) {
            let (_, outcome) = self
                .queue
                .enqueue(
                    JobType::DecodeFallback,
                    &image.image_id,
                    &image.batch_id,
                    5,
                    now,
                    3,
                )
                .await?;
            if outcome == barcode_queue::EnqueueOutcome::Created {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn stats(&self, batch_id: Option<&str>) -> Result<PipelineStats, PipelineError> {
        self.metadata_store
            .stats(batch_id)
            .await
            .map_err(|e| PipelineError::transient_io("dispatcher", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barcode_core::Image;
    use barcode_store::InMemoryMetadataStore;

    fn dispatcher(store: Arc<dyn MetadataStore>, batch_size: u32) -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig {
                poll_interval: StdDuration::from_secs(1),
                batch_size,
                once: true,
            },
            Arc::new(JobQueue::new(store.clone())),
            store,
        )
    }

    #[tokio::test]
    async fn seeds_preprocess_jobs_for_pending_images() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        store.insert_image(Image::new("img-1", "b1", "p.jpg")).await.unwrap();

        let count = dispatcher(store, 10).run_cycle().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn does_not_duplicate_enqueue_on_second_cycle() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        store.insert_image(Image::new("img-1", "b1", "p.jpg")).await.unwrap();

        let d = dispatcher(store, 10);
        d.run_cycle().await.unwrap();
        let second = d.run_cycle().await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn does_not_retry_failed_image_before_delay_elapses() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut image = Image::new("img-1", "b1", "p.jpg");
        image.status = ImageStatus::Failed;
        image.status_updated_at = Utc::now();
        store.insert_image(image).await.unwrap();

        let count = dispatcher(store, 10).run_cycle().await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn retries_failed_image_after_delay_elapses() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut image = Image::new("img-1", "b1", "p.jpg");
        image.status = ImageStatus::Failed;
        image.status_updated_at = Utc::now() - chrono::Duration::seconds(31);
        store.insert_image(image).await.unwrap();

        let count = dispatcher(store, 10).run_cycle().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn respects_batch_size_across_seed_steps() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        for i in 0..5 {
            store.insert_image(Image::new(format!("img-{i}"), "b1", "p.jpg")).await.unwrap();
        }

        let count = dispatcher(store, 2).run_cycle().await.unwrap();
        assert_eq!(count, 2);
    }
}
