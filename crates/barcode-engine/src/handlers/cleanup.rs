//! Cleanup: moves the normalized artifact of a terminal Image to its
//! permanent home (`processed/` on success, `failed/` on failure) once it
//! is older than the retention window, and rewrites
//! `Image.final_blob_path` to record where it landed.
//!
//! Unlike the five documented stage handlers this is not leased through the
//! Job Queue or seeded by the Dispatcher: it runs only when an operator
//! invokes `worker --job-type cleanup --once`.

use std::sync::Arc;

use barcode_core::{Image, ImageStatus, PipelineError};
use barcode_store::{BlobStore, MetadataStore};
use chrono::{Duration, Utc};

pub struct CleanupHandler {
    blob_store: Arc<dyn BlobStore>,
    metadata_store: Arc<dyn MetadataStore>,
    retention: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub moved: u32,
    pub skipped: u32,
}

impl CleanupHandler {
    pub fn new(blob_store: Arc<dyn BlobStore>, metadata_store: Arc<dyn MetadataStore>, retention_days: i64) -> Self {
        Self {
            blob_store,
            metadata_store,
            retention: Duration::days(retention_days),
        }
    }

    fn terminal_destination(status: ImageStatus) -> Option<&'static str> {
        match status {
            ImageStatus::DecodedPrimary | ImageStatus::DecodedFallback | ImageStatus::DecodedManual => Some("processed"),
            ImageStatus::Failed => Some("failed"),
            _ => None,
        }
    }

    /// Sweeps every image currently sitting in a relevant terminal status
    /// and moves it if it has aged past the retention window. Bounded by
    /// `limit` per status so a single run stays predictable.
    pub async fn run_once(&self, limit: u32) -> Result<CleanupReport, PipelineError> {
        let cutoff = Utc::now() - self.retention;
        let mut report = CleanupReport::default();

        for status in [
            ImageStatus::DecodedPrimary,
            ImageStatus::DecodedFallback,
            ImageStatus::DecodedManual,
            ImageStatus::Failed,
        ] {
            let images = self
                .metadata_store
                .list_images_by_status(status, limit)
                .await
                .map_err(|e| PipelineError::transient_io("cleanup", e))?;

            for image in images {
                if image.status_updated_at > cutoff {
                    report.skipped += 1;
                    continue;
                }
                if self.move_one(&image).await? {
                    report.moved += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn move_one(&self, image: &Image) -> Result<bool, PipelineError> {
        let Some(folder) = Self::terminal_destination(image.status) else {
            return Ok(false);
        };
        let Some(source) = &image.preprocessing.normalized_path else {
            return Ok(false);
        };
        if image.final_blob_path.is_some() {
            return Ok(false);
        }

        let dest = format!("{folder}/{}/{}.jpg", image.batch_id, image.image_id);
        self.blob_store
            .move_blob(source, &dest)
            .await
            .map_err(|e| PipelineError::transient_io("cleanup", e))?;

        let dest_for_cas = dest.clone();
        self.metadata_store
            .update_image_cas(&image.image_id, image.status, Box::new(move |img| img.final_blob_path = Some(dest_for_cas)))
            .await
            .map_err(|e| PipelineError::transient_io("cleanup", e))?;
        Ok(true)
    }
}
