//! Preprocess Handler: fetch the source blob, normalize it into a fixed
//! set of rotations, archive the source, and record the result.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use barcode_core::{Image, ImageStatus, PipelineError, PreprocessingRecord, RotationArtifact};
use barcode_store::{BlobStore, MetadataStore};
use chrono::Utc;

use crate::clients::ImageNormalizer;
use crate::handlers::{HandlerOutcome, StageHandler};

/// Angle set the pipeline preprocesses every image into; must include 0°.
pub const ROTATION_ANGLES: [u16; 4] = [0, 90, 180, 270];

pub struct PreprocessHandler {
    blob_store: Arc<dyn BlobStore>,
    #[allow(dead_code)]
    metadata_store: Arc<dyn MetadataStore>,
    normalizer: Arc<dyn ImageNormalizer>,
    max_dimension: u32,
    denoise_strength: f32,
}

impl PreprocessHandler {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        metadata_store: Arc<dyn MetadataStore>,
        normalizer: Arc<dyn ImageNormalizer>,
        max_dimension: u32,
        denoise_strength: f32,
    ) -> Self {
        Self {
            blob_store,
            metadata_store,
            normalizer,
            max_dimension,
            denoise_strength,
        }
    }
}

#[async_trait]
impl StageHandler for PreprocessHandler {
    async fn run(&self, image: &Image) -> Result<HandlerOutcome, PipelineError> {
        let started = Instant::now();

        let source_bytes = self.blob_store.fetch(&image.source_path).await.map_err(|e| {
            PipelineError::transient_io("preprocess", e)
        })?;
        if source_bytes.is_empty() {
            return Err(PipelineError::input_invalid("preprocess", "source blob is empty"));
        }

        let normalized = self
            .normalizer
            .normalize(&source_bytes, self.max_dimension, self.denoise_strength, &ROTATION_ANGLES)
            .await?;

        let preprocessed_path = format!("preprocessed/{}/{}.jpg", image.batch_id, image.image_id);
        self.blob_store
            .put(&preprocessed_path, normalized.jpeg_bytes)
            .await
            .map_err(|e| PipelineError::transient_io("preprocess", e))?;

        let mut rotation_paths = Vec::new();
        for rotation in &normalized.rotations {
            let path = format!(
                "preprocessed/{}/{}_rot{}.jpg",
                image.batch_id, image.image_id, rotation.angle_degrees
            );
            self.blob_store
                .put(&path, rotation.bytes.clone())
                .await
                .map_err(|e| PipelineError::transient_io("preprocess", e))?;
            rotation_paths.push(RotationArtifact {
                angle_degrees: rotation.angle_degrees,
                path,
            });
        }

        // Archive the source; a delete failure here is logged and retried
        // by a later preprocess attempt, never blocking the state advance.
        let original_path = format!("original/{}/{}", image.batch_id, image.source_filename);
        if let Err(e) = self.blob_store.move_blob(&image.source_path, &original_path).await {
            tracing::warn!(image_id = %image.image_id, error = %e, "failed to archive source blob, will retry on next attempt");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let record = PreprocessingRecord {
            normalized_path: Some(preprocessed_path),
            rotation_paths,
            original_width: Some(normalized.original_width),
            original_height: Some(normalized.original_height),
            processed_width: Some(normalized.processed_width),
            processed_height: Some(normalized.processed_height),
            grayscale: true,
            clahe: true,
            denoise: self.denoise_strength > 0.0,
            duration_ms: Some(duration_ms),
            completed_at: Some(Utc::now()),
        };

        Ok(HandlerOutcome::new(ImageStatus::Preprocessed, move |img| {
            img.preprocessing = record;
        }))
    }
}
