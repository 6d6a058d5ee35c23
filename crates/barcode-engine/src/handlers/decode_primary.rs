//! Decode-Primary Handler: run the third-party decoder over every
//! preprocessed rotation, validate and persist every candidate, then
//! decide among the accepted, deduplicated set.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use barcode_core::{ClassifiedCode, Detection, Image, ImageStatus, PipelineError};
use barcode_store::BlobStore;

use crate::clients::PrimaryDecoder;
use crate::handlers::{HandlerOutcome, StageHandler};

pub struct DecodePrimaryHandler {
    blob_store: Arc<dyn BlobStore>,
    decoder: Arc<dyn PrimaryDecoder>,
}

impl DecodePrimaryHandler {
    pub fn new(blob_store: Arc<dyn BlobStore>, decoder: Arc<dyn PrimaryDecoder>) -> Self {
        Self { blob_store, decoder }
    }
}

#[async_trait]
impl StageHandler for DecodePrimaryHandler {
    async fn run(&self, image: &Image) -> Result<HandlerOutcome, PipelineError> {
        let base_path = image
            .preprocessing
            .normalized_path
            .clone()
            .ok_or_else(|| PipelineError::input_invalid("decode_primary", "image has no normalized artifact"))?;

        let mut detections = Vec::new();
        let mut accepted_codes: BTreeSet<String> = BTreeSet::new();

        // 0-degree rotation reads the base normalized artifact directly;
        // the rest read their own archived rotation path.
        let rotation_sources: Vec<(u16, String)> = std::iter::once((0u16, base_path))
            .chain(
                image
                    .preprocessing
                    .rotation_paths
                    .iter()
                    .filter(|r| r.angle_degrees != 0)
                    .map(|r| (r.angle_degrees, r.path.clone())),
            )
            .collect();

        for (angle, path) in rotation_sources {
            let bytes = self
                .blob_store
                .fetch(&path)
                .await
                .map_err(|e| PipelineError::transient_io("decode_primary", e))?;
            let raw_detections = self.decoder.decode(&bytes, angle).await?;

            for raw in raw_detections {
                let classified = ClassifiedCode::new(&raw.raw_code);
                let detection = Detection::new(
                    image.image_id.clone(),
                    classified.raw.clone(),
                    classified.normalized_code.clone(),
                    classified.symbology,
                    raw.source,
                    1.0,
                    angle,
                    classified.reasons.checksum_valid,
                    classified.reasons.length_valid,
                    classified.reasons.numeric_only,
                );
                if classified.accepted() {
                    if let Some(normalized) = &classified.normalized_code {
                        accepted_codes.insert(normalized.clone());
                    }
                }
                detections.push(detection);
            }
        }

        let distinct = accepted_codes.len();
        let outcome = if distinct == 1 {
            HandlerOutcome::new(ImageStatus::DecodedPrimary, move |img| {
                img.processing.primary_attempts += 1;
            })
        } else if distinct >= 2 {
            for d in detections.iter_mut() {
                if d.accepted() {
                    d.ambiguous = true;
                }
            }
            HandlerOutcome::new(ImageStatus::ManualReview, move |img| {
                img.processing.primary_attempts += 1;
            })
        } else {
            HandlerOutcome::new(ImageStatus::Preprocessed, move |img| {
                img.processing.primary_attempts += 1;
                img.processing.needs_fallback = true;
            })
        };

        Ok(outcome.with_detections(detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fakes::ScriptedPrimaryDecoder;
    use barcode_core::RotationArtifact;
    use barcode_store::InMemoryBlobStore;

    async fn preprocessed_image(blob: &InMemoryBlobStore) -> Image {
        blob.put("preprocessed/b1/img-1.jpg", b"bytes".to_vec()).await.unwrap();
        let mut image = Image::new("img-1", "b1", "p.jpg");
        image.status = ImageStatus::DecodingPrimary;
        image.preprocessing.normalized_path = Some("preprocessed/b1/img-1.jpg".to_string());
        image.preprocessing.rotation_paths = vec![RotationArtifact {
            angle_degrees: 0,
            path: "preprocessed/b1/img-1.jpg".to_string(),
        }];
        image
    }

    #[tokio::test]
    async fn single_accepted_code_decodes() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let decoder = Arc::new(ScriptedPrimaryDecoder::returning(vec!["8011642115887"]));

        let handler = DecodePrimaryHandler::new(blob, decoder);
        let outcome = handler.run(&image).await.unwrap();

        assert_eq!(outcome.to, ImageStatus::DecodedPrimary);
        assert_eq!(outcome.detections.len(), 1);
        assert!(outcome.detections[0].accepted());
        assert!(!outcome.detections[0].chosen);
    }

    #[tokio::test]
    async fn zero_accepted_codes_routes_back_to_preprocessed_needing_fallback() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let decoder = Arc::new(ScriptedPrimaryDecoder::returning_none());

        let handler = DecodePrimaryHandler::new(blob, decoder);
        let outcome = handler.run(&image).await.unwrap();

        assert_eq!(outcome.to, ImageStatus::Preprocessed);
        let mut mutated = image.clone();
        (outcome.mutate)(&mut mutated);
        assert!(mutated.processing.needs_fallback);
    }

    #[tokio::test]
    async fn two_distinct_accepted_codes_routes_to_manual_review() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let decoder = Arc::new(ScriptedPrimaryDecoder::returning(vec![
            "8011642115887",
            "4006381333931",
        ]));

        let handler = DecodePrimaryHandler::new(blob, decoder);
        let outcome = handler.run(&image).await.unwrap();

        assert_eq!(outcome.to, ImageStatus::ManualReview);
        assert_eq!(outcome.detections.len(), 2);
        assert!(outcome.detections.iter().all(|d| d.ambiguous));
    }
}
