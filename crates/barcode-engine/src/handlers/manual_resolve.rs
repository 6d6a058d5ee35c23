//! Manual Resolve Handler. Synchronous — invoked directly by the review
//! HTTP surface, not scheduled through the Job Queue.

use std::sync::Arc;

use barcode_core::{ImageStatus, PipelineError};
use barcode_store::MetadataStore;
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Choose,
    NoBarcode,
    Skip,
}

pub struct ManualResolveHandler {
    metadata_store: Arc<dyn MetadataStore>,
}

impl ManualResolveHandler {
    pub fn new(metadata_store: Arc<dyn MetadataStore>) -> Self {
        Self { metadata_store }
    }

    pub async fn resolve(
        &self,
        image_id: &str,
        action: ResolveAction,
        detection_id: Option<Uuid>,
        reviewer: Option<String>,
    ) -> Result<(), PipelineError> {
        let image = self
            .metadata_store
            .get_image(image_id)
            .await
            .map_err(|e| PipelineError::input_invalid("manual_resolve", e))?;
        if image.status != ImageStatus::ManualReview {
            return Err(PipelineError::input_invalid(
                "manual_resolve",
                format!("image {image_id} is not in manual_review (status={})", image.status),
            ));
        }

        match action {
            ResolveAction::Skip => Ok(()),
            ResolveAction::NoBarcode => {
                let detections = self
                    .metadata_store
                    .list_detections(image_id)
                    .await
                    .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                for d in detections {
                    self.metadata_store
                        .update_detection(d.detection_id, Box::new(|d| d.rejected = true))
                        .await
                        .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                }
                let ok = self
                    .metadata_store
                    .update_image_cas(image_id, ImageStatus::ManualReview, Box::new(|img| img.set_status(ImageStatus::Failed)))
                    .await
                    .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                if !ok {
                    return Err(PipelineError::state_conflict("manual_resolve"));
                }
                Ok(())
            }
            ResolveAction::Choose => {
                let Some(chosen_id) = detection_id else {
                    return Err(PipelineError::input_invalid("manual_resolve", "detection_id is required for action=choose"));
                };
                // Confirms the detection belongs to this image before mutating.
                let chosen = self
                    .metadata_store
                    .get_detection(chosen_id)
                    .await
                    .map_err(|e| PipelineError::input_invalid("manual_resolve", e))?;
                if chosen.image_id != image_id {
                    return Err(PipelineError::input_invalid(
                        "manual_resolve",
                        format!("detection {chosen_id} does not belong to image {image_id}"),
                    ));
                }

                let detections = self
                    .metadata_store
                    .list_detections(image_id)
                    .await
                    .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                let now = Utc::now();
                let reviewer = reviewer.clone();
                for d in detections {
                    if d.detection_id == chosen_id {
                        let reviewer = reviewer.clone();
                        self.metadata_store
                            .update_detection(
                                d.detection_id,
                                Box::new(move |d| {
                                    d.chosen = true;
                                    d.rejected = false;
                                    d.reviewed_at = Some(now);
                                    d.reviewed_by = reviewer;
                                }),
                            )
                            .await
                            .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                    } else {
                        self.metadata_store
                            .update_detection(d.detection_id, Box::new(|d| d.rejected = true))
                            .await
                            .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                    }
                }

                let ok = self
                    .metadata_store
                    .update_image_cas(image_id, ImageStatus::ManualReview, Box::new(|img| img.set_status(ImageStatus::DecodedManual)))
                    .await
                    .map_err(|e| PipelineError::transient_io("manual_resolve", e))?;
                if !ok {
                    return Err(PipelineError::state_conflict("manual_resolve"));
                }
                Ok(())
            }
        }
    }
}
