//! Decode-Fallback Handler. Also backs the Failed-Retry path: the guard on
//! which images are eligible (preprocessed-needing-fallback
//! vs. failed-with-attempts-remaining) lives in the Dispatcher's seed step,
//! not here — by the time this handler runs, the Worker has already
//! validated the entry transition.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use barcode_core::{ClassifiedCode, Detection, DetectionSource, Image, ImageStatus, PipelineError, Symbology};
use barcode_store::BlobStore;

use crate::clients::LlmClient;
use crate::handlers::{HandlerOutcome, StageHandler};

const EXTRACTION_PROMPT: &str =
    "Identify every barcode visible in this image. Respond with JSON: \
     {\"codes\": [{\"code\": string, \"symbology\": string, \"confidence\": number}]}.";

pub struct DecodeFallbackHandler {
    blob_store: Arc<dyn BlobStore>,
    llm_client: Arc<dyn LlmClient>,
}

impl DecodeFallbackHandler {
    pub fn new(blob_store: Arc<dyn BlobStore>, llm_client: Arc<dyn LlmClient>) -> Self {
        Self { blob_store, llm_client }
    }
}

fn symbology_from_llm(label: &str) -> Symbology {
    match label.to_uppercase().as_str() {
        "EAN-13" | "EAN13" => Symbology::Ean13,
        "EAN-8" | "EAN8" => Symbology::Ean8,
        "UPC-A" | "UPCA" => Symbology::UpcA,
        "UPC-E" | "UPCE" => Symbology::UpcE,
        _ => Symbology::Unknown,
    }
}

#[async_trait]
impl StageHandler for DecodeFallbackHandler {
    async fn run(&self, image: &Image) -> Result<HandlerOutcome, PipelineError> {
        let path = image
            .preprocessing
            .normalized_path
            .clone()
            .ok_or_else(|| PipelineError::input_invalid("decode_fallback", "image has no normalized artifact"))?;

        let bytes = self
            .blob_store
            .fetch(&path)
            .await
            .map_err(|e| PipelineError::transient_io("decode_fallback", e))?;

        let response = self.llm_client.extract_codes(&bytes, EXTRACTION_PROMPT).await?;
        let token_count = response.token_count;

        let mut detections = Vec::new();
        let mut accepted_codes: BTreeSet<String> = BTreeSet::new();

        for llm_code in &response.codes {
            // Trust the Validator over the LLM's claimed symbology: a
            // numeric code's length determines its real symbology.
            let classified = ClassifiedCode::new(&llm_code.code);
            let mut detection = Detection::new(
                image.image_id.clone(),
                classified.raw.clone(),
                classified.normalized_code.clone(),
                classified.symbology,
                DetectionSource::FallbackGemini,
                llm_code.confidence,
                0,
                classified.reasons.checksum_valid,
                classified.reasons.length_valid,
                classified.reasons.numeric_only,
            );
            detection.gemini_confidence = Some(llm_code.confidence);
            detection.gemini_symbology = Some(symbology_from_llm(&llm_code.symbology).to_string());

            if classified.accepted() {
                if let Some(normalized) = &classified.normalized_code {
                    accepted_codes.insert(normalized.clone());
                }
            }
            detections.push(detection);
        }

        let distinct = accepted_codes.len();
        let outcome = if distinct == 1 {
            HandlerOutcome::new(ImageStatus::DecodedFallback, move |img| {
                img.processing.fallback_attempts += 1;
                img.processing.llm_token_count += token_count;
            })
        } else if distinct >= 2 {
            for d in detections.iter_mut() {
                if d.accepted() {
                    d.ambiguous = true;
                }
            }
            HandlerOutcome::new(ImageStatus::ManualReview, move |img| {
                img.processing.fallback_attempts += 1;
                img.processing.llm_token_count += token_count;
            })
        } else {
            HandlerOutcome::new(ImageStatus::Failed, move |img| {
                img.processing.fallback_attempts += 1;
                img.processing.llm_token_count += token_count;
            })
        };

        Ok(outcome.with_detections(detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fakes::ScriptedLlmClient;
    use crate::clients::LlmCode;
    use crate::clients::LlmResponse;
    use barcode_store::InMemoryBlobStore;

    async fn preprocessed_image(blob: &InMemoryBlobStore) -> Image {
        blob.put("preprocessed/b1/img-1.jpg", b"bytes".to_vec()).await.unwrap();
        let mut image = Image::new("img-1", "b1", "p.jpg");
        image.status = ImageStatus::DecodingFallback;
        image.preprocessing.normalized_path = Some("preprocessed/b1/img-1.jpg".to_string());
        image
    }

    #[tokio::test]
    async fn single_accepted_code_resolves_fallback() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let llm = Arc::new(ScriptedLlmClient::single(LlmResponse {
            codes: vec![LlmCode {
                code: "4006381333931".to_string(),
                symbology: "EAN-13".to_string(),
                confidence: 0.9,
            }],
            token_count: 512,
        }));

        let handler = DecodeFallbackHandler::new(blob, llm);
        let outcome = handler.run(&image).await.unwrap();

        assert_eq!(outcome.to, ImageStatus::DecodedFallback);
        assert_eq!(outcome.detections[0].source, DetectionSource::FallbackGemini);
        assert_eq!(outcome.detections[0].gemini_confidence, Some(0.9));
    }

    #[tokio::test]
    async fn zero_accepted_codes_fails_the_image() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let llm = Arc::new(ScriptedLlmClient::single(LlmResponse::default()));

        let handler = DecodeFallbackHandler::new(blob, llm);
        let outcome = handler.run(&image).await.unwrap();
        assert_eq!(outcome.to, ImageStatus::Failed);
    }

    #[tokio::test]
    async fn ambiguous_fallback_routes_to_manual_review() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let image = preprocessed_image(&blob).await;
        let llm = Arc::new(ScriptedLlmClient::single(LlmResponse {
            codes: vec![
                LlmCode { code: "8011642115887".to_string(), symbology: "EAN-13".to_string(), confidence: 0.8 },
                LlmCode { code: "4006381333931".to_string(), symbology: "EAN-13".to_string(), confidence: 0.7 },
            ],
            token_count: 300,
        }));

        let handler = DecodeFallbackHandler::new(blob, llm);
        let outcome = handler.run(&image).await.unwrap();
        assert_eq!(outcome.to, ImageStatus::ManualReview);
        assert!(outcome.detections.iter().all(|d| d.ambiguous));
    }
}
