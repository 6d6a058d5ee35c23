//! External collaborators named but not specified by the pipeline contract:
//! the pixel-level normalizer, the third-party primary decoder, and the
//! LLM fallback client. Each is a trait with a deterministic in-memory fake
//! so handlers can be tested without a real image library, `zbar`, or a
//! network call to Gemini.

use async_trait::async_trait;
use barcode_core::{DetectionSource, PipelineError};

/// One rotated variant of a preprocessed image.
#[derive(Debug, Clone)]
pub struct RotationArtifactBytes {
    pub angle_degrees: u16,
    pub bytes: Vec<u8>,
}

/// Output of the Preprocess Handler's normalization step.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub jpeg_bytes: Vec<u8>,
    pub original_width: u32,
    pub original_height: u32,
    pub processed_width: u32,
    pub processed_height: u32,
    pub rotations: Vec<RotationArtifactBytes>,
}

/// Grayscale/CLAHE/denoise/rotate — the pixel work the pipeline contract
/// treats as an external collaborator.
#[async_trait]
pub trait ImageNormalizer: Send + Sync {
    async fn normalize(
        &self,
        source_bytes: &[u8],
        max_dimension: u32,
        denoise_strength: f32,
        rotation_angles: &[u16],
    ) -> Result<NormalizedImage, PipelineError>;
}

/// One raw decode result from the primary decoder, before validation.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub raw_code: String,
    pub source: DetectionSource,
    pub rotation: u16,
}

/// The third-party barcode decoder library.
#[async_trait]
pub trait PrimaryDecoder: Send + Sync {
    async fn decode(&self, image_bytes: &[u8], rotation: u16) -> Result<Vec<RawDetection>, PipelineError>;
}

/// One code as returned by the LLM's structured-output response.
#[derive(Debug, Clone)]
pub struct LlmCode {
    pub code: String,
    pub symbology: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub codes: Vec<LlmCode>,
    pub token_count: u64,
}

/// The fallback vision-LLM client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn extract_codes(&self, image_bytes: &[u8], prompt: &str) -> Result<LlmResponse, PipelineError>;
}

/// Gemini vision client for the Decode-Fallback Handler. Sends the image
/// inline as base64 alongside the extraction prompt and
/// expects the model to answer with the `{codes: [...]}` JSON the prompt
/// requests; anything that doesn't parse is a retriable transient error
/// rather than an input-invalid one, since a malformed response is usually
/// the model wrapping JSON in prose, not a permanent failure.
pub struct GeminiLlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(serde::Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(serde::Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(serde::Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(serde::Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(serde::Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(serde::Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(serde::Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(serde::Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(serde::Deserialize)]
struct GeminiUsageMetadata {
    #[serde(default)]
    total_token_count: u64,
}

#[derive(serde::Deserialize)]
struct ExtractedCodes {
    codes: Vec<LlmCode>,
}

impl<'de> serde::Deserialize<'de> for LlmCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            code: String,
            #[serde(default)]
            symbology: String,
            #[serde(default)]
            confidence: f64,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(LlmCode {
            code: raw.code,
            symbology: raw.symbology,
            confidence: raw.confidence,
        })
    }
}

impl GeminiLlmClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_output_tokens: u32, temperature: f32, timeout: std::time::Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::transient_io("decode_fallback", e))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_output_tokens,
            temperature,
        })
    }
}

#[async_trait]
impl LlmClient for GeminiLlmClient {
    async fn extract_codes(&self, image_bytes: &[u8], prompt: &str) -> Result<LlmResponse, PipelineError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let request = GenerateContentRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::Text { text: prompt.to_string() },
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: "image/jpeg".to_string(),
                            data: BASE64.encode(image_bytes),
                        },
                    },
                ],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::transient_io("decode_fallback", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::rate_limited("decode_fallback", "Gemini API rate limit"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::transient_io("decode_fallback", format!("Gemini API returned {status}: {body}")));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transient_io("decode_fallback", e))?;

        let token_count = parsed.usage_metadata.map(|u| u.total_token_count).unwrap_or(0);
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.as_str())
            .unwrap_or("");

        let extracted: ExtractedCodes = serde_json::from_str(text.trim())
            .map_err(|e| PipelineError::transient_io("decode_fallback", format!("unparseable Gemini response: {e}")))?;

        Ok(LlmResponse {
            codes: extracted.codes,
            token_count,
        })
    }
}

pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Pass-through normalizer: produces one rotation per requested angle,
    /// each identical to the source bytes, so handler tests can assert on
    /// path/record bookkeeping without real image processing.
    pub struct PassthroughNormalizer;

    #[async_trait]
    impl ImageNormalizer for PassthroughNormalizer {
        async fn normalize(
            &self,
            source_bytes: &[u8],
            _max_dimension: u32,
            _denoise_strength: f32,
            rotation_angles: &[u16],
        ) -> Result<NormalizedImage, PipelineError> {
            if source_bytes.is_empty() {
                return Err(PipelineError::input_invalid("preprocess", "empty source blob"));
            }
            Ok(NormalizedImage {
                jpeg_bytes: source_bytes.to_vec(),
                original_width: 1024,
                original_height: 768,
                processed_width: 1024,
                processed_height: 768,
                rotations: rotation_angles
                    .iter()
                    .map(|&angle| RotationArtifactBytes {
                        angle_degrees: angle,
                        bytes: source_bytes.to_vec(),
                    })
                    .collect(),
            })
        }
    }

    /// Scripted decoder: returns whatever `codes` were configured,
    /// regardless of input bytes, so handler tests control the scenario.
    pub struct ScriptedPrimaryDecoder {
        codes: Vec<String>,
    }

    impl ScriptedPrimaryDecoder {
        pub fn returning(codes: Vec<&str>) -> Self {
            Self {
                codes: codes.into_iter().map(String::from).collect(),
            }
        }

        pub fn returning_none() -> Self {
            Self { codes: vec![] }
        }
    }

    #[async_trait]
    impl PrimaryDecoder for ScriptedPrimaryDecoder {
        async fn decode(&self, _image_bytes: &[u8], rotation: u16) -> Result<Vec<RawDetection>, PipelineError> {
            // Only the 0-degree rotation yields codes; a real zbar/zxing
            // pass over a rotated duplicate of the same image would
            // otherwise double-count every code for every angle.
            if rotation != 0 {
                return Ok(vec![]);
            }
            Ok(self
                .codes
                .iter()
                .map(|code| RawDetection {
                    raw_code: code.clone(),
                    source: DetectionSource::PrimaryZbar,
                    rotation,
                })
                .collect())
        }
    }

    /// Scripted LLM client: returns one configured response per call,
    /// cycling through a script so a test can model retry-then-succeed.
    pub struct ScriptedLlmClient {
        responses: Mutex<Vec<Result<LlmResponse, PipelineError>>>,
    }

    impl ScriptedLlmClient {
        pub fn new(responses: Vec<Result<LlmResponse, PipelineError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        pub fn single(response: LlmResponse) -> Self {
            Self::new(vec![Ok(response)])
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn extract_codes(&self, _image_bytes: &[u8], _prompt: &str) -> Result<LlmResponse, PipelineError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(LlmResponse::default());
            }
            responses.remove(0)
        }
    }
}
