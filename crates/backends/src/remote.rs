//! HTTP client for a remote inference service.
//!
//! Sends `POST {host}/generate` with the request parameters as JSON and
//! expects `{"images": ["<base64 PNG>", ...]}` back. Transport failures,
//! timeouts and non-2xx statuses are [`BackendError::Unavailable`]; a
//! successful response without a decodable image is
//! [`BackendError::Failed`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use storyframe_core::config::BackendKind;
use storyframe_core::generation::{GenerationRequest, RawImage};

use crate::backend::GenerationBackend;
use crate::error::BackendError;

/// Body of `POST /generate`.
#[derive(Debug, Serialize)]
struct GeneratePayload<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f32,
    sampler: &'a str,
    seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuity: Option<ContinuityPayload>,
}

/// Guidance maps as base64 PNG.
#[derive(Debug, Serialize)]
struct ContinuityPayload {
    edge_map: String,
    depth_map: String,
}

/// Response from `POST /generate`.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    images: Vec<String>,
}

/// HTTP client for one inference service.
pub struct RemoteService {
    client: reqwest::Client,
    host: String,
}

impl RemoteService {
    /// Create a client for `host` (e.g. `http://127.0.0.1:7860`) with a
    /// per-request timeout.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, host))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    // ---- private helpers ----

    fn payload<'a>(request: &'a GenerationRequest) -> Result<GeneratePayload<'a>, BackendError> {
        let continuity = match &request.continuity_guide {
            Some(guide) => Some(ContinuityPayload {
                edge_map: BASE64.encode(guide.edge_png()?),
                depth_map: BASE64.encode(guide.depth_png()?),
            }),
            None => None,
        };
        Ok(GeneratePayload {
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            width: request.width,
            height: request.height,
            steps: request.steps,
            cfg_scale: request.guidance_scale,
            sampler: &request.sampler,
            seed: request.seed,
            continuity,
        })
    }

    /// Ensure the response has a success status code.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Unavailable(format!(
                "inference service returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for RemoteService {
    fn id(&self) -> &str {
        BackendKind::Remote.id()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<RawImage, BackendError> {
        request.validate()?;
        let payload = Self::payload(request)?;

        tracing::debug!(
            scene_index = request.scene_index,
            host = %self.host,
            width = request.width,
            height = request.height,
            steps = request.steps,
            "Submitting generation to remote service",
        );

        let response = self
            .client
            .post(format!("{}/generate", self.host))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Unavailable(format!("request to {} timed out", self.host))
                } else {
                    BackendError::Unavailable(format!("request to {} failed: {e}", self.host))
                }
            })?;

        let response = Self::ensure_success(response).await?;
        let body: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Unavailable(format!("response from {} timed out", self.host))
            } else {
                BackendError::Failed(format!("malformed response body: {e}"))
            }
        })?;

        decode_first_image(&body.images)
    }
}

/// Decode the first base64 image, tolerating a `data:` URL prefix.
fn decode_first_image(images: &[String]) -> Result<RawImage, BackendError> {
    let encoded = images
        .first()
        .ok_or_else(|| BackendError::Failed("response contained no images".to_string()))?;
    let encoded = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded.as_str(),
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| BackendError::Failed(format!("image is not valid base64: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| BackendError::Failed(format!("image could not be decoded: {e}")))
}
