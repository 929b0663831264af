//! Clients for the external prompt-writing and quality-scoring services.
//!
//! Both services are optional. Callers treat any [`CollaboratorError`]
//! as a signal to use the deterministic fallback (template prompt,
//! default score), so nothing here retries.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use storyframe_core::generation::RawImage;
use storyframe_core::prompt::{NarrativeContext, PromptPair};
use storyframe_core::quality_gate::QualityAnalysis;

/// Errors from a collaborator service.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Collaborator API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// The service answered with something unusable.
    #[error("Malformed collaborator response: {0}")]
    Malformed(String),

    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Writes backend-ready prompts for a scene.
#[async_trait]
pub trait PromptWriter: Send + Sync {
    async fn write_prompt(
        &self,
        scene_description: &str,
        narrative: Option<&NarrativeContext>,
    ) -> Result<PromptPair, CollaboratorError>;
}

/// Everything a scorer sees about one generated image.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub image: &'a RawImage,
    pub prompt: &'a str,
    pub scene_description: &'a str,
    pub narrative: Option<&'a NarrativeContext>,
}

/// Scores a generated image on a 0-10 scale.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, input: ScoringInput<'_>) -> Result<QualityAnalysis, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// HTTP clients
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    scene_description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    narrative_context: Option<&'a NarrativeContext>,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    positive_prompt: String,
    #[serde(default)]
    negative_prompt: String,
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    /// Base64 PNG.
    image: String,
    prompt: &'a str,
    scene_description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    narrative_context: Option<&'a NarrativeContext>,
}

/// Shared plumbing for the two collaborator clients.
#[derive(Debug, Clone)]
struct ServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl ServiceClient {
    fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, CollaboratorError>
    where
        B: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(CollaboratorError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

/// `POST {url}/prompt` client.
#[derive(Debug, Clone)]
pub struct HttpPromptWriter {
    inner: ServiceClient,
}

impl HttpPromptWriter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            inner: ServiceClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl PromptWriter for HttpPromptWriter {
    async fn write_prompt(
        &self,
        scene_description: &str,
        narrative: Option<&NarrativeContext>,
    ) -> Result<PromptPair, CollaboratorError> {
        let body = PromptRequest {
            scene_description,
            narrative_context: narrative,
        };
        let response: PromptResponse = self.inner.post("/prompt", &body).await?;
        if response.positive_prompt.trim().is_empty() {
            return Err(CollaboratorError::Malformed("empty positive_prompt".to_string()));
        }
        Ok(PromptPair {
            positive_prompt: response.positive_prompt,
            negative_prompt: response.negative_prompt,
        })
    }
}

/// `POST {url}/score` client.
#[derive(Debug, Clone)]
pub struct HttpQualityScorer {
    inner: ServiceClient,
}

impl HttpQualityScorer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            inner: ServiceClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl QualityScorer for HttpQualityScorer {
    async fn score(&self, input: ScoringInput<'_>) -> Result<QualityAnalysis, CollaboratorError> {
        let mut png = Cursor::new(Vec::new());
        input.image.write_to(&mut png, image::ImageFormat::Png)?;

        let body = ScoreRequest {
            image: BASE64.encode(png.into_inner()),
            prompt: input.prompt,
            scene_description: input.scene_description,
            narrative_context: input.narrative,
        };
        let analysis: QualityAnalysis = self.inner.post("/score", &body).await?;
        if !analysis.overall_score.is_finite() {
            return Err(CollaboratorError::Malformed(format!(
                "overall_score is not a number: {}",
                analysis.overall_score
            )));
        }
        Ok(analysis)
    }
}
