//! The JSON job file a worker run consumes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use storyframe_core::generation::RawImage;
use storyframe_core::prompt::NarrativeContext;

/// One batch: `{ "scenes": [...], "narrative": {...}?, "reference_image": "path"? }`.
#[derive(Debug, Deserialize)]
pub struct Job {
    pub scenes: Vec<String>,
    #[serde(default)]
    pub narrative: Option<NarrativeContext>,
    /// Image that guides the first scene when continuity is enabled.
    #[serde(default)]
    pub reference_image: Option<PathBuf>,
}

impl Job {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("Invalid job file")
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        Self::parse(&bytes)
    }

    /// Decode the reference image, if the job names one.
    pub fn reference(&self) -> anyhow::Result<Option<RawImage>> {
        let Some(path) = &self.reference_image else {
            return Ok(None);
        };
        let image = image::open(path)
            .with_context(|| format!("Failed to open reference image {}", path.display()))?;
        Ok(Some(image))
    }
}
