//! Deterministic prompt templates.
//!
//! Used directly when no prompt-writing service is configured, and as the
//! fallback whenever that service fails. The template appends a fixed set
//! of quality boosters plus an orientation hint derived from the target
//! aspect ratio.

use serde::{Deserialize, Serialize};

/// Boosters appended to every templated positive prompt.
pub const QUALITY_BOOSTERS: &[&str] = &[
    "highly detailed",
    "sharp focus",
    "cinematic lighting",
    "professional photography",
    "8k",
];

/// Negative prompt used when nothing better is available.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, deformed, \
     watermark, text, signature, jpeg artifacts, cropped, out of frame";

/// Story-level context for a batch of scenes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeContext {
    pub title: String,
    pub topic: String,
    #[serde(default)]
    pub script_excerpt: String,
}

/// Backend-ready prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive_prompt: String,
    pub negative_prompt: String,
}

/// Composition hint for the target aspect ratio.
pub fn orientation_hint(width: u32, height: u32) -> &'static str {
    if height > width {
        "vertical composition, portrait orientation"
    } else if width > height {
        "wide composition, landscape orientation"
    } else {
        "centered composition, square format"
    }
}

/// Build a prompt pair from a scene description without any AI help.
pub fn template_prompt(
    scene_description: &str,
    narrative: Option<&NarrativeContext>,
    width: u32,
    height: u32,
) -> PromptPair {
    let mut parts: Vec<String> = vec![scene_description.trim().to_string()];
    if let Some(ctx) = narrative {
        let topic = ctx.topic.trim();
        if !topic.is_empty() {
            parts.push(format!("themed around {topic}"));
        }
    }
    parts.extend(QUALITY_BOOSTERS.iter().map(|s| s.to_string()));
    parts.push(orientation_hint(width, height).to_string());

    PromptPair {
        positive_prompt: parts.join(", "),
        negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
    }
}
