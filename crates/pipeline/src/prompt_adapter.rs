//! Scene description to backend-ready prompt pair.
//!
//! Uses the prompt-writing collaborator when one is configured and falls
//! back to the deterministic template on any failure.

use std::sync::Arc;

use storyframe_core::prompt::{
    template_prompt, NarrativeContext, PromptPair, DEFAULT_NEGATIVE_PROMPT,
};

use crate::collaborators::PromptWriter;

pub struct PromptAdapter {
    writer: Option<Arc<dyn PromptWriter>>,
    width: u32,
    height: u32,
}

impl PromptAdapter {
    /// `width`/`height` are the generation resolution, used for the
    /// template's orientation hint.
    pub fn new(writer: Option<Arc<dyn PromptWriter>>, width: u32, height: u32) -> Self {
        Self {
            writer,
            width,
            height,
        }
    }

    /// Template-only adapter.
    pub fn template(width: u32, height: u32) -> Self {
        Self::new(None, width, height)
    }

    pub async fn adapt(
        &self,
        scene_description: &str,
        narrative: Option<&NarrativeContext>,
    ) -> PromptPair {
        let Some(writer) = &self.writer else {
            return template_prompt(scene_description, narrative, self.width, self.height);
        };

        match writer.write_prompt(scene_description, narrative).await {
            Ok(pair) if pair.positive_prompt.trim().is_empty() => {
                tracing::warn!("Prompt writer returned an empty prompt, using template prompt");
                template_prompt(scene_description, narrative, self.width, self.height)
            }
            Ok(mut pair) => {
                if pair.negative_prompt.trim().is_empty() {
                    pair.negative_prompt = DEFAULT_NEGATIVE_PROMPT.to_string();
                }
                pair
            }
            Err(e) => {
                tracing::warn!(error = %e, "Prompt writer failed, using template prompt");
                template_prompt(scene_description, narrative, self.width, self.height)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::collaborators::CollaboratorError;

    struct FixedWriter(Result<PromptPair, ()>);

    #[async_trait]
    impl PromptWriter for FixedWriter {
        async fn write_prompt(
            &self,
            _scene_description: &str,
            _narrative: Option<&NarrativeContext>,
        ) -> Result<PromptPair, CollaboratorError> {
            self.0
                .clone()
                .map_err(|()| CollaboratorError::Malformed("down".into()))
        }
    }

    #[tokio::test]
    async fn without_writer_uses_template() {
        let adapter = PromptAdapter::template(512, 768);
        let pair = adapter.adapt("a forest", None).await;
        assert_eq!(pair, template_prompt("a forest", None, 512, 768));
    }

    #[tokio::test]
    async fn writer_failure_falls_back_to_template() {
        let adapter = PromptAdapter::new(Some(Arc::new(FixedWriter(Err(())))), 512, 768);
        let pair = adapter.adapt("a forest", None).await;
        assert!(pair.positive_prompt.starts_with("a forest"));
        assert_eq!(pair.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
    }

    #[tokio::test]
    async fn writer_output_is_used_with_default_negative() {
        let writer = FixedWriter(Ok(PromptPair {
            positive_prompt: "misty pine forest at dawn".into(),
            negative_prompt: String::new(),
        }));
        let adapter = PromptAdapter::new(Some(Arc::new(writer)), 512, 768);
        let pair = adapter.adapt("a forest", None).await;
        assert_eq!(pair.positive_prompt, "misty pine forest at dawn");
        assert_eq!(pair.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
    }

    #[tokio::test]
    async fn blank_writer_prompt_falls_back_to_template() {
        let writer = FixedWriter(Ok(PromptPair {
            positive_prompt: "   ".into(),
            negative_prompt: "text".into(),
        }));
        let adapter = PromptAdapter::new(Some(Arc::new(writer)), 512, 768);
        let pair = adapter.adapt("a forest", None).await;
        assert_eq!(pair, template_prompt("a forest", None, 512, 768));
    }
}
