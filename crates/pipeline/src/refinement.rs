//! Quality-gated refinement loop for one scene.
//!
//! ```text
//! Generated -> Scored -> Accepted
//!                     -> Refining(n) -> Generated -> Scored -> ...
//!                     -> GivenUp (keep best candidate)
//! ```
//!
//! Refinement always uses the backend that produced the initial image.
//! Every candidate is kept until the loop ends so giving up returns the
//! best one, ties going to the earliest.

use std::sync::Arc;

use serde::Serialize;
use storyframe_backends::GenerationBackend;
use storyframe_core::continuity::ContinuityGuide;
use storyframe_core::generation::{GenerationParams, GenerationRequest, GenerationResult};
use storyframe_core::prompt::{NarrativeContext, PromptPair};
use storyframe_core::quality_gate::{self, GateDecision, QualityAnalysis};
use storyframe_core::types::SceneIndex;
use tokio_util::sync::CancellationToken;

use crate::chain;
use crate::collaborators::{QualityScorer, ScoringInput};

/// States of the per-scene refinement machine, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementState {
    Generated,
    Scored,
    Accepted,
    Refining(u32),
    GivenUp,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
    Accepted,
    GivenUp,
    /// Cancellation was observed before a refinement could start.
    Cancelled,
}

/// Everything fixed for one scene while it is being refined.
#[derive(Debug, Clone)]
pub struct SceneAttempt<'a> {
    pub scene_index: SceneIndex,
    pub scene_description: &'a str,
    pub narrative: Option<&'a NarrativeContext>,
    pub params: &'a GenerationParams,
    pub guide: Option<Arc<ContinuityGuide>>,
    pub prompt: PromptPair,
}

/// The candidate the loop settled on.
#[derive(Debug)]
pub struct RefinementOutcome {
    pub result: GenerationResult,
    pub analysis: QualityAnalysis,
    pub prompt: PromptPair,
    pub status: RefinementStatus,
    /// Refinement generations that produced an image.
    pub iterations: u32,
}

struct Candidate {
    result: GenerationResult,
    analysis: QualityAnalysis,
    prompt: PromptPair,
}

pub struct RefinementController {
    /// `None` when scoring is disabled.
    scorer: Option<Arc<dyn QualityScorer>>,
    threshold: f64,
    max_iterations: u32,
}

impl RefinementController {
    pub fn new(
        scorer: Option<Arc<dyn QualityScorer>>,
        threshold: f64,
        max_iterations: u32,
    ) -> Self {
        Self {
            scorer,
            threshold,
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Score one image.
    ///
    /// Scorer output is re-judged against the configured threshold; a
    /// missing or failing scorer yields the accepting fallback.
    pub async fn assess(
        &self,
        attempt: &SceneAttempt<'_>,
        result: &GenerationResult,
        prompt: &str,
    ) -> QualityAnalysis {
        let Some(scorer) = &self.scorer else {
            return QualityAnalysis::fallback();
        };
        let input = ScoringInput {
            image: &result.image,
            prompt,
            scene_description: attempt.scene_description,
            narrative: attempt.narrative,
        };
        match scorer.score(input).await {
            Ok(analysis) => analysis.judged(self.threshold),
            Err(e) => {
                tracing::warn!(
                    scene_index = attempt.scene_index,
                    error = %e,
                    "Quality scorer failed, using default score",
                );
                QualityAnalysis::fallback()
            }
        }
    }

    /// Drive the refinement loop from an already generated first image.
    pub async fn run(
        &self,
        backend: &Arc<dyn GenerationBackend>,
        attempt: &SceneAttempt<'_>,
        initial: GenerationResult,
        cancel: &CancellationToken,
    ) -> RefinementOutcome {
        let scene_index = attempt.scene_index;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut prompt = attempt.prompt.clone();
        let mut current = initial;
        let mut refinements = 0u32;

        loop {
            log_state(scene_index, RefinementState::Generated);
            let analysis = self.assess(attempt, &current, &prompt.positive_prompt).await;
            current.raw_score = Some(analysis.overall_score);
            log_state(scene_index, RefinementState::Scored);
            tracing::debug!(
                scene_index,
                score = analysis.overall_score,
                threshold = self.threshold,
                "Candidate scored",
            );

            let decision = quality_gate::decide(&analysis, refinements, self.max_iterations);
            let suggestions = analysis.refinement_suggestions.clone();
            candidates.push(Candidate {
                result: current,
                analysis,
                prompt: prompt.clone(),
            });

            let next = match decision {
                GateDecision::Accept => {
                    log_state(scene_index, RefinementState::Accepted);
                    return settle(candidates, RefinementStatus::Accepted, refinements, true);
                }
                GateDecision::GiveUp => {
                    return self.give_up(scene_index, candidates, refinements);
                }
                GateDecision::Refine(n) => n,
            };

            if cancel.is_cancelled() {
                tracing::info!(scene_index, "Cancelled during refinement");
                return settle(candidates, RefinementStatus::Cancelled, refinements, false);
            }

            log_state(scene_index, RefinementState::Refining(next));
            prompt = quality_gate::refine_prompt(&prompt, &suggestions);
            let request = GenerationRequest::from_params(
                scene_index,
                prompt.positive_prompt.clone(),
                prompt.negative_prompt.clone(),
                attempt.params,
            )
            .with_guide(attempt.guide.clone());

            match chain::timed(backend, &request).await {
                Ok(result) => {
                    current = result;
                    refinements = next;
                }
                Err(e) => {
                    tracing::warn!(
                        scene_index,
                        backend = backend.id(),
                        iteration = next,
                        error = %e,
                        "Refinement generation failed",
                    );
                    return self.give_up(scene_index, candidates, refinements);
                }
            }
        }
    }

    fn give_up(
        &self,
        scene_index: SceneIndex,
        candidates: Vec<Candidate>,
        refinements: u32,
    ) -> RefinementOutcome {
        log_state(scene_index, RefinementState::GivenUp);
        let outcome = settle(candidates, RefinementStatus::GivenUp, refinements, false);
        tracing::warn!(
            scene_index,
            best_score = outcome.analysis.overall_score,
            threshold = self.threshold,
            iterations = refinements,
            "Quality threshold not met, keeping best candidate",
        );
        outcome
    }
}

fn log_state(scene_index: SceneIndex, state: RefinementState) {
    tracing::debug!(scene_index, state = ?state, "Refinement state");
}

/// Pick the final candidate: the latest when accepted, otherwise the best.
fn settle(
    mut candidates: Vec<Candidate>,
    status: RefinementStatus,
    iterations: u32,
    take_latest: bool,
) -> RefinementOutcome {
    let scores: Vec<f64> = candidates.iter().map(|c| c.analysis.overall_score).collect();
    let idx = if take_latest {
        candidates.len() - 1
    } else {
        quality_gate::best_candidate(&scores).unwrap_or(0)
    };
    let chosen = candidates.swap_remove(idx);
    RefinementOutcome {
        result: chosen.result,
        analysis: chosen.analysis,
        prompt: chosen.prompt,
        status,
        iterations,
    }
}
