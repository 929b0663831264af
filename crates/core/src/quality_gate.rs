//! Quality gate scoring rules and refinement prompt derivation.
//!
//! Pure logic: the scoring itself is done by a pluggable collaborator in
//! `storyframe-pipeline`. This module decides what a score means
//! (accept / refine / give up), which candidate to keep when giving up,
//! and how refinement suggestions turn into a new prompt pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::prompt::PromptPair;

/// Scores are on a 0-10 scale.
pub const MAX_SCORE: f64 = 10.0;

/// Score substituted when the scorer is disabled or fails.
pub const FALLBACK_SCORE: f64 = 7.0;

/// Negative terms added on every refinement.
pub const REFINEMENT_NEGATIVES: &[&str] = &["low detail", "poor composition", "bad anatomy"];

// ---------------------------------------------------------------------------
// QualityAnalysis
// ---------------------------------------------------------------------------

/// Outcome of scoring one generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAnalysis {
    pub overall_score: f64,
    #[serde(default)]
    pub factor_scores: BTreeMap<String, f64>,
    /// Recomputed against the configured threshold by [`judged`](Self::judged).
    #[serde(default)]
    pub meets_threshold: bool,
    #[serde(default)]
    pub refinement_suggestions: Vec<String>,
}

impl QualityAnalysis {
    /// Conservative default: accept rather than stall the pipeline.
    pub fn fallback() -> Self {
        Self {
            overall_score: FALLBACK_SCORE,
            factor_scores: BTreeMap::new(),
            meets_threshold: true,
            refinement_suggestions: Vec::new(),
        }
    }

    /// Clamp the score into range and recompute `meets_threshold`.
    pub fn judged(mut self, threshold: f64) -> Self {
        self.overall_score = clamp_score(self.overall_score);
        self.meets_threshold = self.overall_score >= threshold;
        self
    }
}

/// Clamp to `[0, 10]`, mapping NaN to 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, MAX_SCORE)
    }
}

pub fn validate_threshold(threshold: f64) -> Result<(), CoreError> {
    if !(0.0..=MAX_SCORE).contains(&threshold) {
        return Err(CoreError::Validation(format!(
            "quality threshold must be between 0 and {MAX_SCORE}, got {threshold}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gate decision
// ---------------------------------------------------------------------------

/// What to do after an attempt has been scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Accept,
    /// Retry with a refined prompt; carries the 1-based refinement number.
    Refine(u32),
    GiveUp,
}

/// Decide the next transition given the analysis and refinements done so far.
pub fn decide(analysis: &QualityAnalysis, refinements_done: u32, max_refinements: u32) -> GateDecision {
    if analysis.meets_threshold {
        GateDecision::Accept
    } else if refinements_done < max_refinements {
        GateDecision::Refine(refinements_done + 1)
    } else {
        GateDecision::GiveUp
    }
}

/// Index of the best-scoring candidate; ties go to the earliest.
pub fn best_candidate(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

// ---------------------------------------------------------------------------
// Refinement prompts
// ---------------------------------------------------------------------------

/// Derive a refined prompt pair from scorer suggestions.
///
/// Suggestions are appended to the positive prompt (skipping ones already
/// present); suggestions phrased as "avoid X" / "no X" / "remove X" go to
/// the negative prompt instead. Standard refinement negatives are added
/// once.
pub fn refine_prompt(current: &PromptPair, suggestions: &[String]) -> PromptPair {
    let mut positive = current.positive_prompt.clone();
    let mut negative = current.negative_prompt.clone();

    for raw in suggestions {
        let suggestion = raw.trim().trim_end_matches('.');
        if suggestion.is_empty() {
            continue;
        }
        match negative_term(suggestion) {
            Some(term) => append_term(&mut negative, term),
            None => append_term(&mut positive, suggestion),
        }
    }
    for term in REFINEMENT_NEGATIVES {
        append_term(&mut negative, term);
    }

    PromptPair {
        positive_prompt: positive,
        negative_prompt: negative,
    }
}

fn negative_term(suggestion: &str) -> Option<&str> {
    let lower = suggestion.to_ascii_lowercase();
    ["avoid ", "no ", "remove ", "without "]
        .iter()
        .find(|prefix| lower.starts_with(*prefix))
        .map(|prefix| suggestion[prefix.len()..].trim())
        .filter(|term| !term.is_empty())
}

fn append_term(prompt: &mut String, term: &str) {
    if prompt.to_ascii_lowercase().contains(&term.to_ascii_lowercase()) {
        return;
    }
    if !prompt.trim().is_empty() {
        prompt.push_str(", ");
    }
    prompt.push_str(term);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
