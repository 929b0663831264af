//! Domain logic for the storyframe generative-image pipeline.
//!
//! Everything in this crate is backend-agnostic: device memory
//! admission, scoped resource cleanup, the content-addressed result
//! cache, quality scoring rules, prompt templates and continuity
//! guidance. Network and process integrations live in
//! `storyframe-backends` and `storyframe-pipeline`.

pub mod cache;
pub mod clock;
pub mod config;
pub mod continuity;
pub mod error;
pub mod generation;
pub mod guard;
pub mod hashing;
pub mod memory;
pub mod prompt;
pub mod quality_gate;
pub mod types;
