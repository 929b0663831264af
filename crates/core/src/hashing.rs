//! SHA-256 digests and result-cache key derivation.
//!
//! Cache keys are a pure function of everything that affects the visual
//! output of a generation. The inputs are serialized to JSON in a fixed
//! field order before hashing, so identical tuples always produce the
//! same key across processes.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Every input that determines the image a generation produces.
#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyInput<'a> {
    pub scene_description: &'a str,
    /// Style prompt applied to every scene (before adaptation).
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub sampler: &'a str,
    /// `None` means a fresh random seed per attempt.
    pub seed: Option<u64>,
    pub backend_id: &'a str,
}

/// Derive the cache key for a generation.
pub fn cache_key(input: &CacheKeyInput<'_>) -> String {
    // Serializing a plain struct of strings and numbers cannot fail.
    let canonical = serde_json::to_vec(input).unwrap_or_default();
    sha256_hex(&canonical)
}
