use storyframe_core::error::CoreError;

/// Errors a generation backend can return.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or did not answer in time.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend ran but produced no usable image.
    #[error("Generation failed: {0}")]
    Failed(String),

    /// Device memory could not be admitted, even after cleanup.
    #[error("Insufficient device memory: required {required} bytes, available {available} bytes")]
    ResourceExhausted { required: u64, available: u64 },

    /// The request itself is malformed. Never retried.
    #[error("Invalid generation request: {0}")]
    Validation(String),
}

impl BackendError {
    /// Whether trying another backend could help.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

impl From<CoreError> for BackendError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::ResourceExhausted {
                required,
                available,
            } => Self::ResourceExhausted {
                required,
                available,
            },
            other => Self::Failed(other.to_string()),
        }
    }
}
