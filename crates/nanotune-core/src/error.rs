//! Centralized error types for nanotune.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Main error type for nanotune operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NanoTuneError {
    /// Shapes violate an operator's contract.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        context: String,
    },

    /// The accountant or underlying allocator refused an allocation.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Quantization requested with an invalid block size or an empty tensor.
    #[error("Codec size error: {0}")]
    CodecSize(String),

    /// Backward invoked without the required cached activation.
    #[error("Missing activation '{0}' in cache")]
    MissingActivation(String),

    /// External kernel collaborator absent.
    #[error("Missing kernel: {0}")]
    MissingKernel(String),

    /// Loss called with no non-padding targets.
    #[error("Empty batch: {0}")]
    EmptyBatch(String),

    /// NaN or infinity detected in parameters after an optimizer step.
    #[error("Numerical instability at step {step}: {context}")]
    Numerical { step: usize, context: String },

    /// Checkpoint read/write failure.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Invalid configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, NanoTuneError>;

impl NanoTuneError {
    /// Check if the training loop may recover by skipping or retrying the step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NanoTuneError::AllocationFailed(_)
                | NanoTuneError::EmptyBatch(_)
                | NanoTuneError::Numerical { .. }
                | NanoTuneError::Io(_)
        )
    }

    /// Check if the error indicates a mis-wired forward/backward pair.
    /// These are fatal: retrying the step cannot fix the wiring.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NanoTuneError::ShapeMismatch { .. }
                | NanoTuneError::MissingActivation(_)
                | NanoTuneError::InvalidConfig(_)
        )
    }

    /// Shorthand constructor for shape mismatches.
    pub fn shape(context: &str, expected: &[usize], actual: &[usize]) -> Self {
        NanoTuneError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
            context: context.to_string(),
        }
    }
}

/// Helper for creating checkpoint errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> NanoTuneError {
    NanoTuneError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}
