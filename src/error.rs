//! Error types for the noise-suppression pipeline.

use crate::denoiser::DenoiserType;

/// Artifact classification for load failures, so callers can tell which
/// asset broke (the compute kernel vs the model blob).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Kernel,
    Model,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Kernel => f.write_str("kernel"),
            Artifact::Model => f.write_str("model"),
        }
    }
}

/// Top-level error type.
///
/// The enum is `Clone` on purpose: the single-flight loader resolves one
/// in-flight materialization for many concurrent waiters, and every waiter
/// receives the same failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("operation requires initialize: {0}")]
    NotInitialized(String),

    #[error("frame size mismatch: expected {expected}, got {got}")]
    FrameSizeMismatch { expected: usize, got: usize },

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("unknown denoiser type: {0:?}")]
    UnknownDenoiserType(DenoiserType),

    #[error("denoiser type not supported in this environment: {0:?}")]
    UnsupportedDenoiserType(DenoiserType),

    #[error("no denoiser available")]
    NoDenoiserAvailable,

    #[error("failed to load {artifact}: {message}")]
    LoadFailure { artifact: Artifact, message: String },

    #[error("kernel allocation failed: {0}")]
    KernelAllocation(String),

    #[error("kernel inference failed: {0}")]
    Inference(String),

    #[error("pipeline aborted")]
    Aborted,

    #[error("downstream track closed")]
    DownstreamClosed,
}

impl PipelineError {
    pub fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    pub fn load(artifact: Artifact, msg: impl std::fmt::Display) -> Self {
        Self::LoadFailure {
            artifact,
            message: msg.to_string(),
        }
    }

    /// Benign errors end a session without being logged as errors.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Aborted | Self::DownstreamClosed)
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
