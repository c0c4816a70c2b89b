//! Error types for the orchestrator

use sluice_pipeline::PipelineError;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by [`crate::PipelineModule`] and its collaborators
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No pipeline with this name
    #[error("pipeline not found: {0}")]
    NotFound(String),

    /// The pipeline must be stopped first
    #[error("pipeline {0} is still running, stop it before deleting")]
    StillRunning(String),

    /// The chain of a definition could not be built
    #[error("failed to build pipeline: {0}")]
    Build(#[from] PipelineError),

    /// The module is shutting down and accepts no new pipelines
    #[error("pipeline module is shutting down")]
    ShuttingDown,

    /// Some supervising loops did not exit in time
    #[error("timed out waiting for pipelines to stop: {}", .0.join(", "))]
    ShutdownTimeout(Vec<String>),

    /// The lock service failed
    #[error("lock error: {0}")]
    Lock(String),
}

impl OrchestratorError {
    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
