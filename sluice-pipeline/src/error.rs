//! Error types for chain construction and execution

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while building or guarding a chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A constructor is already bound to this name
    #[error("processor '{0}' is already registered")]
    DuplicateName(String),

    /// Empty name or empty namespace segment
    #[error("invalid processor name '{0}'")]
    InvalidName(String),

    /// A chain entry names more than one action
    #[error("each processor must have exactly one action, but found {count} actions ({})", .actions.join(","))]
    AmbiguousAction { count: usize, actions: Vec<String> },

    /// A chain entry names no action at all
    #[error("no action configured for processor entry")]
    NoActionConfigured,

    /// The action is not registered
    #[error("the processor {name} does not exist. valid processors: {}", .valid.join(", "))]
    UnknownProcessor { name: String, valid: Vec<String> },

    /// The constructor rejected its config
    #[error("invalid config for '{action}': {reason}")]
    InvalidConfig { action: String, reason: String },

    /// A `when` or `if` section could not be parsed
    #[error("invalid condition: {0}")]
    Condition(String),

    /// A stage panicked and the panic was trapped
    #[error("stage '{stage}' panicked: {message}")]
    Panicked { stage: String, message: String },
}

impl PipelineError {
    pub fn invalid_config(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error comes from a configuration problem
    pub fn is_config_error(&self) -> bool {
        !matches!(self, Self::Panicked { .. })
    }
}
