//! Error types for the generation engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for pipeline execution, scheduling and storage
#[derive(Error, Debug)]
pub enum EngineError {
    /// Pipeline shape violation: bad multiplier placement, undeclared
    /// output keys, malformed config structure. Never swallowed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown block type at pipeline materialisation
    #[error("block '{block_type}' not found (available: {available:?})")]
    BlockNotFound {
        block_type: String,
        available: Vec<String>,
    },

    /// A block failed mid-pipeline; wraps the original failure with
    /// post-mortem detail
    #[error("block '{block_type}' failed at step {step}: {message}")]
    BlockExecution {
        block_type: String,
        step: usize,
        message: String,
        input: serde_json::Value,
    },

    /// Semantic failure raised inside a block body. The executor wraps
    /// this into [`EngineError::BlockExecution`] with step context.
    #[error("{0}")]
    Block(String),

    /// Requested model name unknown and no fallback applicable
    #[error("llm config not found: {0}")]
    LlmConfigNotFound(String),

    /// Missing installer, install failure or install timeout
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Template syntax error or undefined variable
    #[error("template error: {message} (template: {template})")]
    Template { template: String, message: String },

    /// Admission control: another job is already running
    #[error("job {0} is already running, cancel it first")]
    JobConflict(i64),

    /// Provider call failed
    #[error("provider error: {0}")]
    Provider(String),

    /// File watcher error
    #[error("watcher error: {0}")]
    Watcher(String),

    /// Database error
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for errors that must propagate unchanged through the executor
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}
