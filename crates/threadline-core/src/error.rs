// Error types for program execution

use thiserror::Error;

/// Result type alias for execution operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors that can occur while loading or executing a program
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Program could not be loaded
    #[error("failed to load program: {0}")]
    Load(String),

    /// Engine failed while running the program
    #[error("failed to run program: {0}")]
    Execution(String),

    /// Event bus fan-out task is gone
    #[error("event bus is closed")]
    BusClosed,

    /// Execution task ended without delivering a result
    #[error("execution ended without a result")]
    Abandoned,
}

impl ExecutionError {
    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        ExecutionError::Load(msg.into())
    }

    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        ExecutionError::Execution(msg.into())
    }
}
