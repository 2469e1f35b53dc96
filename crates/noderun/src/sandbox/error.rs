use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("execution timed out after {}ms", .limit.as_millis())]
    Timeout { limit: Duration },

    #[error("execution context failed: {message}")]
    Fatal { message: String },

    #[error("execution context disposed")]
    Disposed,

    #[error("non-error value thrown across the sandbox boundary")]
    NonErrorThrown,

    #[error("{name}: {message}")]
    Thrown {
        name: String,
        message: String,
        stack: Option<String>,
    },

    #[error("failed to compile entry point: {message}")]
    Compile { message: String },

    #[error("value cannot cross the sandbox boundary: {0}")]
    Transfer(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Errors after which the context is gone.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Disposed)
    }
}

pub type Result<T> = core::result::Result<T, ExecutionError>;
