use thiserror::Error;

/// Main error type for the nodeherd process supervisor
#[derive(Debug, Error)]
pub enum HerdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to launch process: {0}")]
    LaunchFailure(String),

    #[error("system error: {0}")]
    SystemError(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("fleet resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for nodeherd operations
pub type Result<T> = std::result::Result<T, HerdError>;
