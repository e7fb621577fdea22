use thiserror::Error;

/// Errors that can occur when interacting with the key-value service.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key holds a value of a different type than the command expects.
    #[error("wrong value type for key '{0}'")]
    WrongType(String),

    /// The backing service failed or was unreachable.
    #[error("key-value backend error: {0}")]
    Backend(String),
}

/// Result type for key-value operations.
pub type Result<T> = std::result::Result<T, KvError>;
