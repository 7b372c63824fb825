use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by external collaborators (object storage, profile
/// directory, secure key storage, metadata store).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("authorization expired or rejected: {0}")]
    Unauthorized(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("record serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether repeating the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("reset by peer".into()).is_retryable());
        assert!(!StoreError::PayloadTooLarge { size: 10, limit: 5 }.is_retryable());
        assert!(!StoreError::Unauthorized("token expired".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::Backend("boom".into()).is_retryable());
    }
}
