use inkseal_core::{StoreError, UserId};
use inkseal_crypto::CryptoError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("access denied: {user_id} cannot use file {file_id}")]
    AccessDenied { file_id: String, user_id: UserId },

    #[error("no public key published for user {0}")]
    UnknownUser(UserId),

    #[error("upload failed after {attempts} attempt(s): {source}")]
    UploadFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compression: {0}")]
    Compression(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("background task failed: {0}")]
    Join(String),
}

impl SyncError {
    pub fn is_password_error(&self) -> bool {
        matches!(self, SyncError::Crypto(e) if e.is_password_error())
    }

    /// Stored data did not authenticate or does not match its metadata.
    pub fn is_integrity_error(&self) -> bool {
        match self {
            SyncError::Crypto(e) => e.is_integrity_error(),
            SyncError::Integrity(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Join(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Crypto(CryptoError::WrongPassword).is_password_error());
        assert!(SyncError::Crypto(CryptoError::DecryptionFailed("tag".into())).is_integrity_error());
        assert!(SyncError::Integrity("size".into()).is_integrity_error());
        assert!(!SyncError::Cancelled.is_integrity_error());
        assert!(SyncError::Cancelled.is_cancelled());

        let upload = SyncError::UploadFailed {
            attempts: 3,
            source: StoreError::Transient("timeout".into()),
        };
        assert!(upload.to_string().contains("3 attempt"));
    }
}
