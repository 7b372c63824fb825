use inkseal_core::StoreError;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no identity key pair loaded for this session")]
    NotInitialized,

    #[error("wrong password: key backup could not be unlocked")]
    WrongPassword,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("no secure random source available: {0}")]
    NoSecureRandom(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("no usable secret-box backend: {0}")]
    BackendUnavailable(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid {what} length: {actual} bytes (expected {expected})")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("key storage: {0}")]
    Store(#[from] StoreError),

    #[error("background crypto task failed: {0}")]
    Join(String),
}

impl CryptoError {
    /// The user should be asked for their password again.
    pub fn is_password_error(&self) -> bool {
        matches!(self, CryptoError::WrongPassword)
    }

    /// Ciphertext was tampered with or sealed under another key. Retrying
    /// cannot help.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, CryptoError::DecryptionFailed(_))
    }
}

impl From<tokio::task::JoinError> for CryptoError {
    fn from(e: tokio::task::JoinError) -> Self {
        CryptoError::Join(e.to_string())
    }
}
