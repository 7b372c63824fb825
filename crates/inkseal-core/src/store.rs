//! Contracts for the collaborators the engine consumes but does not own.
//!
//! Everything handed to these traits is already ciphertext or public material;
//! implementations never see plaintext content or unwrapped private keys,
//! except [`SecureKeyStore`], which is the device-local vault.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{EncryptedFileMetadata, WrappedPrivateKey};

/// Remote blob storage. Assumed durable once `put` returns `Ok`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()>;

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> StoreResult<()>;
}

/// Key fields on the remote user profile.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_public_key(&self, user_id: &str) -> StoreResult<Option<[u8; 32]>>;

    async fn set_public_key(&self, user_id: &str, key: [u8; 32]) -> StoreResult<()>;

    async fn get_wrapped_private_key(&self, user_id: &str)
        -> StoreResult<Option<WrappedPrivateKey>>;

    async fn set_wrapped_private_key(
        &self,
        user_id: &str,
        wrapped: &WrappedPrivateKey,
    ) -> StoreResult<()>;
}

/// Device-local secret storage (platform keychain or equivalent). Survives
/// process restarts, not device loss. Callers scope names per user.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    async fn set(&self, name: &str, bytes: &[u8]) -> StoreResult<()>;

    async fn get(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Deleting a missing entry is not an error.
    async fn delete(&self, name: &str) -> StoreResult<()>;
}

/// Persistence for [`EncryptedFileMetadata`] rows.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, metadata: &EncryptedFileMetadata) -> StoreResult<()>;

    async fn get(&self, file_id: &str) -> StoreResult<Option<EncryptedFileMetadata>>;

    async fn delete(&self, file_id: &str) -> StoreResult<()>;
}
