//! inkseal-core: shared data model, configuration schema, error types, and the
//! traits through which the engine talks to object storage, the profile
//! directory, secure local key storage, and file-metadata persistence.

pub mod config;
pub mod encoding;
pub mod error;
pub mod store;
pub mod types;

pub use error::{CoreError, CoreResult, StoreError, StoreResult};
pub use types::{
    EncryptedFileMetadata, EncryptedKeyEntry, EncryptedPayload, FileId, KdfAlgorithm, KdfParams,
    PayloadVersion, TaskId, TaskStatus, UserId, WrappedPrivateKey,
};
