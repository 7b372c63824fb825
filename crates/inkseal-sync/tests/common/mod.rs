//! Shared fixtures: several users on one in-memory backend.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use inkseal_core::config::{CacheConfig, PipelineConfig};
use inkseal_core::store::{MetadataStore, ObjectStore, ProfileDirectory, SecureKeyStore};
use inkseal_core::{EncryptedFileMetadata, KdfAlgorithm, StoreError, StoreResult};
use inkseal_crypto::{IdentityKeyService, PasswordKeyCache, PrimitiveProvider};
use inkseal_storage::{
    memory_operator, JsonMetadataStore, JsonProfileDirectory, MemoryKeyStore, OpendalObjectStore,
};
use inkseal_sync::FileEncryptionPipeline;
use opendal::Operator;
use secrecy::SecretString;

/// One backend (blobs, profiles, metadata) shared by every user.
pub struct World {
    pub op: Operator,
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub provider: Arc<PrimitiveProvider>,
}

impl World {
    pub fn new() -> Self {
        let op = memory_operator().unwrap();
        Self {
            objects: Arc::new(OpendalObjectStore::new(op.clone(), u64::MAX)),
            metadata: Arc::new(JsonMetadataStore::new(op.clone())),
            profiles: Arc::new(JsonProfileDirectory::new(op.clone())),
            provider: Arc::new(
                PrimitiveProvider::builder()
                    .kdf_algorithm(KdfAlgorithm::Sha256Stretch)
                    .build()
                    .unwrap(),
            ),
            op,
        }
    }

    /// A device for `user_id` with its own local key store, signed in with
    /// a fresh identity.
    pub async fn sign_up(&self, user_id: &str) -> Arc<IdentityKeyService> {
        let identity = self.device();
        identity
            .generate_and_backup(user_id, &password(user_id))
            .await
            .unwrap();
        identity
    }

    /// A device with empty local storage and nobody signed in.
    pub fn device(&self) -> Arc<IdentityKeyService> {
        let local: Arc<dyn SecureKeyStore> = Arc::new(MemoryKeyStore::new());
        let cache = Arc::new(PasswordKeyCache::with_store(
            Arc::clone(&self.provider),
            Arc::clone(&local),
            CacheConfig::default(),
        ));
        Arc::new(IdentityKeyService::new(
            Arc::clone(&self.provider),
            cache,
            Arc::clone(&self.profiles),
            local,
            3,
        ))
    }

    pub fn pipeline(&self, identity: Arc<IdentityKeyService>) -> FileEncryptionPipeline {
        self.pipeline_with(identity, fast_config())
    }

    pub fn pipeline_with(
        &self,
        identity: Arc<IdentityKeyService>,
        config: PipelineConfig,
    ) -> FileEncryptionPipeline {
        FileEncryptionPipeline::new(
            identity,
            Arc::clone(&self.objects),
            Arc::clone(&self.metadata),
            config,
        )
    }

    pub async fn blob_count(&self) -> usize {
        self.op
            .list_with("files/")
            .recursive(true)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.path().ends_with(".bin"))
            .count()
    }
}

pub fn password(user_id: &str) -> SecretString {
    SecretString::from(format!("{user_id}-correct horse battery staple"))
}

/// Default pipeline settings without retry delays.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        upload_base_backoff_ms: 1,
        ..Default::default()
    }
}

/// Deterministic bytes that zstd cannot shrink.
pub fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Object store failing the first `failures` puts with `error`.
pub struct FlakyObjectStore {
    pub inner: Arc<dyn ObjectStore>,
    pub failures: u32,
    pub error: fn() -> StoreError,
    pub puts: AtomicU32,
}

impl FlakyObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>, failures: u32, error: fn() -> StoreError) -> Self {
        Self {
            inner,
            failures,
            error,
            puts: AtomicU32::new(0),
        }
    }

    pub fn puts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err((self.error)());
        }
        self.inner.put(path, bytes, content_type).await
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }
}

/// Metadata store whose writes always fail.
pub struct BrokenMetadataStore;

#[async_trait]
impl MetadataStore for BrokenMetadataStore {
    async fn put(&self, _metadata: &EncryptedFileMetadata) -> StoreResult<()> {
        Err(StoreError::Backend("metadata database unavailable".into()))
    }

    async fn get(&self, _file_id: &str) -> StoreResult<Option<EncryptedFileMetadata>> {
        Ok(None)
    }

    async fn delete(&self, _file_id: &str) -> StoreResult<()> {
        Ok(())
    }
}
