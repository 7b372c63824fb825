//! FileEncryptionPipeline: compress, seal, wrap, upload, record.
//!
//! Upload flow:
//!   1. Fresh content key
//!   2. Read source, compress opportunistically (zstd)
//!   3. Seal in one pass, or chunk-by-chunk above the threshold
//!   4. Wrap the content key for the author and every recipient
//!   5. Upload the blob with retries
//!   6. Persist metadata, deleting the blob again if that fails
//!
//! Download reverses it: metadata -> reader's wrapped key -> blob (cached)
//! -> open -> decompress -> size check.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use inkseal_core::config::PipelineConfig;
use inkseal_core::store::{MetadataStore, ObjectStore};
use inkseal_core::{EncryptedFileMetadata, EncryptedKeyEntry, PayloadVersion, UserId};
use inkseal_crypto::{
    chunk_nonce, open_chunk, seal_chunk, CryptoError, IdentityKeyService, KeyPair,
    PrimitiveProvider, SymmetricKey, KEY_SIZE,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunking::{plaintext_ranges, should_chunk, split_sealed};
use crate::compress::{self, CompressionPolicy};
use crate::content_cache::ContentCache;
use crate::error::{SyncError, SyncResult};
use crate::progress::{report, scaled, ProgressSender, Stage};
use crate::scheduler::TaskRunner;
use crate::upload::{put_with_retry, RetryPolicy};

const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Where the plaintext of an upload comes from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct EncryptRequest {
    pub source: FileSource,
    pub file_name: String,
    pub mime_type: String,
    pub author_id: UserId,
    /// Readers besides the author. Duplicates and the author are ignored.
    pub recipient_ids: Vec<UserId>,
}

pub struct FileEncryptionPipeline {
    identity: Arc<IdentityKeyService>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    content_cache: ContentCache,
    config: PipelineConfig,
}

impl FileEncryptionPipeline {
    pub fn new(
        identity: Arc<IdentityKeyService>,
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            identity,
            objects,
            metadata,
            content_cache: ContentCache::new(config.content_cache_bytes),
            config,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityKeyService> {
        &self.identity
    }

    pub fn content_cache(&self) -> &ContentCache {
        &self.content_cache
    }

    fn provider(&self) -> Arc<PrimitiveProvider> {
        Arc::clone(self.identity.provider())
    }

    /// Session key pair, provided it belongs to `user_id`.
    fn keys_for(&self, user_id: &str) -> SyncResult<KeyPair> {
        match self.identity.current_user() {
            Some(current) if current == user_id => Ok(self.identity.session_keys()?),
            _ => Err(CryptoError::NotInitialized.into()),
        }
    }

    async fn public_key_of(
        &self,
        user_id: &str,
        keys: &KeyPair,
        me: &str,
    ) -> SyncResult<[u8; KEY_SIZE]> {
        if user_id == me {
            return Ok(*keys.public_key());
        }
        self.identity
            .public_key_of(user_id)
            .await?
            .ok_or_else(|| SyncError::UnknownUser(user_id.to_string()))
    }

    /// Encrypt a file for its author and `recipient_ids` and upload it.
    ///
    /// The author must be the signed-in user. Cancellation stops further
    /// chunks and upload attempts; a chunk already being sealed finishes.
    pub async fn encrypt_and_upload(
        &self,
        request: EncryptRequest,
        cancel: &CancellationToken,
        progress: Option<&ProgressSender>,
    ) -> SyncResult<EncryptedFileMetadata> {
        let author = request.author_id.clone();
        let keys = self.keys_for(&author)?;
        let provider = self.provider();
        let content_key = provider.generate_key();

        report(progress, Stage::Reading, 0);
        let plaintext = match request.source {
            FileSource::Path(path) => tokio::fs::read(&path).await?,
            FileSource::Bytes(bytes) => bytes,
        };
        let size = plaintext.len() as u64;
        check_cancelled(cancel)?;

        report(progress, Stage::Compressing, 5);
        let policy = CompressionPolicy::from_config(&self.config);
        let mime_type = request.mime_type.clone();
        let (payload, compressed) = tokio::task::spawn_blocking(move || {
            compress::maybe_compress(&plaintext, &mime_type, &policy)
                .map(|c| match c {
                    Some(compressed) => (compressed, true),
                    None => (plaintext, false),
                })
        })
        .await??;
        debug!(
            file = %request.file_name,
            size,
            payload = payload.len(),
            compressed,
            "prepared payload"
        );
        check_cancelled(cancel)?;

        report(progress, Stage::Encrypting, 10);
        let chunked = should_chunk(payload.len() as u64, self.config.chunk_threshold);
        let (blob, file_nonce, chunks, chunk_size) = if chunked {
            let chunk_size = self.config.chunk_size;
            let (blob, nonce, chunks) =
                seal_chunked(&provider, &content_key, payload, chunk_size, cancel, progress)
                    .await?;
            (blob, nonce, chunks, chunk_size as u64)
        } else {
            let p = Arc::clone(&provider);
            let key = content_key.clone();
            let (sealed, nonce) =
                tokio::task::spawn_blocking(move || p.encrypt(&payload, &key, None)).await??;
            (sealed, nonce.to_vec(), 1, 0)
        };
        report(progress, Stage::Encrypting, 80);
        check_cancelled(cancel)?;

        report(progress, Stage::WrappingKeys, 80);
        let mut readers: Vec<&str> = vec![author.as_str()];
        for id in &request.recipient_ids {
            if !readers.contains(&id.as_str()) {
                readers.push(id);
            }
        }
        let mut encrypted_keys = Vec::with_capacity(readers.len());
        for reader in readers {
            let public = self.public_key_of(reader, &keys, &author).await?;
            let wrapped =
                self.identity
                    .encrypt_for_peer(content_key.as_bytes(), &public, keys.private_key())?;
            encrypted_keys.push(EncryptedKeyEntry {
                user_id: reader.to_string(),
                encrypted_key: wrapped.ciphertext,
                nonce: wrapped.nonce,
            });
        }
        drop(content_key);

        report(progress, Stage::Uploading, 85);
        let file_id = uuid::Uuid::new_v4().to_string();
        let storage_path = format!("files/{author}/{file_id}.bin");
        let encrypted_size = blob.len() as u64;
        let attempts = put_with_retry(
            self.objects.as_ref(),
            &storage_path,
            blob,
            BLOB_CONTENT_TYPE,
            &RetryPolicy::from_config(&self.config),
            cancel,
        )
        .await?;

        report(progress, Stage::SavingMetadata, 95);
        let metadata = EncryptedFileMetadata {
            file_id: file_id.clone(),
            original_name: request.file_name,
            mime_type: request.mime_type,
            size,
            file_nonce,
            encrypted_keys,
            author_id: author,
            storage_path: storage_path.clone(),
            encrypted_size,
            chunks,
            chunk_size,
            compressed,
            created_at: unix_now(),
            version: PayloadVersion::V1,
        };

        if let Err(e) = self.metadata.put(&metadata).await {
            match self.objects.delete(&storage_path).await {
                Ok(()) => warn!(
                    file_id = %file_id,
                    path = %storage_path,
                    "metadata write failed, uploaded blob removed"
                ),
                Err(del) => warn!(
                    file_id = %file_id,
                    path = %storage_path,
                    error = %del,
                    "metadata write failed and blob cleanup failed, blob is orphaned"
                ),
            }
            return Err(e.into());
        }

        report(progress, Stage::Done, 100);
        info!(
            file_id = %metadata.file_id,
            size,
            encrypted_size,
            chunks,
            attempts,
            readers = metadata.encrypted_keys.len(),
            "encrypted and uploaded"
        );
        Ok(metadata)
    }

    /// Download and decrypt `file_id` as `user_id`, who must be signed in.
    pub async fn download_and_decrypt(&self, file_id: &str, user_id: &str) -> SyncResult<Vec<u8>> {
        let meta = self.load_metadata(file_id).await?;
        let entry = meta
            .entry_for(user_id)
            .ok_or_else(|| access_denied(file_id, user_id))?;
        let keys = self.keys_for(user_id)?;

        let author_public = self.public_key_of(&meta.author_id, &keys, user_id).await?;
        let raw_key = self.identity.decrypt_from_peer(
            &entry.payload(),
            &author_public,
            keys.private_key(),
        )?;
        let content_key = SymmetricKey::from_slice(&raw_key)?;
        drop(raw_key);

        let blob = match self.content_cache.get(&meta.storage_path) {
            Some(blob) => {
                debug!(file_id, "blob served from cache");
                blob
            }
            None => {
                let blob = Arc::new(self.objects.get(&meta.storage_path).await?);
                self.content_cache.insert(&meta.storage_path, Arc::clone(&blob));
                blob
            }
        };

        let result = self.open_blob(&meta, blob, content_key).await;
        if let Err(e) = &result {
            if e.is_integrity_error() {
                self.content_cache.remove(&meta.storage_path);
            }
        }
        let plaintext = result?;
        debug!(file_id, size = plaintext.len(), "downloaded and decrypted");
        Ok(plaintext)
    }

    async fn open_blob(
        &self,
        meta: &EncryptedFileMetadata,
        blob: Arc<Vec<u8>>,
        key: SymmetricKey,
    ) -> SyncResult<Vec<u8>> {
        let provider = self.provider();
        let chunk_size = usize::try_from(meta.chunk_size)
            .map_err(|_| SyncError::Integrity(format!("chunk size {} too large", meta.chunk_size)))?;
        let chunks = meta.chunks;
        let chunked = meta.is_chunked();
        let nonce = meta.file_nonce.clone();

        let payload = tokio::task::spawn_blocking(move || -> SyncResult<Vec<u8>> {
            if chunked {
                let parts = split_sealed(&blob, chunk_size, chunks)?;
                let mut out = Vec::with_capacity(chunk_size * parts.len());
                for part in parts {
                    out.extend_from_slice(&open_chunk(&provider, &key, part)?);
                }
                Ok(out)
            } else {
                Ok(provider.decrypt(&blob, &key, &nonce)?)
            }
        })
        .await??;

        let plaintext = if meta.compressed {
            compress::decompress(&payload, meta.size)?
        } else {
            payload
        };
        if plaintext.len() as u64 != meta.size {
            return Err(SyncError::Integrity(format!(
                "file {} decrypted to {} bytes, metadata says {}",
                meta.file_id,
                plaintext.len(),
                meta.size
            )));
        }
        Ok(plaintext)
    }

    /// Remove the blob and its metadata. Only the author may delete.
    pub async fn delete_file(&self, file_id: &str, user_id: &str) -> SyncResult<()> {
        let meta = self.load_metadata(file_id).await?;
        if meta.author_id != user_id {
            return Err(access_denied(file_id, user_id));
        }
        self.objects.delete(&meta.storage_path).await?;
        self.content_cache.remove(&meta.storage_path);
        self.metadata.delete(file_id).await?;
        info!(file_id, "deleted encrypted file");
        Ok(())
    }

    /// Give `reader_id` a wrapped copy of the content key. The signed-in user
    /// must be the author; the blob is not touched.
    pub async fn grant_access(
        &self,
        file_id: &str,
        reader_id: &str,
    ) -> SyncResult<EncryptedFileMetadata> {
        let mut meta = self.load_metadata(file_id).await?;
        let author = meta.author_id.clone();
        if self.identity.current_user().as_deref() != Some(author.as_str()) {
            let caller = self.identity.current_user().unwrap_or_default();
            return Err(access_denied(file_id, &caller));
        }
        if meta.entry_for(reader_id).is_some() {
            debug!(file_id, reader_id, "reader already has access");
            return Ok(meta);
        }

        let keys = self.keys_for(&author)?;
        let own = meta
            .entry_for(&author)
            .ok_or_else(|| access_denied(file_id, &author))?;
        let raw_key =
            self.identity
                .decrypt_from_peer(&own.payload(), keys.public_key(), keys.private_key())?;
        let content_key = SymmetricKey::from_slice(&raw_key)?;
        drop(raw_key);

        let reader_public = self.public_key_of(reader_id, &keys, &author).await?;
        let wrapped = self.identity.encrypt_for_peer(
            content_key.as_bytes(),
            &reader_public,
            keys.private_key(),
        )?;
        meta.encrypted_keys.push(EncryptedKeyEntry {
            user_id: reader_id.to_string(),
            encrypted_key: wrapped.ciphertext,
            nonce: wrapped.nonce,
        });
        self.metadata.put(&meta).await?;
        info!(file_id, reader_id, "granted read access");
        Ok(meta)
    }

    async fn load_metadata(&self, file_id: &str) -> SyncResult<EncryptedFileMetadata> {
        self.metadata
            .get(file_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(file_id.to_string()))
    }
}

impl TaskRunner for FileEncryptionPipeline {
    type Params = EncryptRequest;
    type Output = EncryptedFileMetadata;

    fn run(
        &self,
        params: EncryptRequest,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> impl Future<Output = SyncResult<EncryptedFileMetadata>> + Send {
        async move {
            self.encrypt_and_upload(params, &cancel, Some(&progress))
                .await
        }
    }
}

/// Seal `payload` chunk by chunk on blocking workers, yielding in between.
///
/// Returns the blob, the first chunk's nonce, and the chunk count.
async fn seal_chunked(
    provider: &Arc<PrimitiveProvider>,
    key: &SymmetricKey,
    payload: Vec<u8>,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: Option<&ProgressSender>,
) -> SyncResult<(Vec<u8>, Vec<u8>, u32)> {
    let ranges = plaintext_ranges(payload.len(), chunk_size);
    let total = ranges.len();
    let chunks = u32::try_from(total)
        .map_err(|_| SyncError::Integrity(format!("{total} chunks exceed the layout limit")))?;
    let payload = Arc::new(payload);
    let mut blob = Vec::with_capacity(payload.len() + total * inkseal_crypto::CHUNK_OVERHEAD);
    let mut first_nonce = Vec::new();

    for (i, range) in ranges.into_iter().enumerate() {
        check_cancelled(cancel)?;
        let p = Arc::clone(provider);
        let k = key.clone();
        let data = Arc::clone(&payload);
        let framed =
            tokio::task::spawn_blocking(move || seal_chunk(&p, &k, &data[range])).await??;
        if i == 0 {
            first_nonce = chunk_nonce(&framed).map(<[u8]>::to_vec).unwrap_or_default();
        }
        blob.extend_from_slice(&framed);
        report(progress, Stage::Encrypting, scaled(10, 80, i + 1, total));
        tokio::task::yield_now().await;
    }

    debug!(chunks, chunk_size, "sealed chunked payload");
    Ok((blob, first_nonce, chunks))
}

fn check_cancelled(cancel: &CancellationToken) -> SyncResult<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

fn access_denied(file_id: &str, user_id: &str) -> SyncError {
    SyncError::AccessDenied {
        file_id: file_id.to_string(),
        user_id: user_id.to_string(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
