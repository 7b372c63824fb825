//! JSON records on an OpenDAL operator.
//!
//! ```text
//! profiles/<user_id>.json   { public_key?, wrapped_private_key? }
//! metadata/<file_id>.json   EncryptedFileMetadata
//! ```

use async_trait::async_trait;
use inkseal_core::encoding;
use inkseal_core::store::{MetadataStore, ProfileDirectory};
use inkseal_core::{EncryptedFileMetadata, StoreError, StoreResult, WrappedPrivateKey};
use opendal::{ErrorKind, Operator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::object::map_err;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileRecord {
    /// base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wrapped_private_key: Option<WrappedPrivateKey>,
}

/// Reject ids that could escape their record directory.
fn record_path(dir: &str, id: &str) -> StoreResult<String> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.starts_with('.') {
        return Err(StoreError::Backend(format!("invalid record id: {id:?}")));
    }
    Ok(format!("{dir}/{id}.json"))
}

async fn read_json<T: DeserializeOwned>(op: &Operator, path: &str) -> StoreResult<Option<T>> {
    match op.read(path).await {
        Ok(buf) => Ok(Some(serde_json::from_slice(&buf.to_vec())?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(map_err(e)),
    }
}

async fn write_json<T: Serialize>(op: &Operator, path: &str, value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    op.write(path, json).await.map_err(map_err)?;
    Ok(())
}

pub struct JsonProfileDirectory {
    op: Operator,
    /// Serializes read-modify-write of profile records.
    write_lock: Mutex<()>,
}

impl JsonProfileDirectory {
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self, user_id: &str) -> StoreResult<ProfileRecord> {
        let path = record_path("profiles", user_id)?;
        Ok(read_json(&self.op, &path).await?.unwrap_or_default())
    }

    async fn update(
        &self,
        user_id: &str,
        apply: impl FnOnce(&mut ProfileRecord),
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(user_id).await?;
        apply(&mut record);
        let path = record_path("profiles", user_id)?;
        write_json(&self.op, &path, &record).await?;
        debug!(user_id, "profile record updated");
        Ok(())
    }
}

#[async_trait]
impl ProfileDirectory for JsonProfileDirectory {
    async fn get_public_key(&self, user_id: &str) -> StoreResult<Option<[u8; 32]>> {
        let Some(encoded) = self.load(user_id).await?.public_key else {
            return Ok(None);
        };
        let raw = encoding::decode(&encoded)
            .map_err(|e| StoreError::Backend(format!("public key of {user_id}: {e}")))?;
        let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            StoreError::Backend(format!(
                "public key of {user_id} is {} bytes, expected 32",
                raw.len()
            ))
        })?;
        Ok(Some(key))
    }

    async fn set_public_key(&self, user_id: &str, key: [u8; 32]) -> StoreResult<()> {
        let encoded = encoding::encode(&key);
        self.update(user_id, |r| r.public_key = Some(encoded)).await
    }

    async fn get_wrapped_private_key(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<WrappedPrivateKey>> {
        Ok(self.load(user_id).await?.wrapped_private_key)
    }

    async fn set_wrapped_private_key(
        &self,
        user_id: &str,
        wrapped: &WrappedPrivateKey,
    ) -> StoreResult<()> {
        let wrapped = wrapped.clone();
        self.update(user_id, |r| r.wrapped_private_key = Some(wrapped))
            .await
    }
}

pub struct JsonMetadataStore {
    op: Operator,
}

impl JsonMetadataStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn put(&self, metadata: &EncryptedFileMetadata) -> StoreResult<()> {
        let path = record_path("metadata", &metadata.file_id)?;
        write_json(&self.op, &path, metadata).await
    }

    async fn get(&self, file_id: &str) -> StoreResult<Option<EncryptedFileMetadata>> {
        let path = record_path("metadata", file_id)?;
        read_json(&self.op, &path).await
    }

    async fn delete(&self, file_id: &str) -> StoreResult<()> {
        let path = record_path("metadata", file_id)?;
        self.op.delete(&path).await.map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;
    use inkseal_core::{EncryptedKeyEntry, KdfParams, PayloadVersion};

    fn wrapped() -> WrappedPrivateKey {
        WrappedPrivateKey {
            ciphertext: vec![1; 48],
            salt: vec![2; 16],
            nonce: vec![3; 24],
            kdf: KdfParams::default(),
            version: PayloadVersion::V1,
        }
    }

    #[tokio::test]
    async fn test_profile_fields_are_independent() {
        let dir = JsonProfileDirectory::new(memory_operator().unwrap());
        assert_eq!(dir.get_public_key("alice").await.unwrap(), None);
        assert_eq!(dir.get_wrapped_private_key("alice").await.unwrap(), None);

        dir.set_public_key("alice", [7u8; 32]).await.unwrap();
        dir.set_wrapped_private_key("alice", &wrapped()).await.unwrap();

        assert_eq!(dir.get_public_key("alice").await.unwrap(), Some([7u8; 32]));
        assert_eq!(
            dir.get_wrapped_private_key("alice").await.unwrap(),
            Some(wrapped())
        );
        assert_eq!(dir.get_public_key("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_profile_record_is_base64_json() {
        let op = memory_operator().unwrap();
        let dir = JsonProfileDirectory::new(op.clone());
        dir.set_public_key("alice", [0xFF; 32]).await.unwrap();

        let raw = op.read("profiles/alice.json").await.unwrap().to_vec();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["public_key"], encoding::encode(&[0xFF; 32]));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = JsonProfileDirectory::new(memory_operator().unwrap());
        assert!(dir.get_public_key("../etc").await.is_err());
        assert!(dir.set_public_key("a/b", [0; 32]).await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_crud() {
        let store = JsonMetadataStore::new(memory_operator().unwrap());
        let meta = EncryptedFileMetadata {
            file_id: "f1".into(),
            original_name: "photo.jpg".into(),
            mime_type: "image/jpeg".into(),
            size: 10,
            file_nonce: vec![0; 24],
            encrypted_keys: vec![EncryptedKeyEntry {
                user_id: "alice".into(),
                encrypted_key: vec![1; 48],
                nonce: vec![2; 24],
            }],
            author_id: "alice".into(),
            storage_path: "files/alice/f1.bin".into(),
            encrypted_size: 26,
            chunks: 1,
            chunk_size: 0,
            compressed: false,
            created_at: 1_700_000_000,
            version: PayloadVersion::V1,
        };

        assert!(store.get("f1").await.unwrap().is_none());
        store.put(&meta).await.unwrap();
        assert_eq!(store.get("f1").await.unwrap(), Some(meta));
        store.delete("f1").await.unwrap();
        assert!(store.get("f1").await.unwrap().is_none());
    }
}
