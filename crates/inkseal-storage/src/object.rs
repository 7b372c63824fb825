//! [`ObjectStore`] over an OpenDAL operator.

use async_trait::async_trait;
use inkseal_core::store::ObjectStore;
use inkseal_core::{StoreError, StoreResult};
use opendal::{ErrorKind, Operator};
use tracing::debug;

pub struct OpendalObjectStore {
    op: Operator,
    max_object_bytes: u64,
}

impl OpendalObjectStore {
    pub fn new(op: Operator, max_object_bytes: u64) -> Self {
        Self {
            op,
            max_object_bytes,
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Verify the storage endpoint is reachable by listing the root.
    pub async fn check_health(&self) -> StoreResult<()> {
        self.op.list("/").await.map(|_| ()).map_err(map_err)
    }
}

/// Classify an OpenDAL failure for the retry policy.
pub fn map_err(e: opendal::Error) -> StoreError {
    match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
        ErrorKind::PermissionDenied => StoreError::Unauthorized(e.to_string()),
        ErrorKind::RateLimited => StoreError::Transient(e.to_string()),
        _ if e.is_temporary() => StoreError::Transient(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

#[async_trait]
impl ObjectStore for OpendalObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()> {
        let size = bytes.len() as u64;
        if size > self.max_object_bytes {
            return Err(StoreError::PayloadTooLarge {
                size,
                limit: self.max_object_bytes,
            });
        }

        if self.op.info().full_capability().write_with_content_type {
            self.op
                .write_with(path, bytes)
                .content_type(content_type)
                .await
                .map_err(map_err)?;
        } else {
            self.op.write(path, bytes).await.map_err(map_err)?;
        }
        debug!(path, size, "stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let buf = self.op.read(path).await.map_err(map_err)?;
        Ok(buf.to_vec())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.op.delete(path).await.map_err(map_err)?;
        debug!(path, "deleted object");
        Ok(())
    }
}
