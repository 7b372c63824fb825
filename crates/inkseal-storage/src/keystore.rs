//! Device-local [`SecureKeyStore`] implementations.
//!
//! - [`KeychainStore`]: platform keychain through the `keyring` crate
//!   (macOS Keychain, Secret Service, Windows Credential Manager)
//! - [`FileKeyStore`]: one 0600 file per secret, for headless hosts
//! - [`MemoryKeyStore`]: process-local, for tests and ephemeral sessions

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use inkseal_core::encoding;
use inkseal_core::store::SecureKeyStore;
use inkseal_core::{StoreError, StoreResult};
use tracing::debug;

/// Keychain service name under which every inkseal secret is filed.
pub const SERVICE_NAME: &str = "inkseal";

/// Platform keychain. Secrets are stored base64-encoded since the keychain
/// API deals in strings.
#[derive(Debug, Clone)]
pub struct KeychainStore {
    service: String,
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "__inkseal_probe__").is_ok()
    }

    async fn blocking<T, F>(&self, name: &str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let entry = keyring::Entry::new(&self.service, name)
            .map_err(|e| StoreError::Backend(format!("keychain entry creation: {e}")))?;
        let name = name.to_string();
        tokio::task::spawn_blocking(move || f(entry))
            .await
            .map_err(|e| StoreError::Backend(format!("keychain task: {e}")))?
            .map_err(|e| StoreError::Backend(format!("keychain access for '{name}': {e}")))
    }
}

#[async_trait]
impl SecureKeyStore for KeychainStore {
    async fn set(&self, name: &str, bytes: &[u8]) -> StoreResult<()> {
        let encoded = encoding::encode(bytes);
        self.blocking(name, move |entry| entry.set_password(&encoded))
            .await?;
        debug!(key = name, "stored secret in platform keychain");
        Ok(())
    }

    async fn get(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let stored = self
            .blocking(name, |entry| match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e),
            })
            .await?;
        stored
            .map(|s| {
                encoding::decode(&s)
                    .map_err(|e| StoreError::Backend(format!("keychain value for '{name}': {e}")))
            })
            .transpose()
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.blocking(name, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await?;
        debug!(key = name, "deleted secret from platform keychain");
        Ok(())
    }
}

/// One file per secret inside `dir`, readable only by the owner.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(file_name(name))
    }
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so distinct names map
/// to distinct files and nothing escapes the directory.
fn file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && !out.is_empty()) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Backend(format!("key file: {e}"))
}

#[async_trait]
impl SecureKeyStore for FileKeyStore {
    async fn set(&self, name: &str, bytes: &[u8]) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{}.tmp", file_name(name)));
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(io_err)?;
        }

        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        debug!(key = name, path = %path.display(), "stored secret in key file");
        Ok(())
    }

    async fn get(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Process-local secret storage.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Names currently stored, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SecureKeyStore for MemoryKeyStore {
    async fn set(&self, name: &str, bytes: &[u8]) -> StoreResult<()> {
        self.entries().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries().get(name).cloned())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.entries().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_encoding() {
        assert_eq!(file_name("identity-alice"), "identity-alice");
        assert_eq!(file_name("password-cache/index"), "password-cache%2Findex");
        assert_eq!(file_name("../x"), "%2E.%2Fx");
        assert_ne!(file_name("a/b"), file_name("a_b"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys"));

        assert_eq!(store.get("identity/alice").await.unwrap(), None);
        store.set("identity/alice", &[1, 2, 3]).await.unwrap();
        assert_eq!(
            store.get("identity/alice").await.unwrap(),
            Some(vec![1, 2, 3])
        );

        store.delete("identity/alice").await.unwrap();
        store.delete("identity/alice").await.unwrap();
        assert_eq!(store.get("identity/alice").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.set("secret", b"x").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKeyStore::new();
        store.set("b", b"2").await.unwrap();
        store.set("a", b"1").await.unwrap();
        assert_eq!(store.names(), vec!["a", "b"]);
        store.delete("a").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }
}
