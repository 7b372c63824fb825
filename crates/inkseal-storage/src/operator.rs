//! OpenDAL Operator factory for inkseal storage backends

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inkseal_core::config::{StorageBackend, StorageConfig};
use opendal::Operator;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for an S3-compatible endpoint (AWS, MinIO, SeaweedFS)
///
/// Uses path-style addressing (default in opendal 0.55). Retries are not
/// layered here: the upload path owns its retry policy.
pub fn build_operator(cfg: &S3Settings) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// Operator rooted at a local directory.
pub fn build_fs_operator(root: &Path) -> Result<Operator> {
    let root = expand_home(root);
    let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {}", root.display()))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// Process-local operator; contents vanish with the process.
pub fn memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish();
    Ok(op)
}

/// Build the blob operator described by `[storage]`.
///
/// S3 credentials are passed in by the caller. If `enforce_tls` is true and
/// the endpoint uses HTTP, this returns an error; otherwise a warning is
/// logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    match storage.backend {
        StorageBackend::Memory => memory_operator(),
        StorageBackend::Fs => build_fs_operator(&storage.root),
        StorageBackend::S3 => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted. \
                     Set storage.enforce_tls = true and use HTTPS in production."
                );
            }

            build_operator(&S3Settings {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: storage.bucket.clone(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            })
        }
    }
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
