use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};
use crate::types::{KdfAlgorithm, KdfParams};

/// Top-level engine configuration (loaded from inkseal.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InksealConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub profile: ProfileConfig,
    pub secrets: SecretsConfig,
    pub crypto: CryptoConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
}

impl InksealConfig {
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot honour.
    pub fn validate(&self) -> CoreResult<()> {
        if self.pipeline.chunk_size == 0 {
            return Err(CoreError::Config("pipeline.chunk_size must be > 0".into()));
        }
        if self.pipeline.chunk_size as u64 > self.pipeline.chunk_threshold {
            return Err(CoreError::Config(
                "pipeline.chunk_size must not exceed pipeline.chunk_threshold".into(),
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(CoreError::Config("cache.ttl_secs must be >= 1".into()));
        }
        if self.pipeline.upload_max_attempts == 0 {
            return Err(CoreError::Config(
                "pipeline.upload_max_attempts must be >= 1".into(),
            ));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(CoreError::Config(
                "scheduler.max_concurrent must be >= 1".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(CoreError::Config("cache.max_entries must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.pipeline.compression_min_saving) {
            return Err(CoreError::Config(
                "pipeline.compression_min_saving must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Which object-storage service backs encrypted blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the `fs` backend
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (error on HTTP endpoints)
    pub enforce_tls: bool,
    /// Objects larger than this are rejected before upload (terminal failure)
    pub max_object_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("~/.local/share/inkseal/objects"),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "inkseal".into(),
            enforce_tls: false,
            max_object_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Directory holding JSON profile and file-metadata records
    pub data_dir: PathBuf,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.local/share/inkseal/records"),
        }
    }
}

/// Where device-local secrets live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    #[default]
    Keychain,
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub key_store: KeyStoreKind,
    /// Directory for the `file` key store
    pub key_dir: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_store: KeyStoreKind::Keychain,
            key_dir: PathBuf::from("~/.local/share/inkseal/keys"),
        }
    }
}

/// Secret-box backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Best available: platform, then accelerated, then portable
    #[default]
    Auto,
    Platform,
    Accelerated,
    Portable,
}

/// E2E encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub backend: BackendPreference,
    /// Preferred password KDF
    pub kdf: KdfAlgorithm,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id parallelism (default: 1)
    pub argon2_parallelism: u32,
    /// Iterations used for new password keys (Argon2id time cost)
    pub kdf_iterations: u32,
}

impl CryptoConfig {
    /// KDF parameters for newly wrapped material.
    pub fn kdf_params(&self, iterations: u32) -> KdfParams {
        KdfParams {
            algorithm: self.kdf,
            iterations,
            memory_kib: self.argon2_mem_cost_kib,
            parallelism: self.argon2_parallelism,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            kdf: KdfAlgorithm::Argon2id,
            argon2_mem_cost_kib: 65536,
            argon2_parallelism: 1,
            kdf_iterations: 3,
        }
    }
}

/// Password-derived key cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl_secs: u64,
    /// Persist derived keys (encrypted) to the secure key store
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 32,
            max_bytes: 64 * 1024,
            ttl_secs: 30 * 60,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Inputs strictly larger than this are chunked
    pub chunk_threshold: u64,
    /// Plaintext bytes per chunk
    pub chunk_size: usize,
    /// zstd level for opportunistic compression
    pub compression_level: i32,
    /// Never compress inputs smaller than this
    pub compression_min_size: u64,
    /// Keep the compressed variant only if it is at least this much smaller (0.1 = 10%)
    pub compression_min_saving: f64,
    /// Upload attempts including the first
    pub upload_max_attempts: u32,
    /// First retry delay; doubles every attempt
    pub upload_base_backoff_ms: u64,
    /// Byte budget of the in-memory downloaded-blob cache
    pub content_cache_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 5 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            compression_level: 3,
            compression_min_size: 100 * 1024,
            compression_min_saving: 0.1,
            upload_max_attempts: 3,
            upload_base_backoff_ms: 500,
            content_cache_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pipelines allowed to run at once
    pub max_concurrent: usize,
    /// Minimum spacing between progress events for one task
    pub progress_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            progress_interval_ms: 250,
        }
    }
}
