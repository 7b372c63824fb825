use serde::{Deserialize, Serialize};

use crate::encoding::{self, base64_bytes};
use crate::error::{CoreError, CoreResult};

/// Identity supplied by the session provider. The engine never authenticates.
pub type UserId = String;

/// Opaque identifier of an uploaded, encrypted file.
pub type FileId = String;

/// Identifier of a background encryption task.
pub type TaskId = u64;

/// Pins the construction behind an [`EncryptedPayload`].
///
/// `V1`: XSalsa20-Poly1305 secret-box (symmetric) or X25519 + XSalsa20-Poly1305
/// box (peer), 24-byte nonce, tag prepended to the ciphertext.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadVersion {
    #[default]
    #[serde(rename = "v1")]
    V1,
}

impl PayloadVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadVersion::V1 => "v1",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "v1" => Some(PayloadVersion::V1),
            _ => None,
        }
    }
}

/// The universal unit for encrypted text fields and wrapped keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(default)]
    pub version: PayloadVersion,
}

impl EncryptedPayload {
    pub fn new(ciphertext: Vec<u8>, nonce: Vec<u8>) -> Self {
        Self {
            ciphertext,
            nonce,
            version: PayloadVersion::V1,
        }
    }

    /// Compact single-string form for storing in a text column:
    /// `v1.<nonce_b64>.<ciphertext_b64>`.
    pub fn to_field_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version.as_str(),
            encoding::encode(&self.nonce),
            encoding::encode(&self.ciphertext)
        )
    }

    pub fn from_field_string(field: &str) -> CoreResult<Self> {
        let mut parts = field.splitn(3, '.');
        let (Some(tag), Some(nonce), Some(ciphertext)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CoreError::Malformed(
                "expected <version>.<nonce>.<ciphertext>".into(),
            ));
        };

        let version = PayloadVersion::parse(tag)
            .ok_or_else(|| CoreError::Malformed(format!("unknown payload version: {tag}")))?;
        let nonce = encoding::decode(nonce)
            .map_err(|e| CoreError::Malformed(format!("nonce base64: {e}")))?;
        let ciphertext = encoding::decode(ciphertext)
            .map_err(|e| CoreError::Malformed(format!("ciphertext base64: {e}")))?;

        Ok(Self {
            ciphertext,
            nonce,
            version,
        })
    }
}

/// Password-based key derivation algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// Memory-hard Argon2id (preferred).
    #[default]
    Argon2id,
    /// Iterated SHA-256 over salt and password (fallback).
    Sha256Stretch,
}

/// Everything needed to re-derive a password key bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// Argon2id time cost, or SHA-256 rounds (floored at the stretch minimum).
    pub iterations: u32,
    /// Argon2id memory cost in KiB; ignored by the stretch fallback.
    pub memory_kib: u32,
    /// Argon2id lanes; ignored by the stretch fallback.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: 3,
            memory_kib: 65536,
            parallelism: 1,
        }
    }
}

/// The private key sealed under a password-derived key, as stored on the
/// remote profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedPrivateKey {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default)]
    pub version: PayloadVersion,
}

/// One reader's copy of a file content-key, box-encrypted from the author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyEntry {
    pub user_id: UserId,
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

impl EncryptedKeyEntry {
    pub fn payload(&self) -> EncryptedPayload {
        EncryptedPayload::new(self.encrypted_key.clone(), self.nonce.clone())
    }
}

/// Recoverable description of an uploaded encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFileMetadata {
    pub file_id: FileId,
    pub original_name: String,
    pub mime_type: String,
    /// Plaintext size before compression.
    pub size: u64,
    /// Nonce of the single-pass ciphertext, or of the first chunk when chunked.
    #[serde(with = "base64_bytes")]
    pub file_nonce: Vec<u8>,
    pub encrypted_keys: Vec<EncryptedKeyEntry>,
    pub author_id: UserId,
    pub storage_path: String,
    pub encrypted_size: u64,
    /// Number of independently sealed chunks; 1 for single-pass blobs. A
    /// chunked blob may also hold a single chunk.
    pub chunks: u32,
    /// Plaintext bytes per chunk (the last one may be shorter). 0 marks a
    /// single-pass blob.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub compressed: bool,
    /// Unix seconds.
    pub created_at: u64,
    #[serde(default)]
    pub version: PayloadVersion,
}

impl EncryptedFileMetadata {
    pub fn entry_for(&self, user_id: &str) -> Option<&EncryptedKeyEntry> {
        self.encrypted_keys.iter().find(|e| e.user_id == user_id)
    }

    /// Whether the blob uses the framed chunk layout.
    pub fn is_chunked(&self) -> bool {
        self.chunk_size > 0
    }
}

/// Lifecycle of a background encryption task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed edges: pending → processing | cancelled,
    /// processing → completed | failed | cancelled. Terminal states never move.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
