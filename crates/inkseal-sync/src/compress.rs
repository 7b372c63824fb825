//! Opportunistic zstd compression before encryption.
//!
//! Ciphertext does not compress, so this is the only chance. Media that is
//! already compressed is skipped outright; everything else is compressed and
//! kept only when it saves enough to be worth a decompression on read.

use inkseal_core::config::PipelineConfig;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub level: i32,
    pub min_size: u64,
    /// Fraction of the input that must be saved (0.1 = 10%).
    pub min_saving: f64,
}

impl CompressionPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            level: config.compression_level,
            min_size: config.compression_min_size,
            min_saving: config.compression_min_saving,
        }
    }

    /// Whether compression should be attempted at all.
    pub fn applies_to(&self, mime_type: &str, size: u64) -> bool {
        size >= self.min_size && !is_precompressed(mime_type)
    }
}

/// MIME types whose payload is already entropy-coded.
pub fn is_precompressed(mime_type: &str) -> bool {
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime.starts_with("video/") {
        return true;
    }
    if let Some(audio) = mime.strip_prefix("audio/") {
        return !matches!(audio, "wav" | "x-wav" | "wave" | "vnd.wave" | "aiff" | "x-aiff");
    }

    matches!(
        mime.as_str(),
        "image/jpeg"
            | "image/png"
            | "image/gif"
            | "image/webp"
            | "image/heic"
            | "image/heif"
            | "image/avif"
            | "application/zip"
            | "application/gzip"
            | "application/x-gzip"
            | "application/x-bzip2"
            | "application/x-xz"
            | "application/x-7z-compressed"
            | "application/x-rar-compressed"
            | "application/vnd.rar"
            | "application/zstd"
            | "application/pdf"
            | "application/epub+zip"
    )
}

/// Compress `data` if the policy allows and the result is small enough.
///
/// Returns `None` when the original should be stored as-is.
pub fn maybe_compress(
    data: &[u8],
    mime_type: &str,
    policy: &CompressionPolicy,
) -> SyncResult<Option<Vec<u8>>> {
    if !policy.applies_to(mime_type, data.len() as u64) {
        return Ok(None);
    }

    let compressed = zstd::encode_all(data, policy.level)
        .map_err(|e| SyncError::Compression(format!("zstd compress: {e}")))?;

    let limit = data.len() as f64 * (1.0 - policy.min_saving);
    if (compressed.len() as f64) <= limit {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress, refusing to produce more than `expected_size` bytes.
pub fn decompress(data: &[u8], expected_size: u64) -> SyncResult<Vec<u8>> {
    let capacity = usize::try_from(expected_size)
        .map_err(|_| SyncError::Integrity(format!("size {expected_size} exceeds address space")))?;
    zstd::bulk::decompress(data, capacity)
        .map_err(|e| SyncError::Compression(format!("zstd decompress: {e}")))
}
