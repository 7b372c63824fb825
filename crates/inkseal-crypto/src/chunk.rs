//! Per-chunk secret-box framing for large files
//!
//! Encrypted chunk format (binary):
//! ```text
//! [24 bytes: random nonce][16 bytes: Poly1305 tag][N bytes: ciphertext]
//! ```
//!
//! Chunks are concatenated in order to form the blob. Each chunk is sealed
//! independently under the file content-key with no position binding, so
//! reordering or dropping whole chunks is not detected by the tags; the
//! final plaintext size check is the only guard against truncation.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::provider::PrimitiveProvider;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Bytes added to each chunk on top of its plaintext.
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Sealed length of a chunk with `plaintext_len` bytes.
pub fn sealed_chunk_len(plaintext_len: usize) -> usize {
    plaintext_len + CHUNK_OVERHEAD
}

/// Seal one chunk under a fresh nonce.
///
/// Returns `[nonce][tag][ciphertext]`.
pub fn seal_chunk(
    provider: &PrimitiveProvider,
    key: &SymmetricKey,
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let (sealed, nonce) = provider.encrypt(plaintext, key, None)?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + sealed.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&sealed);
    Ok(framed)
}

/// Open one framed chunk produced by [`seal_chunk`].
pub fn open_chunk(
    provider: &PrimitiveProvider,
    key: &SymmetricKey,
    framed: &[u8],
) -> CryptoResult<Vec<u8>> {
    if framed.len() < CHUNK_OVERHEAD {
        return Err(CryptoError::DecryptionFailed(format!(
            "encrypted chunk too short: {} bytes (minimum {})",
            framed.len(),
            CHUNK_OVERHEAD
        )));
    }

    let (nonce, sealed) = framed.split_at(NONCE_SIZE);
    provider.decrypt(sealed, key, nonce)
}

/// Nonce of a framed chunk, without opening it.
pub fn chunk_nonce(framed: &[u8]) -> Option<&[u8]> {
    framed.get(..NONCE_SIZE)
}
