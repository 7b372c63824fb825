//! Fixed-size chunk layout of large encrypted blobs.
//!
//! A chunked blob is the concatenation of independently sealed chunks
//! (see [`inkseal_crypto::chunk`]). Every chunk but the last carries exactly
//! `chunk_size` plaintext bytes, so chunk boundaries are recoverable from
//! the metadata alone.

use std::ops::Range;

use inkseal_crypto::{sealed_chunk_len, CHUNK_OVERHEAD};

use crate::error::{SyncError, SyncResult};

/// Payloads strictly larger than the threshold are chunked.
pub fn should_chunk(payload_len: u64, threshold: u64) -> bool {
    payload_len > threshold
}

/// Plaintext ranges of each chunk, in order.
pub fn plaintext_ranges(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    if chunk_size == 0 || len == 0 {
        return vec![0..len];
    }
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

/// Split a chunked blob back into its sealed chunks.
pub fn split_sealed(blob: &[u8], chunk_size: usize, chunks: u32) -> SyncResult<Vec<&[u8]>> {
    if chunks == 0 {
        return Err(SyncError::Integrity("chunk count is zero".into()));
    }
    let full = sealed_chunk_len(chunk_size);
    let leading = full
        .checked_mul(chunks as usize - 1)
        .ok_or_else(|| SyncError::Integrity("chunk layout overflows".into()))?;

    if blob.len() < leading + CHUNK_OVERHEAD {
        return Err(SyncError::Integrity(format!(
            "blob is {} bytes, too short for {chunks} chunks of {chunk_size}",
            blob.len()
        )));
    }
    let last_len = blob.len() - leading;
    if last_len > full {
        return Err(SyncError::Integrity(format!(
            "blob is {} bytes, too long for {chunks} chunks of {chunk_size}",
            blob.len()
        )));
    }

    let mut out: Vec<&[u8]> = blob[..leading].chunks(full).collect();
    out.push(&blob[leading..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_exclusive() {
        assert!(!should_chunk(5, 5));
        assert!(should_chunk(6, 5));
    }

    #[test]
    fn test_plaintext_ranges() {
        assert_eq!(plaintext_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(plaintext_ranges(8, 4), vec![0..4, 4..8]);
        assert_eq!(plaintext_ranges(0, 4), vec![0..0]);
    }

    #[test]
    fn test_split_sealed() {
        let full = sealed_chunk_len(4);
        let last = sealed_chunk_len(2);
        let blob = vec![0u8; full * 2 + last];
        let parts = split_sealed(&blob, 4, 3).unwrap();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![full, full, last]
        );
    }

    #[test]
    fn test_split_rejects_truncation_and_padding() {
        let full = sealed_chunk_len(4);
        assert!(split_sealed(&vec![0u8; full * 2], 4, 3).is_err());
        assert!(split_sealed(&vec![0u8; full * 3 + 1], 4, 3).is_err());
        assert!(split_sealed(&[], 4, 0).is_err());
    }

    proptest::proptest! {
        #[test]
        fn ranges_tile_the_payload(len in 0usize..10_000, chunk_size in 1usize..2_000) {
            let ranges = plaintext_ranges(len, chunk_size);
            proptest::prop_assert_eq!(ranges.first().map(|r| r.start), Some(0));
            proptest::prop_assert_eq!(ranges.last().map(|r| r.end), Some(len));
            for pair in ranges.windows(2) {
                proptest::prop_assert_eq!(pair[0].end, pair[1].start);
                proptest::prop_assert_eq!(pair[0].len(), chunk_size);
            }
        }

        #[test]
        fn split_recovers_every_sealed_length(len in 1usize..10_000, chunk_size in 1usize..2_000) {
            let ranges = plaintext_ranges(len, chunk_size);
            let total: usize = ranges.iter().map(|r| sealed_chunk_len(r.len())).sum();
            let blob = vec![0u8; total];
            let parts = split_sealed(&blob, chunk_size, ranges.len() as u32).unwrap();
            proptest::prop_assert_eq!(parts.len(), ranges.len());
            for (part, range) in parts.iter().zip(&ranges) {
                proptest::prop_assert_eq!(part.len(), sealed_chunk_len(range.len()));
            }
        }
    }
}
