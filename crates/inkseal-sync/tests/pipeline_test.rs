//! End-to-end tests of the file encryption pipeline against an in-memory
//! backend shared by several users.

mod common;

use std::sync::Arc;

use common::{fast_config, noise, password, BrokenMetadataStore, FlakyObjectStore, World};
use inkseal_core::config::PipelineConfig;
use inkseal_core::store::ObjectStore;
use inkseal_core::StoreError;
use inkseal_crypto::{sealed_chunk_len, CryptoError, CHUNK_OVERHEAD};
use inkseal_sync::progress::progress_channel;
use inkseal_sync::{EncryptRequest, FileEncryptionPipeline, FileSource, SyncError};
use tokio_util::sync::CancellationToken;

const MIB: f64 = 1024.0 * 1024.0;

fn request(author: &str, recipients: &[&str], data: Vec<u8>, mime: &str) -> EncryptRequest {
    EncryptRequest {
        source: FileSource::Bytes(data),
        file_name: "entry.bin".into(),
        mime_type: mime.into(),
        author_id: author.into(),
        recipient_ids: recipients.iter().map(|r| r.to_string()).collect(),
    }
}

async fn upload(
    pipeline: &FileEncryptionPipeline,
    req: EncryptRequest,
) -> inkseal_core::EncryptedFileMetadata {
    pipeline
        .encrypt_and_upload(req, &CancellationToken::new(), None)
        .await
        .unwrap()
}

#[tokio::test]
async fn compressible_text_roundtrip() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);

    let text = "Dear diary, the weather was lovely today. ".repeat(5_000).into_bytes();
    let meta = upload(&alice, request("alice", &[], text.clone(), "text/plain")).await;

    assert!(meta.compressed);
    assert_eq!(meta.chunks, 1);
    assert_eq!(meta.size, text.len() as u64);
    assert!(meta.encrypted_size < meta.size);
    assert_eq!(meta.encrypted_keys.len(), 1);
    assert_eq!(meta.storage_path, format!("files/alice/{}.bin", meta.file_id));

    let plain = alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap();
    assert_eq!(plain, text);
}

#[tokio::test]
async fn chunking_threshold_is_transparent() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let threshold = PipelineConfig::default().chunk_threshold;

    let below = noise((4.9 * MIB) as usize);
    let above = noise((5.1 * MIB) as usize);
    assert!((below.len() as u64) < threshold && (above.len() as u64) > threshold);

    let small = upload(&alice, request("alice", &[], below.clone(), "application/octet-stream")).await;
    let large = upload(&alice, request("alice", &[], above.clone(), "application/octet-stream")).await;

    assert!(!small.compressed && !large.compressed);
    assert_eq!(small.chunks, 1);
    assert_eq!(large.chunks, 6);
    assert_eq!(
        large.encrypted_size,
        above.len() as u64 + 6 * CHUNK_OVERHEAD as u64
    );

    assert_eq!(alice.download_and_decrypt(&small.file_id, "alice").await.unwrap(), below);
    assert_eq!(alice.download_and_decrypt(&large.file_id, "alice").await.unwrap(), above);
}

/// A payload over the threshold but within one chunk still uses the framed
/// layout, and must open as such.
#[tokio::test]
async fn single_chunk_blob_roundtrip() {
    let world = World::new();
    let config = PipelineConfig {
        chunk_threshold: 1000,
        chunk_size: 4096,
        ..fast_config()
    };
    let alice = world.pipeline_with(world.sign_up("alice").await, config);
    let data = noise(2000);

    let meta = upload(&alice, request("alice", &[], data.clone(), "application/octet-stream")).await;
    assert_eq!(meta.chunks, 1);
    assert_eq!(meta.chunk_size, 4096);
    assert!(meta.is_chunked());
    assert_eq!(meta.encrypted_size, sealed_chunk_len(2000) as u64);

    let blob = world.objects.get(&meta.storage_path).await.unwrap();
    assert_eq!(&blob[..meta.file_nonce.len()], meta.file_nonce.as_slice());
    assert_eq!(alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap(), data);
}

#[tokio::test]
async fn recipients_can_read_outsiders_cannot() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let bob = world.pipeline(world.sign_up("bob").await);
    let carol = world.pipeline(world.sign_up("carol").await);
    let dave = world.pipeline(world.sign_up("dave").await);

    let data = b"shared journal entry".to_vec();
    let meta = upload(&alice, request("alice", &["bob", "carol", "bob"], data.clone(), "text/plain")).await;

    let readers: Vec<_> = meta.encrypted_keys.iter().map(|e| e.user_id.as_str()).collect();
    assert_eq!(readers, ["alice", "bob", "carol"]);

    assert_eq!(bob.download_and_decrypt(&meta.file_id, "bob").await.unwrap(), data);
    assert_eq!(carol.download_and_decrypt(&meta.file_id, "carol").await.unwrap(), data);

    let err = dave.download_and_decrypt(&meta.file_id, "dave").await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied { ref user_id, .. } if user_id == "dave"));
}

#[tokio::test]
async fn unknown_recipient_uploads_nothing() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);

    let err = alice
        .encrypt_and_upload(
            request("alice", &["nobody"], b"x".to_vec(), "text/plain"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownUser(ref id) if id == "nobody"));
    assert_eq!(world.blob_count().await, 0);
}

#[tokio::test]
async fn author_must_be_signed_in() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);

    let err = alice
        .encrypt_and_upload(
            request("bob", &[], b"x".to_vec(), "text/plain"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Crypto(CryptoError::NotInitialized)));
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let err = alice.download_and_decrypt("does-not-exist", "alice").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn metadata_failure_removes_blob() {
    let world = World::new();
    let identity = world.sign_up("alice").await;
    let alice = FileEncryptionPipeline::new(
        identity,
        Arc::clone(&world.objects),
        Arc::new(BrokenMetadataStore),
        fast_config(),
    );

    let err = alice
        .encrypt_and_upload(
            request("alice", &[], b"orphan?".to_vec(), "text/plain"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StoreError::Backend(_))));
    assert_eq!(world.blob_count().await, 0);
}

#[tokio::test]
async fn transient_upload_failures_are_retried() {
    let world = World::new();
    let identity = world.sign_up("alice").await;
    let flaky = Arc::new(FlakyObjectStore::new(Arc::clone(&world.objects), 2, || {
        StoreError::Transient("connection reset".into())
    }));
    let alice = FileEncryptionPipeline::new(
        identity,
        flaky.clone(),
        Arc::clone(&world.metadata),
        fast_config(),
    );

    let meta = upload(&alice, request("alice", &[], b"eventually".to_vec(), "text/plain")).await;
    assert_eq!(flaky.puts(), 3);
    assert_eq!(
        alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap(),
        b"eventually"
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let world = World::new();
    let identity = world.sign_up("alice").await;
    let flaky = Arc::new(FlakyObjectStore::new(Arc::clone(&world.objects), 10, || {
        StoreError::Transient("timeout".into())
    }));
    let alice = FileEncryptionPipeline::new(
        identity,
        flaky.clone(),
        Arc::clone(&world.metadata),
        fast_config(),
    );

    let err = alice
        .encrypt_and_upload(
            request("alice", &[], b"never".to_vec(), "text/plain"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UploadFailed { attempts: 3, .. }));
    assert_eq!(flaky.puts(), 3);
}

#[tokio::test]
async fn terminal_upload_failures_are_not_retried() {
    let world = World::new();
    let identity = world.sign_up("alice").await;
    let flaky = Arc::new(FlakyObjectStore::new(Arc::clone(&world.objects), 10, || {
        StoreError::Unauthorized("token expired".into())
    }));
    let alice = FileEncryptionPipeline::new(
        identity,
        flaky.clone(),
        Arc::clone(&world.metadata),
        fast_config(),
    );

    let err = alice
        .encrypt_and_upload(
            request("alice", &[], b"denied".to_vec(), "text/plain"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::UploadFailed {
            attempts: 1,
            source: StoreError::Unauthorized(_)
        }
    ));
    assert_eq!(flaky.puts(), 1);
}

#[tokio::test]
async fn cancelled_before_start_uploads_nothing() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = alice
        .encrypt_and_upload(request("alice", &[], noise(4096), "text/plain"), &cancel, None)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(world.blob_count().await, 0);
}

#[tokio::test]
async fn progress_is_monotonic_and_finishes() {
    let world = World::new();
    let config = PipelineConfig {
        chunk_threshold: 1024,
        chunk_size: 1024,
        ..fast_config()
    };
    let alice = world.pipeline_with(world.sign_up("alice").await, config);
    let (tx, mut rx) = progress_channel();

    alice
        .encrypt_and_upload(
            request("alice", &[], noise(10 * 1024), "application/octet-stream"),
            &CancellationToken::new(),
            Some(&tx),
        )
        .await
        .unwrap();
    drop(tx);

    let mut seen = Vec::new();
    while let Some(update) = rx.recv().await {
        seen.push(update.percent);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.len() > 10, "one update per chunk expected: {seen:?}");
}

#[tokio::test]
async fn file_source_path() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("photo.jpg");
    std::fs::write(&path, noise(2048)).unwrap();

    let meta = upload(
        &alice,
        EncryptRequest {
            source: FileSource::Path(path),
            file_name: "photo.jpg".into(),
            mime_type: "image/jpeg".into(),
            author_id: "alice".into(),
            recipient_ids: vec![],
        },
    )
    .await;
    assert_eq!(meta.original_name, "photo.jpg");
    assert_eq!(
        alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap(),
        noise(2048)
    );
}

#[tokio::test]
async fn grant_access_adds_reader() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let bob = world.pipeline(world.sign_up("bob").await);

    let meta = upload(&alice, request("alice", &[], b"later shared".to_vec(), "text/plain")).await;
    assert!(matches!(
        bob.download_and_decrypt(&meta.file_id, "bob").await,
        Err(SyncError::AccessDenied { .. })
    ));

    let updated = alice.grant_access(&meta.file_id, "bob").await.unwrap();
    assert_eq!(updated.encrypted_keys.len(), 2);
    assert_eq!(updated.storage_path, meta.storage_path);
    assert_eq!(
        bob.download_and_decrypt(&meta.file_id, "bob").await.unwrap(),
        b"later shared"
    );

    let again = alice.grant_access(&meta.file_id, "bob").await.unwrap();
    assert_eq!(again.encrypted_keys.len(), 2);

    let err = bob.grant_access(&meta.file_id, "bob").await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied { .. }));
}

#[tokio::test]
async fn only_author_deletes() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let bob = world.pipeline(world.sign_up("bob").await);

    let meta = upload(&alice, request("alice", &["bob"], b"temporary".to_vec(), "text/plain")).await;
    assert_eq!(world.blob_count().await, 1);

    let err = bob.delete_file(&meta.file_id, "bob").await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied { .. }));

    alice.delete_file(&meta.file_id, "alice").await.unwrap();
    assert_eq!(world.blob_count().await, 0);
    assert!(matches!(
        bob.download_and_decrypt(&meta.file_id, "bob").await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn tampered_blob_fails_integrity_and_is_evicted() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let meta = upload(&alice, request("alice", &[], b"do not touch".to_vec(), "text/plain")).await;

    let mut blob = world.objects.get(&meta.storage_path).await.unwrap();
    blob[20] ^= 0x01;
    world
        .objects
        .put(&meta.storage_path, blob, "application/octet-stream")
        .await
        .unwrap();

    let err = alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap_err();
    assert!(err.is_integrity_error(), "{err}");
    assert!(alice.content_cache().is_empty());
}

#[tokio::test]
async fn downloads_are_cached() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let meta = upload(&alice, request("alice", &[], b"cache me".to_vec(), "text/plain")).await;

    alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap();
    assert_eq!(alice.content_cache().len(), 1);

    // Served from cache even once the backend copy is gone.
    world.objects.delete(&meta.storage_path).await.unwrap();
    assert_eq!(
        alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap(),
        b"cache me"
    );
}

/// Chunks are sealed independently with no position binding, so swapping
/// two whole chunks is not detected and yields reordered plaintext.
#[tokio::test]
async fn swapped_chunks_go_undetected() {
    let world = World::new();
    let config = PipelineConfig {
        chunk_threshold: 512,
        chunk_size: 256,
        ..fast_config()
    };
    let alice = world.pipeline_with(world.sign_up("alice").await, config);
    let data = noise(1024);
    let meta = upload(&alice, request("alice", &[], data.clone(), "application/octet-stream")).await;
    assert_eq!(meta.chunks, 4);

    let full = sealed_chunk_len(256);
    let blob = world.objects.get(&meta.storage_path).await.unwrap();
    let mut swapped = Vec::with_capacity(blob.len());
    swapped.extend_from_slice(&blob[full..2 * full]);
    swapped.extend_from_slice(&blob[..full]);
    swapped.extend_from_slice(&blob[2 * full..]);
    world
        .objects
        .put(&meta.storage_path, swapped, "application/octet-stream")
        .await
        .unwrap();

    let mut expected = data[256..512].to_vec();
    expected.extend_from_slice(&data[..256]);
    expected.extend_from_slice(&data[512..]);
    assert_eq!(
        alice.download_and_decrypt(&meta.file_id, "alice").await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn recovered_device_reads_old_files() {
    let world = World::new();
    let alice = world.pipeline(world.sign_up("alice").await);
    let meta = upload(&alice, request("alice", &[], b"from the old phone".to_vec(), "text/plain")).await;

    let new_phone = world.device();
    new_phone
        .recover_from_backup("alice", &password("alice"))
        .await
        .unwrap()
        .expect("backup exists");
    let alice_again = world.pipeline(new_phone);
    assert_eq!(
        alice_again.download_and_decrypt(&meta.file_id, "alice").await.unwrap(),
        b"from the old phone"
    );
}
