//! Secret-box backends.
//!
//! Every backend implements the same NaCl secret-box construction, so any
//! backend can open what any other sealed:
//!
//! ```text
//! XSalsa20(key, nonce) keystream:  [32 bytes → Poly1305 key][rest → XOR with plaintext]
//! sealed = Poly1305(ciphertext) (16 bytes) || ciphertext
//! ```
//!
//! - `Platform`: supplied by the host application (hardware or OS bridge)
//! - `Accelerated`: RustCrypto `crypto_secretbox`
//! - `Portable`: reference composition of the `salsa20` and `poly1305` primitives

use poly1305::universal_hash::KeyInit as _;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::{NONCE_SIZE, TAG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Platform,
    Accelerated,
    Portable,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Platform => "platform",
            BackendKind::Accelerated => "accelerated",
            BackendKind::Portable => "portable",
        }
    }
}

/// One implementation of the secret-box construction.
pub trait SecretBoxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Returns `tag || ciphertext`.
    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    /// Fails with [`CryptoError::DecryptionFailed`] on any tag mismatch.
    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8],
    ) -> CryptoResult<Vec<u8>>;
}

/// RustCrypto's audited XSalsa20-Poly1305.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceleratedBackend;

impl SecretBoxBackend for AcceleratedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerated
    }

    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        use crypto_secretbox::aead::{Aead, KeyInit};
        use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

        let cipher = XSalsa20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(format!("secret-box seal: {e}")))
    }

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        use crypto_secretbox::aead::{Aead, KeyInit};
        use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

        if sealed.len() < TAG_SIZE {
            return Err(too_short(sealed.len()));
        }
        let cipher = XSalsa20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| tag_mismatch())
    }
}

/// Reference secret-box built directly from the stream cipher and the MAC.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableBackend;

impl PortableBackend {
    fn keystream(key: &SymmetricKey, nonce: &[u8; NONCE_SIZE]) -> (XSalsa20, Poly1305) {
        let mut cipher = XSalsa20::new(
            salsa20::Key::from_slice(key.as_bytes()),
            salsa20::XNonce::from_slice(nonce),
        );
        let mut mac_key = poly1305::Key::default();
        cipher.apply_keystream(&mut mac_key);
        let mac = Poly1305::new(&mac_key);
        mac_key.as_mut_slice().zeroize();
        (cipher, mac)
    }
}

impl SecretBoxBackend for PortableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let (mut cipher, mac) = Self::keystream(key, nonce);

        let mut sealed = vec![0u8; TAG_SIZE + plaintext.len()];
        sealed[TAG_SIZE..].copy_from_slice(plaintext);
        cipher.apply_keystream(&mut sealed[TAG_SIZE..]);

        let tag = mac.compute_unpadded(&sealed[TAG_SIZE..]);
        sealed[..TAG_SIZE].copy_from_slice(tag.as_slice());
        Ok(sealed)
    }

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if sealed.len() < TAG_SIZE {
            return Err(too_short(sealed.len()));
        }
        let (tag, ciphertext) = sealed.split_at(TAG_SIZE);
        let (mut cipher, mac) = Self::keystream(key, nonce);

        let expected = mac.compute_unpadded(ciphertext);
        if expected.as_slice().ct_eq(tag).unwrap_u8() != 1 {
            return Err(tag_mismatch());
        }

        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

/// Start-up check a backend must pass before it is selected: it must agree
/// byte-for-byte with the reference construction, open its own output, and
/// reject a flipped bit.
pub fn self_test(backend: &dyn SecretBoxBackend) -> CryptoResult<()> {
    let key = SymmetricKey::from_bytes([0x42; 32]);
    let nonce = [0x24; NONCE_SIZE];
    let message = b"inkseal secret-box self-test";

    let sealed = backend.seal(&key, &nonce, message)?;
    let reference = PortableBackend.seal(&key, &nonce, message)?;
    if sealed != reference {
        return Err(CryptoError::BackendUnavailable(format!(
            "{} backend disagrees with the reference construction",
            backend.kind().name()
        )));
    }

    let opened = backend.open(&key, &nonce, &sealed)?;
    if opened != message {
        return Err(CryptoError::BackendUnavailable(format!(
            "{} backend failed to round-trip",
            backend.kind().name()
        )));
    }

    let mut tampered = sealed;
    tampered[TAG_SIZE] ^= 0x01;
    if backend.open(&key, &nonce, &tampered).is_ok() {
        return Err(CryptoError::BackendUnavailable(format!(
            "{} backend accepted a tampered ciphertext",
            backend.kind().name()
        )));
    }

    Ok(())
}

fn too_short(len: usize) -> CryptoError {
    CryptoError::DecryptionFailed(format!(
        "ciphertext too short: {len} bytes (minimum {TAG_SIZE})"
    ))
}

fn tag_mismatch() -> CryptoError {
    CryptoError::DecryptionFailed(
        "authentication tag mismatch: wrong key or corrupted data".into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<Box<dyn SecretBoxBackend>> {
        vec![Box::new(AcceleratedBackend), Box::new(PortableBackend)]
    }

    #[test]
    fn test_builtin_backends_pass_self_test() {
        for backend in backends() {
            self_test(backend.as_ref()).unwrap();
        }
    }

    #[test]
    fn test_cross_backend_interop() {
        let key = SymmetricKey::from_bytes([9u8; 32]);
        let nonce = [3u8; NONCE_SIZE];
        let plaintext = vec![0x5Au8; 1000];

        for sealer in backends() {
            let sealed = sealer.seal(&key, &nonce, &plaintext).unwrap();
            assert_eq!(sealed.len(), TAG_SIZE + plaintext.len());
            for opener in backends() {
                let opened = opener.open(&key, &nonce, &sealed).unwrap();
                assert_eq!(
                    opened,
                    plaintext,
                    "{} -> {}",
                    sealer.kind().name(),
                    opener.kind().name()
                );
            }
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let key = SymmetricKey::from_bytes([1u8; 32]);
        let nonce = [0u8; NONCE_SIZE];
        for backend in backends() {
            let sealed = backend.seal(&key, &nonce, b"").unwrap();
            assert_eq!(sealed.len(), TAG_SIZE);
            assert_eq!(backend.open(&key, &nonce, &sealed).unwrap(), b"");
        }
    }

    #[test]
    fn test_wrong_key_and_truncation_fail() {
        let key = SymmetricKey::from_bytes([1u8; 32]);
        let other = SymmetricKey::from_bytes([2u8; 32]);
        let nonce = [0u8; NONCE_SIZE];
        for backend in backends() {
            let sealed = backend.seal(&key, &nonce, b"secret data").unwrap();
            assert!(matches!(
                backend.open(&other, &nonce, &sealed),
                Err(CryptoError::DecryptionFailed(_))
            ));
            assert!(matches!(
                backend.open(&key, &nonce, &sealed[..TAG_SIZE - 1]),
                Err(CryptoError::DecryptionFailed(_))
            ));
        }
    }

    struct Broken;

    impl SecretBoxBackend for Broken {
        fn kind(&self) -> BackendKind {
            BackendKind::Platform
        }

        fn seal(&self, _: &SymmetricKey, _: &[u8; NONCE_SIZE], p: &[u8]) -> CryptoResult<Vec<u8>> {
            let mut out = vec![0u8; TAG_SIZE];
            out.extend_from_slice(p);
            Ok(out)
        }

        fn open(&self, _: &SymmetricKey, _: &[u8; NONCE_SIZE], s: &[u8]) -> CryptoResult<Vec<u8>> {
            Ok(s[TAG_SIZE..].to_vec())
        }
    }

    #[test]
    fn test_self_test_rejects_incompatible_backend() {
        let err = self_test(&Broken).unwrap_err();
        assert!(matches!(err, CryptoError::BackendUnavailable(_)));
    }
}
