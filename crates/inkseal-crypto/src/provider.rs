//! PrimitiveProvider: the single entry point for secret-box, randomness and
//! password key derivation. The backend is chosen once, at build time.

use inkseal_core::config::{BackendPreference, CryptoConfig};
use inkseal_core::{EncryptedPayload, KdfAlgorithm, KdfParams};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::backend::{self, AcceleratedBackend, BackendKind, PortableBackend, SecretBoxBackend};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf;
use crate::keys::SymmetricKey;
use crate::{KEY_SIZE, NONCE_SIZE, SALT_SIZE};

pub struct PrimitiveProvider {
    backend: Box<dyn SecretBoxBackend>,
    kdf_algorithm: KdfAlgorithm,
    argon2_memory_kib: u32,
    argon2_parallelism: u32,
}

impl std::fmt::Debug for PrimitiveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveProvider")
            .field("backend", &self.backend.kind())
            .field("kdf", &self.kdf_algorithm)
            .finish()
    }
}

impl PrimitiveProvider {
    pub fn builder() -> ProviderBuilder {
        ProviderBuilder::default()
    }

    /// Provider with automatic backend selection and default Argon2id settings.
    pub fn new() -> CryptoResult<Self> {
        Self::builder().build()
    }

    pub fn from_config(config: &CryptoConfig) -> CryptoResult<Self> {
        ProviderBuilder::from_config(config).build()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Seal `data` under `key`. A fresh random nonce is drawn when none is given.
    ///
    /// Returns `(tag || ciphertext, nonce)`.
    pub fn encrypt(
        &self,
        data: &[u8],
        key: &SymmetricKey,
        nonce: Option<[u8; NONCE_SIZE]>,
    ) -> CryptoResult<(Vec<u8>, [u8; NONCE_SIZE])> {
        let nonce = nonce.unwrap_or_else(|| self.generate_nonce());
        let sealed = self.backend.seal(key, &nonce, data)?;
        Ok((sealed, nonce))
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &SymmetricKey,
        nonce: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let nonce: &[u8; NONCE_SIZE] = nonce.try_into().map_err(|_| {
            CryptoError::DecryptionFailed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce.len()
            ))
        })?;
        self.backend.open(key, nonce, ciphertext)
    }

    pub fn encrypt_payload(
        &self,
        data: &[u8],
        key: &SymmetricKey,
    ) -> CryptoResult<EncryptedPayload> {
        let (ciphertext, nonce) = self.encrypt(data, key, None)?;
        Ok(EncryptedPayload::new(ciphertext, nonce.to_vec()))
    }

    pub fn decrypt_payload(
        &self,
        payload: &EncryptedPayload,
        key: &SymmetricKey,
    ) -> CryptoResult<Vec<u8>> {
        self.decrypt(&payload.ciphertext, key, &payload.nonce)
    }

    pub fn generate_key(&self) -> SymmetricKey {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let key = SymmetricKey::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        key
    }

    pub fn generate_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn generate_salt(&self) -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Parameters this provider records for new password-wrapped material.
    ///
    /// Falls back to the SHA-256 stretch when the configured Argon2id
    /// parameters are unusable.
    pub fn kdf_params(&self, iterations: u32) -> KdfParams {
        let params = KdfParams {
            algorithm: self.kdf_algorithm,
            iterations,
            memory_kib: self.argon2_memory_kib,
            parallelism: self.argon2_parallelism,
        };
        if params.algorithm == KdfAlgorithm::Argon2id && !kdf::argon2_params_valid(&params) {
            warn!(
                iterations,
                memory_kib = params.memory_kib,
                "Argon2id parameters rejected, using SHA-256 stretch"
            );
            return KdfParams {
                algorithm: KdfAlgorithm::Sha256Stretch,
                ..params
            };
        }
        params
    }

    /// `deriveKey(password, salt, iterations)` with this provider's KDF settings.
    pub fn derive_key(
        &self,
        password: &SecretString,
        salt: &[u8],
        iterations: u32,
    ) -> CryptoResult<SymmetricKey> {
        self.derive_key_with(password, salt, &self.kdf_params(iterations))
    }

    /// Re-derive a key from recorded parameters (e.g. a stored backup).
    pub fn derive_key_with(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<SymmetricKey> {
        debug!(algorithm = ?params.algorithm, iterations = params.iterations, "deriving key");
        kdf::derive(password, salt, params)
    }
}

/// Builder for [`PrimitiveProvider`].
pub struct ProviderBuilder {
    platform: Option<Box<dyn SecretBoxBackend>>,
    preference: BackendPreference,
    kdf_algorithm: KdfAlgorithm,
    argon2_memory_kib: u32,
    argon2_parallelism: u32,
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::from_config(&CryptoConfig::default())
    }
}

impl ProviderBuilder {
    pub fn from_config(config: &CryptoConfig) -> Self {
        Self {
            platform: None,
            preference: config.backend,
            kdf_algorithm: config.kdf,
            argon2_memory_kib: config.argon2_mem_cost_kib,
            argon2_parallelism: config.argon2_parallelism,
        }
    }

    /// Register a host-supplied backend (hardware or OS bridge).
    pub fn platform_backend(mut self, backend: Box<dyn SecretBoxBackend>) -> Self {
        self.platform = Some(backend);
        self
    }

    pub fn preference(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn kdf_algorithm(mut self, algorithm: KdfAlgorithm) -> Self {
        self.kdf_algorithm = algorithm;
        self
    }

    pub fn argon2(mut self, memory_kib: u32, parallelism: u32) -> Self {
        self.argon2_memory_kib = memory_kib;
        self.argon2_parallelism = parallelism;
        self
    }

    pub fn build(self) -> CryptoResult<PrimitiveProvider> {
        let mut probe = [0u8; KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| CryptoError::NoSecureRandom(e.to_string()))?;

        let backend = select_backend(self.platform, self.preference)?;

        let kdf_algorithm = match self.kdf_algorithm {
            KdfAlgorithm::Argon2id => match kdf::argon2_self_check() {
                Ok(()) => KdfAlgorithm::Argon2id,
                Err(e) => {
                    warn!(error = %e, "Argon2id unavailable, falling back to SHA-256 stretch");
                    KdfAlgorithm::Sha256Stretch
                }
            },
            other => other,
        };

        info!(
            backend = backend.kind().name(),
            kdf = ?kdf_algorithm,
            "crypto provider ready"
        );

        Ok(PrimitiveProvider {
            backend,
            kdf_algorithm,
            argon2_memory_kib: self.argon2_memory_kib,
            argon2_parallelism: self.argon2_parallelism,
        })
    }
}

fn select_backend(
    platform: Option<Box<dyn SecretBoxBackend>>,
    preference: BackendPreference,
) -> CryptoResult<Box<dyn SecretBoxBackend>> {
    let candidates: Vec<Box<dyn SecretBoxBackend>> = match preference {
        BackendPreference::Auto => {
            let mut all: Vec<Box<dyn SecretBoxBackend>> = Vec::with_capacity(3);
            all.extend(platform);
            all.push(Box::new(AcceleratedBackend));
            all.push(Box::new(PortableBackend));
            all
        }
        BackendPreference::Platform => match platform {
            Some(backend) => vec![backend],
            None => {
                return Err(CryptoError::BackendUnavailable(
                    "platform backend forced but none was supplied".into(),
                ))
            }
        },
        BackendPreference::Accelerated => vec![Box::new(AcceleratedBackend)],
        BackendPreference::Portable => vec![Box::new(PortableBackend)],
    };

    let mut last_error = None;
    for candidate in candidates {
        match backend::self_test(candidate.as_ref()) {
            Ok(()) => return Ok(candidate),
            Err(e) => {
                warn!(backend = candidate.kind().name(), error = %e, "backend failed self-test");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(CryptoError::BackendUnavailable(msg)) => CryptoError::BackendUnavailable(msg),
        Some(other) => CryptoError::BackendUnavailable(other.to_string()),
        None => CryptoError::BackendUnavailable("no candidate backends".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TAG_SIZE;
    use std::collections::HashSet;

    fn provider() -> PrimitiveProvider {
        PrimitiveProvider::builder()
            .argon2(1024, 1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_auto_prefers_accelerated_without_platform() {
        assert_eq!(provider().backend_kind(), BackendKind::Accelerated);
    }

    #[test]
    fn test_forced_portable() {
        let p = PrimitiveProvider::builder()
            .preference(BackendPreference::Portable)
            .build()
            .unwrap();
        assert_eq!(p.backend_kind(), BackendKind::Portable);
    }

    #[test]
    fn test_forced_platform_without_one_fails() {
        let err = PrimitiveProvider::builder()
            .preference(BackendPreference::Platform)
            .build()
            .unwrap_err();
        assert!(matches!(err, CryptoError::BackendUnavailable(_)));
    }

    #[test]
    fn test_platform_backend_used_when_it_passes() {
        struct Bridge;
        impl SecretBoxBackend for Bridge {
            fn kind(&self) -> BackendKind {
                BackendKind::Platform
            }
            fn seal(
                &self,
                key: &SymmetricKey,
                nonce: &[u8; NONCE_SIZE],
                plaintext: &[u8],
            ) -> CryptoResult<Vec<u8>> {
                PortableBackend.seal(key, nonce, plaintext)
            }
            fn open(
                &self,
                key: &SymmetricKey,
                nonce: &[u8; NONCE_SIZE],
                sealed: &[u8],
            ) -> CryptoResult<Vec<u8>> {
                PortableBackend.open(key, nonce, sealed)
            }
        }

        let p = PrimitiveProvider::builder()
            .platform_backend(Box::new(Bridge))
            .build()
            .unwrap();
        assert_eq!(p.backend_kind(), BackendKind::Platform);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let p = provider();
        let key = p.generate_key();
        let (ct, nonce) = p.encrypt(b"hello inkseal", &key, None).unwrap();
        assert_eq!(ct.len(), TAG_SIZE + 13);
        assert_eq!(p.decrypt(&ct, &key, &nonce).unwrap(), b"hello inkseal");
    }

    #[test]
    fn test_explicit_nonce_is_used() {
        let p = provider();
        let key = p.generate_key();
        let nonce = [7u8; NONCE_SIZE];
        let (_, used) = p.encrypt(b"x", &key, Some(nonce)).unwrap();
        assert_eq!(used, nonce);
    }

    #[test]
    fn test_tamper_fails() {
        let p = provider();
        let key = p.generate_key();
        let mut payload = p.encrypt_payload(b"do not touch", &key).unwrap();
        payload.ciphertext[0] ^= 0x80;
        let err = p.decrypt_payload(&payload, &key).unwrap_err();
        assert!(err.is_integrity_error());
    }

    #[test]
    fn test_bad_nonce_length_fails() {
        let p = provider();
        let key = p.generate_key();
        let (ct, _) = p.encrypt(b"abc", &key, None).unwrap();
        assert!(matches!(
            p.decrypt(&ct, &key, &[0u8; 12]),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_nonces_and_keys_are_unique() {
        let p = provider();
        let nonces: HashSet<_> = (0..1000).map(|_| p.generate_nonce()).collect();
        assert_eq!(nonces.len(), 1000);
        let keys: HashSet<_> = (0..100).map(|_| *p.generate_key().as_bytes()).collect();
        assert_eq!(keys.len(), 100);
    }

    #[test]
    fn test_kdf_params_fall_back_on_invalid_argon2() {
        let p = PrimitiveProvider::builder().argon2(1, 1).build().unwrap();
        assert_eq!(p.kdf_params(3).algorithm, KdfAlgorithm::Sha256Stretch);
        let key = p
            .derive_key(&SecretString::from("pw"), &[1u8; 16], 3)
            .unwrap();
        let again = p
            .derive_key_with(&SecretString::from("pw"), &[1u8; 16], &p.kdf_params(3))
            .unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn test_configured_stretch() {
        let config = CryptoConfig {
            kdf: KdfAlgorithm::Sha256Stretch,
            ..Default::default()
        };
        let p = PrimitiveProvider::from_config(&config).unwrap();
        assert_eq!(p.kdf_params(3).algorithm, KdfAlgorithm::Sha256Stretch);
    }
}
