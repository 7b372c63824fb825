//! Key derivation: password + salt → 256-bit secret-box key
//!
//! Argon2id is preferred. The SHA-256 stretch exists for hosts where Argon2id
//! cannot run (or is configured off); it chains
//! `d₀ = H(salt ‖ password)`, `dᵢ = H(dᵢ₋₁ ‖ salt ‖ password)`.

use argon2::{Algorithm, Argon2, Params, Version};
use inkseal_core::{KdfAlgorithm, KdfParams};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::KEY_SIZE;

/// Floor on SHA-256 rounds regardless of the requested iteration count.
pub const STRETCH_MIN_ITERATIONS: u32 = 10_000;

/// Derive a key exactly as described by `params`.
///
/// CPU-bound; async callers should run this on a blocking worker.
pub fn derive(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<SymmetricKey> {
    match params.algorithm {
        KdfAlgorithm::Argon2id => argon2id(password, salt, params),
        KdfAlgorithm::Sha256Stretch => Ok(sha256_stretch(password, salt, params.iterations)),
    }
}

fn argon2_params(params: &KdfParams) -> CryptoResult<Params> {
    Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2id params: {e}")))
}

/// Whether `params` would be accepted by [`derive`] for Argon2id.
pub fn argon2_params_valid(params: &KdfParams) -> bool {
    argon2_params(params).is_ok()
}

fn argon2id(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<SymmetricKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params(params)?);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2id KDF failed: {e}")))?;

    let derived = SymmetricKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

fn sha256_stretch(password: &SecretString, salt: &[u8], iterations: u32) -> SymmetricKey {
    let password = password.expose_secret().as_bytes();
    let rounds = iterations.max(STRETCH_MIN_ITERATIONS);

    let mut digest: [u8; KEY_SIZE] = Sha256::new()
        .chain_update(salt)
        .chain_update(password)
        .finalize()
        .into();
    for _ in 1..rounds {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(salt)
            .chain_update(password)
            .finalize()
            .into();
    }

    let derived = SymmetricKey::from_bytes(digest);
    digest.zeroize();
    derived
}

/// Cheap start-up check that Argon2id actually runs on this host.
pub fn argon2_self_check() -> CryptoResult<()> {
    let params = KdfParams {
        algorithm: KdfAlgorithm::Argon2id,
        iterations: 1,
        memory_kib: 64,
        parallelism: 1,
    };
    let password = SecretString::from("inkseal-kdf-self-check");
    let a = argon2id(&password, b"inkseal-salt-fixed", &params)?;
    let b = argon2id(&password, b"inkseal-salt-fixed", &params)?;
    if a != b {
        return Err(CryptoError::KeyDerivation(
            "Argon2id self-check is not deterministic".into(),
        ));
    }
    Ok(())
}
