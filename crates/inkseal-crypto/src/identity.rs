//! IdentityKeyService: per-user X25519 identity lifecycle.
//!
//! The private key lives in device-local secure storage and, wrapped under a
//! password-derived key, on the remote profile so it can be recovered on a
//! new device. At most one key pair is held in memory, for the signed-in user.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use inkseal_core::store::{ProfileDirectory, SecureKeyStore};
use inkseal_core::{EncryptedPayload, PayloadVersion, StoreError, UserId, WrappedPrivateKey};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::cache::PasswordKeyCache;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{public_key_from_bytes, KeyPair, PrivateKey, SymmetricKey};
use crate::provider::PrimitiveProvider;
use crate::{KEY_SIZE, NONCE_SIZE};

const SELF_KEY_CONTEXT: &str = "inkseal 2024 identity self-encryption v1";
const SELF_TEST_MESSAGE: &[u8] = b"inkseal key pair self-test";

/// Where the session key pair of [`IdentityKeyService::ensure_keys`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Device-local secure storage.
    Local,
    /// Unwrapped from the remote backup with the user's password.
    Recovered,
    /// Freshly generated and backed up.
    Generated,
}

struct Session {
    user_id: UserId,
    keys: KeyPair,
}

pub struct IdentityKeyService {
    provider: Arc<PrimitiveProvider>,
    cache: Arc<PasswordKeyCache>,
    profiles: Arc<dyn ProfileDirectory>,
    local: Arc<dyn SecureKeyStore>,
    kdf_iterations: u32,
    session: RwLock<Option<Session>>,
}

impl IdentityKeyService {
    pub fn new(
        provider: Arc<PrimitiveProvider>,
        cache: Arc<PasswordKeyCache>,
        profiles: Arc<dyn ProfileDirectory>,
        local: Arc<dyn SecureKeyStore>,
        kdf_iterations: u32,
    ) -> Self {
        Self {
            provider,
            cache,
            profiles,
            local,
            kdf_iterations,
            session: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<PrimitiveProvider> {
        &self.provider
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_session(&self, user_id: &str, keys: KeyPair) {
        *self.write_session() = Some(Session {
            user_id: user_id.to_string(),
            keys,
        });
    }

    /// Create a fresh identity and back it up, replacing any previous local
    /// and remote key material for `user_id`.
    pub async fn generate_and_backup(
        &self,
        user_id: &str,
        password: &SecretString,
    ) -> CryptoResult<KeyPair> {
        let seed = self.provider.generate_key();
        let keys = KeyPair::from_private_bytes(*seed.as_bytes());
        drop(seed);

        self.local
            .set(&local_key_name(user_id), &keys.private_key().to_bytes()[..])
            .await?;

        let wrapped = self.wrap_private_key(keys.private_key(), password).await?;
        self.profiles
            .set_public_key(user_id, *keys.public_key())
            .await?;
        self.profiles
            .set_wrapped_private_key(user_id, &wrapped)
            .await?;

        info!(user_id, "generated and backed up identity key pair");
        self.start_session(user_id, keys.clone());
        Ok(keys)
    }

    async fn wrap_private_key(
        &self,
        private: &PrivateKey,
        password: &SecretString,
    ) -> CryptoResult<WrappedPrivateKey> {
        let salt = self.provider.generate_salt();
        let kdf = self.provider.kdf_params(self.kdf_iterations);
        let wrap_key = self.cache.get_or_derive_with(password, &salt, &kdf).await?;

        let (ciphertext, nonce) = self
            .provider
            .encrypt(&private.to_bytes()[..], &wrap_key, None)?;

        Ok(WrappedPrivateKey {
            ciphertext,
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            kdf,
            version: PayloadVersion::V1,
        })
    }

    /// Make sure `user_id` has a session key pair, preferring local storage,
    /// then the remote backup. A new identity is only created when neither
    /// exists, so an existing backup is never silently rotated.
    pub async fn ensure_keys(
        &self,
        user_id: &str,
        password: &SecretString,
    ) -> CryptoResult<KeySource> {
        if self.load_local(user_id).await?.is_some() {
            return Ok(KeySource::Local);
        }
        if self.recover_from_backup(user_id, password).await?.is_some() {
            return Ok(KeySource::Recovered);
        }
        self.generate_and_backup(user_id, password).await?;
        Ok(KeySource::Generated)
    }

    /// Unwrap the remote backup with `password`.
    ///
    /// `Ok(None)` when there is no backup. Any failure to decrypt or verify
    /// the key pair is reported as [`CryptoError::WrongPassword`].
    pub async fn recover_from_backup(
        &self,
        user_id: &str,
        password: &SecretString,
    ) -> CryptoResult<Option<KeyPair>> {
        let Some(wrapped) = self.profiles.get_wrapped_private_key(user_id).await? else {
            debug!(user_id, "no key backup on profile");
            return Ok(None);
        };
        let stored_public = self.profiles.get_public_key(user_id).await?;

        let unwrap_key = self
            .cache
            .get_or_derive_with(password, &wrapped.salt, &wrapped.kdf)
            .await?;

        let plaintext = self
            .provider
            .decrypt(&wrapped.ciphertext, &unwrap_key, &wrapped.nonce)
            .map_err(|_| CryptoError::WrongPassword)?;
        let bytes: [u8; KEY_SIZE] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::WrongPassword)?;
        let keys = KeyPair::from_private_bytes(bytes);

        match stored_public {
            Some(public) if public != *keys.public_key() => {
                warn!(user_id, "recovered private key does not match profile public key");
                return Err(CryptoError::WrongPassword);
            }
            Some(_) => {}
            None => warn!(user_id, "profile has a key backup but no public key"),
        }
        self.self_test(&keys)
            .map_err(|_| CryptoError::WrongPassword)?;

        self.local
            .set(&local_key_name(user_id), &keys.private_key().to_bytes()[..])
            .await?;

        info!(user_id, "recovered identity key pair from backup");
        self.start_session(user_id, keys.clone());
        Ok(Some(keys))
    }

    fn self_test(&self, keys: &KeyPair) -> CryptoResult<()> {
        let payload = self.encrypt_for_self(SELF_TEST_MESSAGE, keys.private_key())?;
        let opened = self.decrypt_for_self(&payload, keys.private_key())?;
        if opened != SELF_TEST_MESSAGE {
            return Err(CryptoError::DecryptionFailed(
                "key pair self-test mismatch".into(),
            ));
        }
        Ok(())
    }

    /// Restore the session key pair from device-local storage.
    pub async fn load_local(&self, user_id: &str) -> CryptoResult<Option<KeyPair>> {
        let Some(raw) = self.local.get(&local_key_name(user_id)).await? else {
            return Ok(None);
        };
        let bytes: [u8; KEY_SIZE] =
            raw.as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "stored private key",
                    expected: KEY_SIZE,
                    actual: raw.len(),
                })?;
        let keys = KeyPair::from_private_bytes(bytes);
        debug!(user_id, "loaded identity key pair from secure storage");
        self.start_session(user_id, keys.clone());
        Ok(Some(keys))
    }

    /// Drop the session key pair and every cached password key.
    pub async fn sign_out(&self) -> CryptoResult<()> {
        let previous = self.write_session().take();
        if let Some(session) = previous {
            info!(user_id = %session.user_id, "signed out");
        }
        self.cache.clear().await
    }

    /// Forget the device-local copy (the remote backup is untouched).
    pub async fn remove_local_key(&self, user_id: &str) -> CryptoResult<()> {
        self.local.delete(&local_key_name(user_id)).await?;
        let mut session = self.write_session();
        if session.as_ref().is_some_and(|s| s.user_id == user_id) {
            *session = None;
        }
        Ok(())
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.read_session().as_ref().map(|s| s.user_id.clone())
    }

    /// The signed-in user's key pair.
    pub fn session_keys(&self) -> CryptoResult<KeyPair> {
        self.read_session()
            .as_ref()
            .map(|s| s.keys.clone())
            .ok_or(CryptoError::NotInitialized)
    }

    pub fn public_key(&self) -> CryptoResult<[u8; KEY_SIZE]> {
        self.read_session()
            .as_ref()
            .map(|s| *s.keys.public_key())
            .ok_or(CryptoError::NotInitialized)
    }

    pub async fn has_backup(&self, user_id: &str) -> CryptoResult<bool> {
        Ok(self
            .profiles
            .get_wrapped_private_key(user_id)
            .await?
            .is_some())
    }

    pub async fn public_key_of(&self, user_id: &str) -> CryptoResult<Option<[u8; KEY_SIZE]>> {
        Ok(self.profiles.get_public_key(user_id).await?)
    }

    async fn require_public_key(&self, user_id: &str) -> CryptoResult<[u8; KEY_SIZE]> {
        self.public_key_of(user_id).await?.ok_or_else(|| {
            CryptoError::Store(StoreError::NotFound(format!(
                "public key for user {user_id}"
            )))
        })
    }

    /// Box-encrypt for one recipient.
    pub fn encrypt_for_peer(
        &self,
        plaintext: &[u8],
        recipient_public: &[u8; KEY_SIZE],
        sender: &PrivateKey,
    ) -> CryptoResult<EncryptedPayload> {
        let salsa_box = SalsaBox::new(&public_key_from_bytes(recipient_public), sender.secret());
        let nonce = self.provider.generate_nonce();
        let ciphertext = salsa_box
            .encrypt(crypto_box::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(format!("box seal failed: {e}")))?;
        Ok(EncryptedPayload::new(ciphertext, nonce.to_vec()))
    }

    pub fn decrypt_from_peer(
        &self,
        payload: &EncryptedPayload,
        sender_public: &[u8; KEY_SIZE],
        recipient: &PrivateKey,
    ) -> CryptoResult<Vec<u8>> {
        if payload.nonce.len() != NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                payload.nonce.len()
            )));
        }
        let salsa_box = SalsaBox::new(&public_key_from_bytes(sender_public), recipient.secret());
        salsa_box
            .decrypt(
                crypto_box::Nonce::from_slice(&payload.nonce),
                payload.ciphertext.as_slice(),
            )
            .map_err(|_| {
                CryptoError::DecryptionFailed(
                    "box open failed (wrong key or tampered data)".into(),
                )
            })
    }

    /// Box-encrypt from the signed-in user to `recipient_id`, looking up the
    /// recipient's public key on their profile.
    pub async fn encrypt_for_user(
        &self,
        plaintext: &[u8],
        recipient_id: &str,
    ) -> CryptoResult<EncryptedPayload> {
        let keys = self.session_keys()?;
        let recipient = self.require_public_key(recipient_id).await?;
        self.encrypt_for_peer(plaintext, &recipient, keys.private_key())
    }

    pub async fn decrypt_from_user(
        &self,
        payload: &EncryptedPayload,
        sender_id: &str,
    ) -> CryptoResult<Vec<u8>> {
        let keys = self.session_keys()?;
        let sender = self.require_public_key(sender_id).await?;
        self.decrypt_from_peer(payload, &sender, keys.private_key())
    }

    /// Secret-box under the key derived from `private` for the owner's own data.
    pub fn encrypt_for_self(
        &self,
        plaintext: &[u8],
        private: &PrivateKey,
    ) -> CryptoResult<EncryptedPayload> {
        self.provider.encrypt_payload(plaintext, &self_key(private))
    }

    pub fn decrypt_for_self(
        &self,
        payload: &EncryptedPayload,
        private: &PrivateKey,
    ) -> CryptoResult<Vec<u8>> {
        self.provider.decrypt_payload(payload, &self_key(private))
    }

    /// Encrypt a text field for the signed-in user: `v1.<nonce>.<ciphertext>`.
    pub fn encrypt_field(&self, text: &str) -> CryptoResult<String> {
        let keys = self.session_keys()?;
        let payload = self.encrypt_for_self(text.as_bytes(), keys.private_key())?;
        Ok(payload.to_field_string())
    }

    pub fn decrypt_field(&self, field: &str) -> CryptoResult<String> {
        let keys = self.session_keys()?;
        let payload = EncryptedPayload::from_field_string(field)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        let bytes = self.decrypt_for_self(&payload, keys.private_key())?;
        String::from_utf8(bytes)
            .map_err(|_| CryptoError::DecryptionFailed("field is not valid UTF-8".into()))
    }
}

/// One-way symmetric key for self-encryption. Never the X25519 key itself.
fn self_key(private: &PrivateKey) -> SymmetricKey {
    SymmetricKey::from_bytes(blake3::derive_key(SELF_KEY_CONTEXT, &private.to_bytes()[..]))
}

fn local_key_name(user_id: &str) -> String {
    format!("identity/{user_id}/private-key")
}
