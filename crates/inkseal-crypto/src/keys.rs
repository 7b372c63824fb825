//! Key material types. Every secret is zeroized on drop and redacted in `Debug`.

use crypto_box::{PublicKey, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// A 256-bit secret-box key (content keys, password-derived keys).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidLength {
            what: "symmetric key",
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.bytes[..].ct_eq(&other.bytes[..]).into()
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// X25519 private key of an identity.
#[derive(Clone)]
pub struct PrivateKey {
    inner: SecretKey,
}

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            inner: SecretKey::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.inner.to_bytes())
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        *self.inner.public_key().as_bytes()
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.inner
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One user's identity key pair.
#[derive(Clone)]
pub struct KeyPair {
    private: PrivateKey,
    public: [u8; KEY_SIZE],
}

impl KeyPair {
    /// Rebuild a pair from the private half; the public half is recomputed.
    pub fn from_private_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let private = PrivateKey::from_bytes(bytes);
        let public = private.public_key();
        Self { private, public }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        &self.public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &inkseal_core::encoding::encode(&self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

pub(crate) fn public_key_from_bytes(bytes: &[u8; KEY_SIZE]) -> PublicKey {
    PublicKey::from(*bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_is_recomputed() {
        let a = KeyPair::from_private_bytes([7u8; KEY_SIZE]);
        let b = KeyPair::from_private_bytes([7u8; KEY_SIZE]);
        let c = KeyPair::from_private_bytes([8u8; KEY_SIZE]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
        assert_eq!(&*a.private_key().to_bytes(), &[7u8; KEY_SIZE]);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_SIZE]);
        let pair = KeyPair::from_private_bytes([0xCD; KEY_SIZE]);
        assert!(format!("{key:?}").contains("REDACTED"));
        assert!(!format!("{key:?}").contains("171"));
        assert!(format!("{pair:?}").contains("REDACTED"));
    }

    #[test]
    fn test_symmetric_key_from_slice_checks_length() {
        assert!(SymmetricKey::from_slice(&[0u8; 31]).is_err());
        assert!(SymmetricKey::from_slice(&[0u8; 32]).is_ok());
    }
}
