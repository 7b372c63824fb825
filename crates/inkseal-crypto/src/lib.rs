//! inkseal-crypto: client-side E2E encryption for inkseal
//!
//! Two constructions, nothing else:
//!
//! ```text
//! secret-box  XSalsa20-Poly1305, 32-byte key, 24-byte nonce, tag || ciphertext
//!             used for self-encryption, wrapped private keys and file content
//! box         X25519 + XSalsa20-Poly1305 between two known identities
//!             used to hand a file content-key to each reader
//! ```
//!
//! Key hierarchy:
//! ```text
//! password ──KDF(salt)──▶ wrap key ──secret-box──▶ WrappedPrivateKey (remote profile)
//! X25519 private key
//!   ├── self key = BLAKE3 derive_key(context, private key)  (fields, notes)
//!   └── box(author priv, reader pub) ──▶ per-file content key ──▶ blob / chunks
//! ```

pub mod backend;
pub mod cache;
pub mod chunk;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod provider;

pub use backend::{AcceleratedBackend, BackendKind, PortableBackend, SecretBoxBackend};
pub use cache::{CacheStats, PasswordKeyCache};
pub use chunk::{chunk_nonce, open_chunk, seal_chunk, sealed_chunk_len, CHUNK_OVERHEAD};
pub use error::{CryptoError, CryptoResult};
pub use identity::{IdentityKeyService, KeySource};
pub use keys::{KeyPair, PrivateKey, SymmetricKey};
pub use provider::{PrimitiveProvider, ProviderBuilder};

/// Size of every key (symmetric, X25519 public and private) in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an XSalsa20 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a freshly generated KDF salt
pub const SALT_SIZE: usize = 16;
