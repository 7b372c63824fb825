//! PasswordKeyCache: memoized password key derivation.
//!
//! Password KDFs are deliberately slow, so derived keys are kept in memory
//! (bounded by entry count, bytes and TTL) and, when a [`SecureKeyStore`] is
//! attached, persisted encrypted under a device-local wrap key so a restart
//! within the TTL window does not pay for Argon2id again.
//!
//! Persisted layout in the key store:
//! ```text
//! password-cache/wrap-key   32 random bytes
//! password-cache/index      JSON array of cache ids
//! password-cache/<id>       JSON { payload: EncryptedPayload, stored_at: unix secs }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use inkseal_core::config::CacheConfig;
use inkseal_core::store::SecureKeyStore;
use inkseal_core::{EncryptedPayload, KdfAlgorithm, KdfParams, StoreResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::provider::PrimitiveProvider;
use crate::KEY_SIZE;

const NAME_PREFIX: &str = "password-cache/";
const WRAP_KEY_NAME: &str = "password-cache/wrap-key";
const INDEX_NAME: &str = "password-cache/index";

/// Hex chars kept from the BLAKE3 digest (128 bits).
const ID_LEN: usize = 32;

/// Counters reported by [`PasswordKeyCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub derivations: u64,
    pub evictions: u64,
}

struct CachedKey {
    key: SymmetricKey,
    last_used: Instant,
    /// Logical recency; larger is more recent.
    seq: u64,
    access_count: u64,
    size_bytes: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedKey>,
    bytes: usize,
    seq: u64,
    hits: u64,
    misses: u64,
    derivations: u64,
    evictions: u64,
    /// Bumped by `clear`; work started under an older generation is not kept.
    generation: u64,
}

impl CacheState {
    fn remove(&mut self, id: &str) -> Option<CachedKey> {
        let entry = self.entries.remove(id)?;
        self.bytes -= entry.size_bytes;
        Some(entry)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    payload: EncryptedPayload,
    stored_at: u64,
}

pub struct PasswordKeyCache {
    provider: Arc<PrimitiveProvider>,
    store: Option<Arc<dyn SecureKeyStore>>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<SymmetricKey>>>>,
    /// Serializes wrap-key creation and index rewrites.
    persist_lock: tokio::sync::Mutex<Option<SymmetricKey>>,
}

impl PasswordKeyCache {
    /// Memory-only cache.
    pub fn new(provider: Arc<PrimitiveProvider>, config: CacheConfig) -> Self {
        Self {
            provider,
            store: None,
            config,
            state: Mutex::new(CacheState::default()),
            in_flight: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(None),
        }
    }

    /// Cache that also persists encrypted copies when `config.persist` is set.
    pub fn with_store(
        provider: Arc<PrimitiveProvider>,
        store: Arc<dyn SecureKeyStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::new(provider, config)
        }
    }

    pub fn provider(&self) -> &Arc<PrimitiveProvider> {
        &self.provider
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    fn persisting(&self) -> Option<&Arc<dyn SecureKeyStore>> {
        self.store.as_ref().filter(|_| self.config.persist)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `getOrDerive(password, salt, iterations)` with the provider's KDF settings.
    pub async fn get_or_derive(
        &self,
        password: &SecretString,
        salt: &[u8],
        iterations: u32,
    ) -> CryptoResult<SymmetricKey> {
        let params = self.provider.kdf_params(iterations);
        self.get_or_derive_with(password, salt, &params).await
    }

    /// Same as [`Self::get_or_derive`] for recorded parameters.
    pub async fn get_or_derive_with(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<SymmetricKey> {
        let id = cache_id(password, salt, params);

        if let Some(key) = self.lookup(&id, true) {
            return Ok(key);
        }

        let cell = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            in_flight
                .entry(id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| self.load_or_derive(&id, password, salt, params))
            .await
            .cloned();

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if in_flight.get(&id).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(&id);
        }

        result
    }

    async fn load_or_derive(
        &self,
        id: &str,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<SymmetricKey> {
        if let Some(key) = self.lookup(id, false) {
            return Ok(key);
        }
        let generation = self.state().generation;

        if let Some(store) = self.persisting() {
            match self.load_persisted(store.as_ref(), id).await {
                Ok(Some(key)) => {
                    debug!(id, "restored password key from secure storage");
                    self.insert(id, key.clone(), generation);
                    return Ok(key);
                }
                Ok(None) => {}
                Err(e) => warn!(id, error = %e, "failed to read persisted password key"),
            }
        }

        let provider = Arc::clone(&self.provider);
        let password = SecretString::from(password.expose_secret());
        let salt = salt.to_vec();
        let params = *params;
        let key = tokio::task::spawn_blocking(move || {
            provider.derive_key_with(&password, &salt, &params)
        })
        .await??;

        self.state().derivations += 1;
        if !self.insert(id, key.clone(), generation) {
            debug!(id, "cache cleared during derivation, key not retained");
            return Ok(key);
        }
        debug!(id, "derived password key");

        if let Some(store) = self.persisting() {
            if let Err(e) = self.persist(store.as_ref(), id, &key, generation).await {
                warn!(id, error = %e, "failed to persist password key");
            }
        }

        Ok(key)
    }

    /// Memory lookup. Expired entries are dropped on sight.
    fn lookup(&self, id: &str, count: bool) -> Option<SymmetricKey> {
        let ttl = self.ttl();
        let mut state = self.state();
        let now = Instant::now();

        let expired = match state.entries.get(id) {
            Some(entry) => now.duration_since(entry.last_used) >= ttl,
            None => {
                if count {
                    state.misses += 1;
                }
                return None;
            }
        };
        if expired {
            state.remove(id);
            if count {
                state.misses += 1;
            }
            return None;
        }

        state.seq += 1;
        let seq = state.seq;
        if count {
            state.hits += 1;
        }
        let entry = state.entries.get_mut(id)?;
        entry.last_used = now;
        entry.seq = seq;
        entry.access_count += 1;
        Some(entry.key.clone())
    }

    /// Returns `false` without storing if the cache was cleared since
    /// `generation` was read.
    fn insert(&self, id: &str, key: SymmetricKey, generation: u64) -> bool {
        let ttl = self.ttl();
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        let now = Instant::now();

        state.seq += 1;
        let entry = CachedKey {
            key,
            last_used: now,
            seq: state.seq,
            access_count: 1,
            size_bytes: KEY_SIZE + id.len(),
        };
        state.remove(id);
        state.bytes += entry.size_bytes;
        state.entries.insert(id.to_string(), entry);

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for stale in expired {
            state.remove(&stale);
        }

        while state.entries.len() > self.config.max_entries || state.bytes > self.config.max_bytes
        {
            let mut by_age: Vec<(u64, String)> = state
                .entries
                .iter()
                .map(|(k, e)| (e.seq, k.clone()))
                .collect();
            by_age.sort_unstable();

            let count = (by_age.len() / 5).max(1);
            for (_, victim) in by_age.into_iter().take(count) {
                if let Some(evicted) = state.remove(&victim) {
                    debug!(
                        id = %victim,
                        accesses = evicted.access_count,
                        "evicted password key"
                    );
                }
                state.evictions += 1;
            }
        }
        true
    }

    pub fn stats(&self) -> CacheStats {
        let ttl = self.ttl();
        let now = Instant::now();
        let state = self.state();
        let live = state
            .entries
            .values()
            .filter(|e| now.duration_since(e.last_used) < ttl);
        let (entries, bytes) = live.fold((0, 0), |(n, b), e| (n + 1, b + e.size_bytes));
        CacheStats {
            entries,
            bytes,
            hits: state.hits,
            misses: state.misses,
            derivations: state.derivations,
            evictions: state.evictions,
        }
    }

    /// Forget every derived key: memory, persisted entries, index and wrap key.
    ///
    /// Every delete is attempted; the first failure is returned.
    pub async fn clear(&self) -> CryptoResult<()> {
        {
            let mut state = self.state();
            state.entries.clear();
            state.bytes = 0;
            state.generation += 1;
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();

        let mut wrap_key = self.persist_lock.lock().await;
        *wrap_key = None;

        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };

        let mut first_error = None;
        let ids = match read_index(store.as_ref()).await {
            Ok(ids) => ids,
            Err(e) => {
                first_error = Some(e);
                Vec::new()
            }
        };
        for id in &ids {
            if let Err(e) = store.delete(&entry_name(id)).await {
                warn!(id, error = %e, "failed to delete persisted password key");
                first_error.get_or_insert(e);
            }
        }
        for name in [INDEX_NAME, WRAP_KEY_NAME] {
            if let Err(e) = store.delete(name).await {
                warn!(name, error = %e, "failed to delete password cache record");
                first_error.get_or_insert(e);
            }
        }

        debug!(entries = ids.len(), "password key cache cleared");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn persist(
        &self,
        store: &dyn SecureKeyStore,
        id: &str,
        key: &SymmetricKey,
        generation: u64,
    ) -> CryptoResult<()> {
        let mut guard = self.persist_lock.lock().await;
        if self.state().generation != generation {
            debug!(id, "cache cleared before persist, skipping");
            return Ok(());
        }
        let wrap_key = match guard.as_ref() {
            Some(k) => k.clone(),
            None => {
                let k = match store.get(WRAP_KEY_NAME).await? {
                    Some(bytes) => SymmetricKey::from_slice(&bytes)?,
                    None => {
                        let fresh = self.provider.generate_key();
                        store.set(WRAP_KEY_NAME, fresh.as_bytes()).await?;
                        fresh
                    }
                };
                *guard = Some(k.clone());
                k
            }
        };

        let record = PersistedEntry {
            payload: self.provider.encrypt_payload(key.as_bytes(), &wrap_key)?,
            stored_at: unix_now(),
        };
        let json = serde_json::to_vec(&record)
            .map_err(|e| CryptoError::Encryption(format!("serialize cache entry: {e}")))?;
        store.set(&entry_name(id), &json).await?;

        let mut ids = read_index(store).await?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            write_index(store, &ids).await?;
        }
        Ok(())
    }

    async fn load_persisted(
        &self,
        store: &dyn SecureKeyStore,
        id: &str,
    ) -> CryptoResult<Option<SymmetricKey>> {
        let Some(raw) = store.get(&entry_name(id)).await? else {
            return Ok(None);
        };

        let wrap_key = {
            let mut guard = self.persist_lock.lock().await;
            match guard.as_ref() {
                Some(k) => Some(k.clone()),
                None => match store.get(WRAP_KEY_NAME).await? {
                    Some(bytes) => {
                        let k = SymmetricKey::from_slice(&bytes)?;
                        *guard = Some(k.clone());
                        Some(k)
                    }
                    None => None,
                },
            }
        };

        let restored = wrap_key.and_then(|wrap_key| {
            let record: PersistedEntry = serde_json::from_slice(&raw).ok()?;
            let age = unix_now().saturating_sub(record.stored_at);
            if age >= self.config.ttl_secs {
                debug!(id, age, "persisted password key expired");
                return None;
            }
            let bytes = self
                .provider
                .decrypt_payload(&record.payload, &wrap_key)
                .ok()?;
            SymmetricKey::from_slice(&bytes).ok()
        });

        if restored.is_none() {
            self.discard_persisted(store, id).await;
        }
        Ok(restored)
    }

    async fn discard_persisted(&self, store: &dyn SecureKeyStore, id: &str) {
        if let Err(e) = store.delete(&entry_name(id)).await {
            warn!(id, error = %e, "failed to delete stale password key");
        }
        let _guard = self.persist_lock.lock().await;
        let result = async {
            let mut ids = read_index(store).await?;
            let before = ids.len();
            ids.retain(|existing| existing != id);
            if ids.len() != before {
                write_index(store, &ids).await?;
            }
            StoreResult::Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(id, error = %e, "failed to update password cache index");
        }
    }
}

/// Truncated, non-reversible digest of everything that determines the key.
fn cache_id(password: &SecretString, salt: &[u8], params: &KdfParams) -> String {
    let password = password.expose_secret().as_bytes();
    let algorithm: u8 = match params.algorithm {
        KdfAlgorithm::Argon2id => 1,
        KdfAlgorithm::Sha256Stretch => 2,
    };

    let mut hasher = blake3::Hasher::new_derive_key("inkseal 2024 password key cache id v1");
    hasher.update(&(password.len() as u64).to_le_bytes());
    hasher.update(password);
    hasher.update(&(salt.len() as u64).to_le_bytes());
    hasher.update(salt);
    hasher.update(&[algorithm]);
    hasher.update(&params.iterations.to_le_bytes());
    hasher.update(&params.memory_kib.to_le_bytes());
    hasher.update(&params.parallelism.to_le_bytes());

    let hex = hasher.finalize().to_hex();
    hex.as_str()[..ID_LEN].to_string()
}

fn entry_name(id: &str) -> String {
    format!("{NAME_PREFIX}{id}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn read_index(store: &dyn SecureKeyStore) -> StoreResult<Vec<String>> {
    match store.get(INDEX_NAME).await? {
        Some(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "password cache index unreadable, starting over");
            Vec::new()
        })),
        None => Ok(Vec::new()),
    }
}

async fn write_index(store: &dyn SecureKeyStore, ids: &[String]) -> StoreResult<()> {
    let json = serde_json::to_vec(ids)?;
    store.set(INDEX_NAME, &json).await
}
