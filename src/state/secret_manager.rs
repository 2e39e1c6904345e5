use crate::error::ApiError;
use crate::types::TokenPair;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";

/// Opaque key/value storage for secrets.
pub trait SecretBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ApiError>;
    fn set(&self, key: &str, value: &str) -> Result<(), ApiError>;
    fn delete(&self, key: &str) -> Result<(), ApiError>;
    fn clear_all(&self) -> Result<(), ApiError>;
}

/// OS keychain / secret service backend.
///
/// The keychain cannot enumerate entries, so `clear_all` deletes the keys
/// this backend is told about up front.
pub struct KeyringBackend {
    service: String,
    known_keys: Vec<&'static str>,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            known_keys: vec![KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN],
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service, key)
    }

    pub fn is_available(&self) -> bool {
        let Ok(entry) = self.entry(KEY_ACCESS_TOKEN) else {
            return false;
        };

        match entry.get_password() {
            Ok(_) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::BadEncoding(_)) => true,
            Err(keyring::Error::Ambiguous(_)) => true,
            Err(keyring::Error::NoStorageAccess(_)) => false,
            Err(keyring::Error::PlatformFailure(_)) => false,
            Err(_) => false,
        }
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::BadEncoding(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ApiError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ApiError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_all(&self) -> Result<(), ApiError> {
        let mut first_error = None;
        for key in &self.known_keys {
            if let Err(e) = self.delete(key) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// In-process backend, used for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryBackend {
    values: StdMutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ApiError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ApiError> {
        self.values().remove(key);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), ApiError> {
        self.values().clear();
        Ok(())
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

#[derive(Default)]
struct Cached {
    pair: Option<TokenPair>,
    // Bumped by every clear; a writer holding an older value lost the race.
    generation: u64,
}

/// The access/refresh pair, cached in memory in front of a [`SecretBackend`].
///
/// Backend calls happen with the memory lock held, so a clear can never
/// interleave with a read-through or a conditional write.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn SecretBackend>,
    cached: Arc<Mutex<Cached>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            cached: Arc::new(Mutex::new(Cached::default())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn get(&self) -> Result<Option<TokenPair>, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(pair) = cached.pair.clone() {
            return Ok(Some(pair));
        }

        let access = normalize(self.backend.get(KEY_ACCESS_TOKEN)?);
        let refresh = normalize(self.backend.get(KEY_REFRESH_TOKEN)?);
        let (Some(access_token), Some(refresh_token)) = (access, refresh) else {
            return Ok(None);
        };

        let pair = TokenPair {
            access_token,
            refresh_token,
        };
        cached.pair = Some(pair.clone());
        Ok(Some(pair))
    }

    pub async fn access_token(&self) -> Result<Option<String>, ApiError> {
        Ok(self.get().await?.map(|p| p.access_token))
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, ApiError> {
        Ok(self.get().await?.map(|p| p.refresh_token))
    }

    pub async fn has(&self) -> bool {
        matches!(self.get().await, Ok(Some(_)))
    }

    /// Number of clears so far. Pass it to [`TokenStore::set_if_generation`].
    pub async fn generation(&self) -> u64 {
        self.cached.lock().await.generation
    }

    /// Updates memory first so this process keeps working if the backend write fails.
    pub async fn set(&self, pair: &TokenPair) -> Result<(), ApiError> {
        let mut cached = self.cached.lock().await;
        self.write(&mut cached, pair)
    }

    /// Stores `pair` only if the store has not been cleared since `generation`
    /// was read. Returns `false` when the write was dropped.
    pub async fn set_if_generation(
        &self,
        pair: &TokenPair,
        generation: u64,
    ) -> Result<bool, ApiError> {
        let mut cached = self.cached.lock().await;
        if cached.generation != generation {
            return Ok(false);
        }
        self.write(&mut cached, pair)?;
        Ok(true)
    }

    fn write(&self, cached: &mut Cached, pair: &TokenPair) -> Result<(), ApiError> {
        cached.pair = Some(pair.clone());
        self.backend.set(KEY_ACCESS_TOKEN, &pair.access_token)?;
        self.backend.set(KEY_REFRESH_TOKEN, &pair.refresh_token)?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ApiError> {
        let mut cached = self.cached.lock().await;
        self.remove(&mut cached)
    }

    /// Clears only if nobody else cleared (and possibly signed in again) since `generation`.
    pub async fn clear_if_generation(&self, generation: u64) -> Result<bool, ApiError> {
        let mut cached = self.cached.lock().await;
        if cached.generation != generation {
            return Ok(false);
        }
        self.remove(&mut cached)?;
        Ok(true)
    }

    fn remove(&self, cached: &mut Cached) -> Result<(), ApiError> {
        cached.pair = None;
        cached.generation += 1;
        self.backend.delete(KEY_ACCESS_TOKEN)?;
        self.backend.delete(KEY_REFRESH_TOKEN)?;
        Ok(())
    }

    /// Wipes every secret in the backend, not only the token pair.
    pub async fn clear_all(&self) -> Result<(), ApiError> {
        let mut cached = self.cached.lock().await;
        cached.pair = None;
        cached.generation += 1;
        self.backend.clear_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_reads_back_pair() {
        let store = TokenStore::in_memory();
        assert!(!store.has().await);

        store.set(&TokenPair::new("a1", "r1")).await.unwrap();
        assert!(store.has().await);
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("a1"));
        assert_eq!(store.refresh_token().await.unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn get_loads_from_backend_when_memory_is_cold() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(KEY_ACCESS_TOKEN, " a2 ").unwrap();
        backend.set(KEY_REFRESH_TOKEN, "r2").unwrap();

        let store = TokenStore::new(backend);
        assert_eq!(store.get().await.unwrap(), Some(TokenPair::new("a2", "r2")));
    }

    #[tokio::test]
    async fn half_stored_pair_reads_as_absent() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(KEY_ACCESS_TOKEN, "a3").unwrap();
        backend.set(KEY_REFRESH_TOKEN, "  ").unwrap();

        let store = TokenStore::new(backend);
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_removes_memory_and_backend_values() {
        let backend = Arc::new(MemoryBackend::new());
        let store = TokenStore::new(backend.clone());
        store.set(&TokenPair::new("a4", "r4")).await.unwrap();

        store.clear().await.unwrap();
        assert!(!store.has().await);
        assert_eq!(backend.get(KEY_ACCESS_TOKEN).unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_write_is_dropped_after_a_clear() {
        let store = TokenStore::in_memory();
        store.set(&TokenPair::new("a5", "r5")).await.unwrap();
        let generation = store.generation().await;

        store.clear().await.unwrap();
        let written = store
            .set_if_generation(&TokenPair::new("a6", "r6"), generation)
            .await
            .unwrap();

        assert!(!written);
        assert!(!store.has().await);
        assert!(!store.clear_if_generation(generation).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_write_lands_when_nothing_cleared() {
        let store = TokenStore::in_memory();
        let generation = store.generation().await;
        store.set(&TokenPair::new("a7", "r7")).await.unwrap();

        assert!(store
            .set_if_generation(&TokenPair::new("a8", "r8"), generation)
            .await
            .unwrap());
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("a8"));
    }
}
