use super::{AuthState, KeyringBackend, SecretBackend, TokenStore};
use crate::cache::{PersistedCache, QueryCache};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::http::ApiClient;
use crate::resources::TasksApi;
use std::sync::Arc;
use tracing::warn;

/// Everything a front end needs, built explicitly so each instance (and each
/// test) is isolated from the others.
#[derive(Clone)]
pub struct EpdeClient {
    pub config: ClientConfig,
    pub tokens: TokenStore,
    pub api: ApiClient,
    pub cache: QueryCache,
    pub persisted: Option<PersistedCache>,
    pub auth: AuthState,
    pub tasks: TasksApi,
}

impl EpdeClient {
    pub fn new(config: ClientConfig, backend: Arc<dyn SecretBackend>) -> Result<Self, ApiError> {
        config.validate()?;
        let tokens = TokenStore::new(backend);
        let api = ApiClient::new(&config, tokens.clone())?;
        let cache = QueryCache::new(config.cache.stale_time());
        let persisted = PersistedCache::from_config(&config.cache);
        let auth = AuthState::new(api.clone(), cache.clone(), persisted.clone());
        let tasks = TasksApi::new(api.clone(), cache.clone());
        Ok(Self {
            config,
            tokens,
            api,
            cache,
            persisted,
            auth,
            tasks,
        })
    }

    /// Client backed by the OS keychain under the configured service name.
    pub fn with_keyring(config: ClientConfig) -> Result<Self, ApiError> {
        let backend = KeyringBackend::new(config.keyring_service.clone());
        if !backend.is_available() {
            return Err(ApiError::Storage(
                "OS keychain/secret service is unavailable.".to_string(),
            ));
        }
        Self::new(config, Arc::new(backend))
    }

    /// Removes old-version cache files, then loads the current snapshot.
    pub async fn restore_cache(&self) -> usize {
        let Some(persisted) = &self.persisted else {
            return 0;
        };
        if let Err(e) = persisted.cleanup_previous_versions().await {
            warn!(error = %e, "query cache cleanup failed");
        }
        match persisted.restore(&self.cache).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "query cache restore failed");
                0
            }
        }
    }

    pub async fn persist_cache(&self) -> Result<usize, ApiError> {
        match &self.persisted {
            Some(persisted) => persisted.save(&self.cache).await,
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryKey;
    use crate::state::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn instances_do_not_share_state() {
        let a = EpdeClient::new(ClientConfig::default(), Arc::new(MemoryBackend::new())).unwrap();
        let b = EpdeClient::new(ClientConfig::default(), Arc::new(MemoryBackend::new())).unwrap();

        a.cache.set_data(&QueryKey::new("tasks"), json!([]));
        a.tokens
            .set(&crate::types::TokenPair::new("a", "r"))
            .await
            .unwrap();

        assert!(b.cache.get(&QueryKey::new("tasks")).is_none());
        assert!(!b.tokens.has().await);
    }

    #[tokio::test]
    async fn cache_round_trips_through_configured_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.cache.directory = Some(tmp.path().to_path_buf());

        let first = EpdeClient::new(config.clone(), Arc::new(MemoryBackend::new())).unwrap();
        first.cache.set_data(&QueryKey::new("dashboard-stats"), json!({"properties": 4}));
        assert_eq!(first.persist_cache().await.unwrap(), 1);

        let second = EpdeClient::new(config, Arc::new(MemoryBackend::new())).unwrap();
        assert_eq!(second.restore_cache().await, 1);
        assert_eq!(
            second.cache.get_data(&QueryKey::new("dashboard-stats")),
            Some(json!({"properties": 4}))
        );
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = ClientConfig {
            timeout_seconds: 0,
            ..ClientConfig::default()
        };
        assert!(EpdeClient::new(config, Arc::new(MemoryBackend::new())).is_err());
    }
}
