use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const ENV_API_URL: &str = "EPDE_API_URL";
pub const ENV_TIMEOUT_SECONDS: &str = "EPDE_TIMEOUT_SECONDS";
pub const ENV_KEYRING_SERVICE: &str = "EPDE_KEYRING_SERVICE";
pub const ENV_CACHE_DIR: &str = "EPDE_CACHE_DIR";

const DEFAULT_BASE_URL: &str = "http://localhost:3001/api/v1";
const DEFAULT_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_KEYRING_SERVICE: &str = "com.epde.client";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoints {
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub me: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            refresh: "/auth/refresh".to_string(),
            logout: "/auth/logout".to_string(),
            me: "/auth/me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub stale_time_seconds: u64,
    pub max_age_seconds: u64,
    pub namespace: String,
    pub version: String,
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_seconds: 60,
            max_age_seconds: 24 * 60 * 60,
            namespace: "epde-query-cache".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            directory: None,
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_secs(self.stale_time_seconds)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub endpoints: Endpoints,
    pub keyring_service: String,
    pub cache: CacheConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            user_agent: format!("epde-client/{}", env!("CARGO_PKG_VERSION")),
            endpoints: Endpoints::default(),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
            cache: CacheConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reads a JSON config file; absent keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ApiError::Config(format!("{}: {e}", path.display())))
    }

    pub fn with_env_overrides(self) -> Result<Self, ApiError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = read(ENV_API_URL) {
            self.base_url = url;
        }
        if let Some(raw) = read(ENV_TIMEOUT_SECONDS) {
            self.timeout_seconds = raw.parse().map_err(|_| {
                ApiError::Config(format!("{ENV_TIMEOUT_SECONDS} must be a whole number of seconds"))
            })?;
        }
        if let Some(service) = read(ENV_KEYRING_SERVICE) {
            self.keyring_service = service;
        }
        if let Some(dir) = read(ENV_CACHE_DIR) {
            self.cache.directory = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Base URL with a trailing slash so relative joins keep its path.
    pub fn parsed_base_url(&self) -> Result<Url, ApiError> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw)
            .map_err(|e| ApiError::Config(format!("invalid base URL '{}': {e}", self.base_url)))?;
        if url.cannot_be_a_base() {
            return Err(ApiError::Config(format!(
                "base URL '{}' cannot carry paths",
                self.base_url
            )));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.timeout_seconds == 0 {
            return Err(ApiError::Config("timeoutSeconds must be positive".to_string()));
        }
        self.parsed_base_url()?;
        let endpoints = [
            ("login", &self.endpoints.login),
            ("refresh", &self.endpoints.refresh),
            ("logout", &self.endpoints.logout),
            ("me", &self.endpoints.me),
        ];
        for (name, path) in endpoints {
            if !path.starts_with('/') {
                return Err(ApiError::Config(format!(
                    "endpoint '{name}' must start with '/' (got '{path}')"
                )));
            }
        }
        if self.cache.namespace.trim().is_empty() {
            return Err(ApiError::Config("cache namespace must not be empty".to_string()));
        }
        Ok(())
    }
}
