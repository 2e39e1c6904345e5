use super::{CacheEntry, QueryCache, QueryKey};
use crate::config::CacheConfig;
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: QueryKey,
    entry: CacheEntry,
}

/// On-disk copy of the query cache under `<dir>/<namespace>-<version>.json`.
#[derive(Debug, Clone)]
pub struct PersistedCache {
    dir: PathBuf,
    namespace: String,
    version: String,
    max_age: Duration,
}

fn io_error(path: &Path, err: std::io::Error) -> ApiError {
    ApiError::Persist(format!("{}: {err}", path.display()))
}

/// `<prefix><version>.json`, where the version starts with a digit. This keeps
/// `epde-` from claiming files of a longer namespace such as `epde-query-cache-`.
fn is_versioned_file(name: &str, prefix: &str) -> bool {
    let Some(version) = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".json"))
    else {
        return false;
    };
    version.starts_with(|c: char| c.is_ascii_digit())
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'))
}

impl PersistedCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        namespace: impl Into<String>,
        version: impl Into<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            namespace: namespace.into(),
            version: version.into(),
            max_age,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        let dir = config.directory.as_ref()?;
        Some(Self::new(
            dir.clone(),
            config.namespace.clone(),
            config.version.clone(),
            config.max_age(),
        ))
    }

    /// Versioned cache-namespace string used as the file stem.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.namespace, self.version)
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.cache_key()))
    }

    /// Writes authoritative entries only; optimistic or stale values never reach disk.
    pub async fn save(&self, cache: &QueryCache) -> Result<usize, ApiError> {
        let entries: Vec<PersistedEntry> = cache
            .entries()
            .into_iter()
            .filter(|(_, entry)| entry.is_authoritative())
            .map(|(key, entry)| PersistedEntry { key, entry })
            .collect();
        let count = entries.len();
        let snapshot = PersistedSnapshot {
            saved_at: OffsetDateTime::now_utc(),
            entries,
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(&tmp, raw).await.map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(path = %path.display(), count, "persisted query cache");
        Ok(count)
    }

    /// Loads the snapshot into `cache`. Expired or unreadable snapshots are deleted.
    pub async fn restore(&self, cache: &QueryCache) -> Result<usize, ApiError> {
        let path = self.path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&path, e)),
        };

        let snapshot: PersistedSnapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable query cache");
                self.clear().await?;
                return Ok(0);
            }
        };

        let age_ms = (OffsetDateTime::now_utc() - snapshot.saved_at).whole_milliseconds();
        if age_ms < 0 || age_ms >= self.max_age.as_millis() as i128 {
            info!(path = %path.display(), "discarding expired query cache");
            self.clear().await?;
            return Ok(0);
        }

        let count = snapshot.entries.len();
        for PersistedEntry { key, entry } in snapshot.entries {
            cache.insert_entry(key, entry);
        }
        debug!(path = %path.display(), count, "restored query cache");
        Ok(count)
    }

    /// Removes snapshots written by other app versions of this namespace.
    pub async fn cleanup_previous_versions(&self) -> Result<usize, ApiError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let prefix = format!("{}-", self.namespace);
        let current = format!("{}.json", self.cache_key());
        let mut removed = 0;
        while let Some(item) = dir.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == current || !is_versioned_file(name, &prefix) {
                continue;
            }
            match tokio::fs::remove_file(item.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = name, error = %e, "failed to remove old query cache"),
            }
        }
        if removed > 0 {
            info!(removed, "removed query caches from previous versions");
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), ApiError> {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}
