use super::QueryKey;
use crate::error::ApiError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Last-known-good server data.
    pub data: Option<Value>,
    /// Value shown to readers while a mutation is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub invalidated: bool,
}

impl CacheEntry {
    pub fn new(data: Value) -> Self {
        Self {
            data: Some(data),
            optimistic: None,
            updated_at: OffsetDateTime::now_utc(),
            invalidated: false,
        }
    }

    pub fn visible(&self) -> Option<&Value> {
        self.optimistic.as_ref().or(self.data.as_ref())
    }

    pub fn is_authoritative(&self) -> bool {
        self.optimistic.is_none() && !self.invalidated && self.data.is_some()
    }

    pub fn is_fresh(&self, stale_time: Duration, now: OffsetDateTime) -> bool {
        let age_ms = (now - self.updated_at).whole_milliseconds();
        self.is_authoritative() && age_ms >= 0 && age_ms < stale_time.as_millis() as i128
    }
}

/// Whole-entry copy used for rollback. `entry: None` means the key was absent.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub key: QueryKey,
    pub entry: Option<CacheEntry>,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    // Bumped by `cancel`; a read only writes back if the epoch it started under is current.
    cancel_epoch: u64,
    readers: usize,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.entry.is_none() && self.readers == 0
    }
}

fn prune(slots: &mut HashMap<QueryKey, Slot>, key: &QueryKey) {
    if slots.get(key).is_some_and(Slot::is_idle) {
        slots.remove(key);
    }
}

/// Registers an in-flight read on its slot so the slot (and its epoch)
/// outlives any `remove` or `clear` until the read settles or is dropped.
struct ReadGuard<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.cache.slots();
        if let Some(slot) = slots.get_mut(self.key) {
            slot.readers = slot.readers.saturating_sub(1);
        }
        prune(&mut slots, self.key);
    }
}

/// Key-addressed store of server data. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct QueryCache {
    slots: Arc<Mutex<HashMap<QueryKey, Slot>>>,
    stale_time: Duration,
}

impl QueryCache {
    pub fn new(stale_time: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            stale_time,
        }
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.slots().get(key).and_then(|slot| slot.entry.clone())
    }

    pub fn get_data(&self, key: &QueryKey) -> Option<Value> {
        self.slots()
            .get(key)
            .and_then(|slot| slot.entry.as_ref())
            .and_then(|entry| entry.visible().cloned())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        self.get_data(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(QueryKey, CacheEntry)> {
        self.slots()
            .iter()
            .filter_map(|(key, slot)| slot.entry.clone().map(|entry| (key.clone(), entry)))
            .collect()
    }

    /// Authoritative write: replaces data and drops any optimistic override.
    pub fn set_data(&self, key: &QueryKey, value: Value) {
        self.slots().entry(key.clone()).or_default().entry = Some(CacheEntry::new(value));
    }

    pub(crate) fn insert_entry(&self, key: QueryKey, entry: CacheEntry) {
        self.slots().entry(key).or_default().entry = Some(entry);
    }

    /// Returns fresh data, or runs `fetcher` and stores its result.
    ///
    /// If the key is cancelled while the fetch is in flight, the fetched value
    /// is discarded and whatever is visible in the cache wins.
    pub async fn fetch<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let epoch = {
            let mut slots = self.slots();
            if let Some(entry) = slots.get(key).and_then(|slot| slot.entry.as_ref()) {
                if entry.is_fresh(self.stale_time, OffsetDateTime::now_utc()) {
                    if let Some(data) = &entry.data {
                        return Ok(data.clone());
                    }
                }
            }
            let slot = slots.entry(key.clone()).or_default();
            slot.readers += 1;
            slot.cancel_epoch
        };
        let reader = ReadGuard { cache: self, key };

        let value = fetcher().await?;

        let settled = {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_default();
            if slot.cancel_epoch != epoch {
                debug!(key = %key, "discarding result of cancelled read");
                let visible = slot.entry.as_ref().and_then(|e| e.visible().cloned());
                visible.unwrap_or(value)
            } else {
                slot.entry = Some(CacheEntry::new(value.clone()));
                value
            }
        };
        drop(reader);
        Ok(settled)
    }

    pub async fn fetch_as<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let value = self.fetch(key, fetcher).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Advisory cancellation of any read in flight for `key`. A key with
    /// no slot has no reads in flight, so nothing is recorded for it.
    pub fn cancel(&self, key: &QueryKey) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.cancel_epoch += 1;
        }
    }

    pub fn cancel_all(&self) {
        for slot in self.slots().values_mut() {
            slot.cancel_epoch += 1;
        }
    }

    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(entry) = self.slots().get_mut(key).and_then(|s| s.entry.as_mut()) {
            entry.invalidated = true;
        }
    }

    /// Marks every entry matching the partial `filter` key as stale.
    pub fn invalidate_matching(&self, filter: &QueryKey) -> usize {
        let mut count = 0;
        for (key, slot) in self.slots().iter_mut() {
            if !key.matches(filter) {
                continue;
            }
            if let Some(entry) = slot.entry.as_mut() {
                entry.invalidated = true;
                count += 1;
            }
        }
        debug!(filter = %filter, count, "invalidated cache entries");
        count
    }

    pub fn remove(&self, key: &QueryKey) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(key) {
            slot.entry = None;
        }
        prune(&mut slots, key);
    }

    /// Drops every entry. In-flight reads are cancelled so they cannot repopulate it.
    pub fn clear(&self) {
        let mut slots = self.slots();
        for slot in slots.values_mut() {
            slot.cancel_epoch += 1;
            slot.entry = None;
        }
        slots.retain(|_, slot| !slot.is_idle());
    }

    pub fn snapshot(&self, key: &QueryKey) -> EntrySnapshot {
        EntrySnapshot {
            key: key.clone(),
            entry: self.get(key),
        }
    }

    /// Single replace of the entry with the snapshot, never a merge.
    pub fn restore(&self, snapshot: EntrySnapshot) {
        let mut slots = self.slots();
        slots.entry(snapshot.key.clone()).or_default().entry = snapshot.entry;
        prune(&mut slots, &snapshot.key);
    }

    /// Sets the override computed from the visible value; `None` from
    /// `update` leaves the entry as it is.
    pub(crate) fn apply_optimistic(
        &self,
        key: &QueryKey,
        update: impl FnOnce(Option<&Value>) -> Option<Value>,
    ) -> Option<Value> {
        let mut slots = self.slots();
        let current = slots
            .get(key)
            .and_then(|slot| slot.entry.as_ref())
            .and_then(|e| e.visible());
        let next = update(current)?;
        let slot = slots.entry(key.clone()).or_default();
        match slot.entry.as_mut() {
            Some(entry) => entry.optimistic = Some(next.clone()),
            None => {
                slot.entry = Some(CacheEntry {
                    data: None,
                    optimistic: Some(next.clone()),
                    updated_at: OffsetDateTime::now_utc(),
                    invalidated: false,
                })
            }
        }
        Some(next)
    }

    /// Confirms `applied` as data if it is still the visible override.
    pub(crate) fn confirm_optimistic(&self, key: &QueryKey, applied: &Value) {
        if let Some(entry) = self.slots().get_mut(key).and_then(|s| s.entry.as_mut()) {
            if entry.optimistic.as_ref() == Some(applied) {
                entry.data = entry.optimistic.take();
            }
        }
    }
}
