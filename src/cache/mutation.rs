//! Three-phase optimistic mutation: begin (snapshot + apply), then either
//! commit (confirm + invalidate) or rollback (restore the snapshot).
//!
//! Each mutation type declares its own [`MutationPlan`]; nothing infers
//! which keys a write affects.

use super::{EntrySnapshot, QueryCache, QueryKey};
use crate::error::ApiError;
use serde_json::Value;
use std::future::Future;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    pub name: &'static str,
    /// Key that receives the optimistic value.
    pub target: QueryKey,
    /// Partial keys invalidated after a successful write, on top of `target`.
    pub dependents: Vec<QueryKey>,
}

impl MutationPlan {
    pub fn new(name: &'static str, target: QueryKey) -> Self {
        Self {
            name,
            target,
            dependents: Vec::new(),
        }
    }

    pub fn invalidates(mut self, key: QueryKey) -> Self {
        self.dependents.push(key);
        self
    }
}

/// An applied optimistic value awaiting reconciliation.
///
/// Dropping the guard without settling it rolls back, so a cancelled write
/// cannot leave an override behind.
pub struct OptimisticGuard {
    cache: QueryCache,
    plan: MutationPlan,
    snapshot: Option<EntrySnapshot>,
    applied: Option<Value>,
}

impl OptimisticGuard {
    pub fn applied(&self) -> Option<&Value> {
        self.applied.as_ref()
    }

    pub fn snapshot(&self) -> Option<&EntrySnapshot> {
        self.snapshot.as_ref()
    }

    /// Write succeeded: keep the value visible but mark everything stale.
    pub fn commit(mut self) {
        self.snapshot = None;
        let cache = &self.cache;
        if let Some(applied) = &self.applied {
            cache.confirm_optimistic(&self.plan.target, applied);
        }
        cache.invalidate(&self.plan.target);
        for key in &self.plan.dependents {
            cache.invalidate_matching(key);
        }
        debug!(mutation = self.plan.name, target = %self.plan.target, "optimistic mutation committed");
    }

    /// Write failed: put the snapshot back exactly as captured.
    pub fn rollback(mut self) {
        self.restore_snapshot();
    }

    fn restore_snapshot(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.cache.restore(snapshot);
            debug!(mutation = self.plan.name, target = %self.plan.target, "optimistic mutation rolled back");
        }
    }
}

impl Drop for OptimisticGuard {
    fn drop(&mut self) {
        self.restore_snapshot();
    }
}

impl QueryCache {
    /// Cancels reads for the target, snapshots it, then applies `update`
    /// to the currently visible value.
    pub fn begin_optimistic(
        &self,
        plan: MutationPlan,
        update: impl FnOnce(Option<&Value>) -> Option<Value>,
    ) -> OptimisticGuard {
        self.cancel(&plan.target);
        let snapshot = self.snapshot(&plan.target);
        let applied = self.apply_optimistic(&plan.target, update);
        OptimisticGuard {
            cache: self.clone(),
            plan,
            snapshot: Some(snapshot),
            applied,
        }
    }

    /// Runs all three phases around `write`.
    pub async fn run_optimistic<T, Fut>(
        &self,
        plan: MutationPlan,
        update: impl FnOnce(Option<&Value>) -> Option<Value>,
        write: Fut,
    ) -> Result<T, ApiError>
    where
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let guard = self.begin_optimistic(plan, update);
        match write.await {
            Ok(value) => {
                guard.commit();
                Ok(value)
            }
            Err(err) => {
                guard.rollback();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cache() -> QueryCache {
        QueryCache::new(Duration::from_secs(60))
    }

    fn detail_key() -> QueryKey {
        QueryKey::new("task").param("id", "t1")
    }

    fn complete(current: Option<&Value>) -> Option<Value> {
        let mut task = current.cloned().unwrap_or_else(|| json!({}));
        task["status"] = json!("completed");
        Some(task)
    }

    #[tokio::test]
    async fn failed_write_restores_exact_original() {
        let cache = cache();
        let original = json!({"id": "t1", "status": "pending"});
        cache.set_data(&detail_key(), original.clone());
        let before = cache.get(&detail_key());

        let result: Result<(), _> = cache
            .run_optimistic(MutationPlan::new("complete-task", detail_key()), complete, async {
                Err(ApiError::Business {
                    status: 409,
                    message: "Task already completed".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(cache.get(&detail_key()), before);
        assert_eq!(cache.get_data(&detail_key()), Some(original));
    }

    #[tokio::test]
    async fn successful_write_leaves_target_and_dependents_invalidated() {
        let cache = cache();
        cache.set_data(&detail_key(), json!({"id": "t1", "status": "pending"}));
        cache.set_data(&QueryKey::new("tasks").param("status", "pending"), json!([]));
        cache.set_data(&QueryKey::new("dashboard-stats"), json!({"pendingTasks": 1}));

        let plan = MutationPlan::new("complete-task", detail_key())
            .invalidates(QueryKey::new("tasks"))
            .invalidates(QueryKey::new("dashboard-stats"));
        cache
            .run_optimistic(plan, complete, async { Ok::<_, ApiError>(()) })
            .await
            .unwrap();

        let entry = cache.get(&detail_key()).unwrap();
        assert!(entry.invalidated);
        assert!(entry.optimistic.is_none());
        assert_eq!(entry.data, Some(json!({"id": "t1", "status": "completed"})));
        assert!(!entry.is_authoritative());
        assert!(cache.get(&QueryKey::new("tasks").param("status", "pending")).unwrap().invalidated);
        assert!(cache.get(&QueryKey::new("dashboard-stats")).unwrap().invalidated);
    }

    #[test]
    fn optimistic_value_is_visible_but_not_authoritative() {
        let cache = cache();
        cache.set_data(&detail_key(), json!({"status": "pending"}));

        let guard = cache.begin_optimistic(MutationPlan::new("complete-task", detail_key()), complete);
        let entry = cache.get(&detail_key()).unwrap();
        assert_eq!(entry.visible(), Some(&json!({"status": "completed"})));
        assert_eq!(entry.data, Some(json!({"status": "pending"})));
        assert!(!entry.is_authoritative());
        drop(guard);

        assert!(cache.get(&detail_key()).unwrap().is_authoritative());
    }

    #[test]
    fn rollback_of_absent_key_removes_it_again() {
        let cache = cache();
        let guard = cache.begin_optimistic(MutationPlan::new("complete-task", detail_key()), complete);
        assert!(cache.get(&detail_key()).is_some());
        guard.rollback();
        assert!(cache.get(&detail_key()).is_none());
    }

    // Observed behaviour, kept on purpose: the second snapshot is taken after
    // the first override is applied, so rolling the second back restores the
    // first mutation's optimistic state rather than the server original.
    #[test]
    fn overlapping_rollback_restores_previous_optimistic_state() {
        let cache = cache();
        let key = QueryKey::new("task").param("id", "t1");
        cache.set_data(&key, json!({"title": "original"}));

        let first = cache.begin_optimistic(MutationPlan::new("rename", key.clone()), |_| {
            Some(json!({"title": "first"}))
        });
        let second = cache.begin_optimistic(MutationPlan::new("rename", key.clone()), |_| {
            Some(json!({"title": "second"}))
        });

        second.rollback();
        assert_eq!(cache.get_data(&key), Some(json!({"title": "first"})));
        assert!(!cache.get(&key).unwrap().is_authoritative());

        first.rollback();
        assert_eq!(cache.get_data(&key), Some(json!({"title": "original"})));
    }

    #[test]
    fn commit_does_not_promote_a_superseded_override() {
        let cache = cache();
        let key = detail_key();
        cache.set_data(&key, json!({"title": "original"}));

        let first = cache.begin_optimistic(MutationPlan::new("rename", key.clone()), |_| {
            Some(json!({"title": "first"}))
        });
        let _second = cache.begin_optimistic(MutationPlan::new("rename", key.clone()), |_| {
            Some(json!({"title": "second"}))
        });

        first.commit();
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.data, Some(json!({"title": "original"})));
        assert_eq!(entry.visible(), Some(&json!({"title": "second"})));
        assert!(entry.invalidated);
    }

    #[test]
    fn update_returning_none_applies_nothing_but_commit_still_invalidates() {
        let cache = cache();
        let key = detail_key();
        cache.set_data(&key, json!({"status": "pending"}));

        let guard = cache.begin_optimistic(MutationPlan::new("noop", key.clone()), |_| None);
        assert!(guard.applied().is_none());
        assert!(cache.get(&key).unwrap().optimistic.is_none());
        guard.commit();

        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.data, Some(json!({"status": "pending"})));
        assert!(entry.invalidated);
    }

    #[tokio::test]
    async fn begin_cancels_in_flight_reads_for_target() {
        let cache = cache();
        let key = detail_key();
        cache.set_data(&key, json!({"status": "pending"}));
        cache.invalidate(&key);

        let mutating = cache.clone();
        let target = key.clone();
        let value = cache
            .fetch(&key, || async move {
                let guard = mutating.begin_optimistic(MutationPlan::new("complete-task", target), complete);
                std::mem::forget(guard);
                Ok(json!({"status": "pending"}))
            })
            .await
            .unwrap();

        assert_eq!(value, json!({"status": "completed"}));
        assert_eq!(cache.get_data(&key), Some(json!({"status": "completed"})));
    }
}
