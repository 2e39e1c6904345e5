use crate::cache::{MutationPlan, QueryCache, QueryKey};
use crate::error::ApiError;
use crate::http::{ApiClient, ApiRequest};
use crate::types::{DashboardStats, MaintenanceTask, TaskFilter, TaskStatus};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub mod keys {
    use super::*;

    /// List key with only the filter params that are set.
    pub fn tasks(filter: &TaskFilter) -> QueryKey {
        QueryKey::new("tasks")
            .param_opt("status", filter.status.map(|s| s.as_str()))
            .param_opt("propertyId", filter.property_id.as_deref())
    }

    /// Partial key covering every task list regardless of filter.
    pub fn all_tasks() -> QueryKey {
        QueryKey::new("tasks")
    }

    pub fn task(id: &str) -> QueryKey {
        QueryKey::new("task").param("id", id)
    }

    pub fn dashboard_stats() -> QueryKey {
        QueryKey::new("dashboard-stats")
    }
}

pub fn complete_task_plan(id: &str) -> MutationPlan {
    MutationPlan::new("complete-task", keys::task(id))
        .invalidates(keys::all_tasks())
        .invalidates(keys::dashboard_stats())
}

/// The unfiltered list receives the removal; filtered lists just go stale.
pub fn delete_task_plan() -> MutationPlan {
    MutationPlan::new("delete-task", keys::all_tasks())
        .invalidates(keys::all_tasks())
        .invalidates(keys::dashboard_stats())
}

fn task_path(id: &str) -> String {
    format!("/tasks/{}", urlencoding::encode(id))
}

fn mark_completed(current: Option<&Value>) -> Option<Value> {
    let mut task = current?.clone();
    let object = task.as_object_mut()?;
    object.insert("status".to_string(), json!(TaskStatus::Completed.as_str()));
    if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
        object.insert("completedAt".to_string(), json!(now));
    }
    Some(task)
}

fn without_task(current: Option<&Value>, id: &str) -> Option<Value> {
    let list = current?.as_array()?;
    let kept: Vec<Value> = list
        .iter()
        .filter(|task| task.get("id").and_then(Value::as_str) != Some(id))
        .cloned()
        .collect();
    (kept.len() != list.len()).then(|| Value::Array(kept))
}

/// Cached reads and optimistic writes for maintenance tasks.
#[derive(Clone)]
pub struct TasksApi {
    api: ApiClient,
    cache: QueryCache,
}

impl TasksApi {
    pub fn new(api: ApiClient, cache: QueryCache) -> Self {
        Self { api, cache }
    }

    pub async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<MaintenanceTask>, ApiError> {
        let key = keys::tasks(filter);
        let mut request = ApiRequest::get("/tasks");
        if let Some(status) = filter.status {
            request = request.query("status", status.as_str());
        }
        if let Some(property_id) = &filter.property_id {
            request = request.query("propertyId", property_id.clone());
        }
        self.cache
            .fetch_as(&key, || self.api.send(request))
            .await
    }

    pub async fn task(&self, id: &str) -> Result<MaintenanceTask, ApiError> {
        let request = ApiRequest::get(task_path(id));
        self.cache
            .fetch_as(&keys::task(id), || self.api.send(request))
            .await
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, ApiError> {
        let request = ApiRequest::get("/dashboard/stats");
        self.cache
            .fetch_as(&keys::dashboard_stats(), || self.api.send(request))
            .await
    }

    /// Shows the task as completed immediately, then reconciles with the server.
    pub async fn complete_task(&self, id: &str) -> Result<MaintenanceTask, ApiError> {
        let request = ApiRequest::post(format!("{}/complete", task_path(id)));
        let value = self
            .cache
            .run_optimistic(complete_task_plan(id), mark_completed, self.api.send(request))
            .await?;
        debug!(task = id, "task completed");
        if value.is_null() {
            return self.task(id).await;
        }
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
        let request = ApiRequest::delete(task_path(id));
        self.cache
            .run_optimistic(
                delete_task_plan(),
                |current| without_task(current, id),
                self.api.send(request),
            )
            .await?;
        self.cache.remove(&keys::task(id));
        debug!(task = id, "task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::state::TokenStore;
    use crate::types::TokenPair;
    use httpmock::prelude::*;
    use std::time::Duration;

    async fn tasks_api(server: &MockServer) -> TasksApi {
        let config = ClientConfig {
            base_url: server.base_url(),
            ..ClientConfig::default()
        };
        let tokens = TokenStore::in_memory();
        tokens.set(&TokenPair::new("access", "refresh")).await.unwrap();
        let api = ApiClient::new(&config, tokens).unwrap();
        TasksApi::new(api, QueryCache::new(Duration::from_secs(60)))
    }

    fn task_json(id: &str, status: &str) -> Value {
        json!({"id": id, "propertyId": "p1", "title": "Revisar matafuegos", "status": status})
    }

    #[test]
    fn task_keys_only_carry_set_filters() {
        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            property_id: None,
        };
        assert_eq!(keys::tasks(&filter), QueryKey::new("tasks").param("status", "pending"));
        assert_eq!(keys::tasks(&TaskFilter::default()), QueryKey::new("tasks"));
    }

    #[test]
    fn without_task_ignores_lists_missing_the_id() {
        let list = json!([{"id": "t1"}, {"id": "t2"}]);
        assert_eq!(without_task(Some(&list), "t1"), Some(json!([{"id": "t2"}])));
        assert_eq!(without_task(Some(&list), "t9"), None);
        assert_eq!(without_task(None, "t1"), None);
    }

    #[tokio::test]
    async fn task_lists_are_served_from_cache_while_fresh() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/tasks")
                    .query_param("status", "overdue")
                    .query_param("propertyId", "p1");
                then.status(200)
                    .json_body(json!({"data": [task_json("t1", "overdue")]}));
            })
            .await;

        let api = tasks_api(&server).await;
        let filter = TaskFilter {
            status: Some(TaskStatus::Overdue),
            property_id: Some("p1".to_string()),
        };
        let first = api.tasks(&filter).await.unwrap();
        let second = api.tasks(&filter).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].status, TaskStatus::Overdue);
        list.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn completing_a_task_invalidates_lists_and_stats() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1");
                then.status(200).json_body(task_json("t1", "pending"));
            })
            .await;
        let complete = server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t1/complete");
                then.status(200).json_body(json!({"data": task_json("t1", "completed")}));
            })
            .await;

        let api = tasks_api(&server).await;
        api.task("t1").await.unwrap();
        api.cache.set_data(&keys::all_tasks(), json!([task_json("t1", "pending")]));
        api.cache.set_data(&keys::dashboard_stats(), json!({"pendingTasks": 1}));

        let task = api.complete_task("t1").await.unwrap();

        complete.assert_async().await;
        assert_eq!(task.status, TaskStatus::Completed);
        let detail = api.cache.get(&keys::task("t1")).unwrap();
        assert_eq!(detail.data.as_ref().unwrap()["status"], json!("completed"));
        assert!(detail.invalidated);
        assert!(api.cache.get(&keys::all_tasks()).unwrap().invalidated);
        assert!(api.cache.get(&keys::dashboard_stats()).unwrap().invalidated);
    }

    #[tokio::test]
    async fn rejected_completion_rolls_back_the_detail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1");
                then.status(200).json_body(task_json("t1", "pending"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t1/complete");
                then.status(409).json_body(json!({"message": "Task already completed"}));
            })
            .await;

        let api = tasks_api(&server).await;
        api.task("t1").await.unwrap();
        let before = api.cache.get(&keys::task("t1"));

        let err = api.complete_task("t1").await.unwrap_err();

        assert_eq!(err.to_string(), "Task already completed");
        assert_eq!(api.cache.get(&keys::task("t1")), before);
    }

    #[tokio::test]
    async fn deleting_a_task_drops_it_from_the_list_and_detail() {
        let server = MockServer::start_async().await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/tasks/t1");
                then.status(204);
            })
            .await;

        let api = tasks_api(&server).await;
        api.cache.set_data(
            &keys::all_tasks(),
            json!([task_json("t1", "pending"), task_json("t2", "pending")]),
        );
        api.cache.set_data(&keys::task("t1"), task_json("t1", "pending"));

        api.delete_task("t1").await.unwrap();

        delete.assert_async().await;
        let list = api.cache.get(&keys::all_tasks()).unwrap();
        assert_eq!(list.data, Some(json!([task_json("t2", "pending")])));
        assert!(list.invalidated);
        assert!(api.cache.get(&keys::task("t1")).is_none());
    }

    #[tokio::test]
    async fn failed_delete_restores_the_list() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/tasks/t1");
                then.status(403).json_body(json!({"message": "Forbidden"}));
            })
            .await;

        let api = tasks_api(&server).await;
        let original = json!([task_json("t1", "pending")]);
        api.cache.set_data(&keys::all_tasks(), original.clone());

        assert!(api.delete_task("t1").await.is_err());
        assert_eq!(api.cache.get_data(&keys::all_tasks()), Some(original));
        assert!(api.cache.get(&keys::all_tasks()).unwrap().is_authoritative());
    }
}
