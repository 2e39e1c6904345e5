use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource name plus filter parameters, e.g. `tasks?status=pending`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub resource: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    /// True when `self` is `filter` or a more specific variant of it.
    pub fn matches(&self, filter: &QueryKey) -> bool {
        self.resource == filter.resource
            && filter
                .params
                .iter()
                .all(|(k, v)| self.params.get(k) == Some(v))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{}={}", urlencoding::encode(k), urlencoding::encode(v))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_orders_params() {
        let key = QueryKey::new("tasks")
            .param("status", "pending")
            .param("propertyId", "p 1");
        assert_eq!(key.to_string(), "tasks?propertyId=p%201&status=pending");
        assert_eq!(QueryKey::new("dashboard-stats").to_string(), "dashboard-stats");
    }

    #[test]
    fn partial_keys_match_more_specific_ones() {
        let all_tasks = QueryKey::new("tasks");
        let pending = QueryKey::new("tasks").param("status", "pending");

        assert!(pending.matches(&all_tasks));
        assert!(pending.matches(&pending));
        assert!(!all_tasks.matches(&pending));
        assert!(!QueryKey::new("task").param("id", "1").matches(&all_tasks));
    }
}
