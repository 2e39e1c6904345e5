use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens must never end up in logs through a stray `{:?}`.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"REDACTED")
            .field("refresh_token", &"REDACTED")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Client,
    Contractor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: UserRole,
}

/// Process-wide view of who is signed in.
///
/// Always replaced as a whole; see [`crate::state::AuthState`] for the only
/// three transitions allowed to publish a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub is_loading: bool,
}

impl Session {
    pub fn checking() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: true,
        }
    }

    pub fn authenticated(user: User) -> Self {
        Self {
            user: Some(user),
            is_authenticated: true,
            is_loading: false,
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: false,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::checking()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Local checks that must pass before any network call is made.
    pub fn validate(&self) -> Result<(), String> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err("Email is required.".to_string());
        }
        let Some((local, domain)) = email.split_once('@') else {
            return Err("Email is not valid.".to_string());
        };
        if local.is_empty() || domain.is_empty() || !domain.contains('.') || domain.ends_with('.')
        {
            return Err("Email is not valid.".to_string());
        }
        if self.password.is_empty() {
            return Err("Password is required.".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"REDACTED")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: User,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Overdue,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Overdue => "overdue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "overdue" => Some(Self::Overdue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceTask {
    pub id: String,
    pub property_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub property_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub pending_tasks: u64,
    pub overdue_tasks: u64,
    pub completed_this_month: u64,
    pub properties: u64,
}
