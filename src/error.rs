use serde_json::Value;
use thiserror::Error;

pub const GENERIC_ERROR_MESSAGE: &str = "Unexpected server error. Please try again.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },
    #[error("{0}")]
    Validation(String),
    #[error("{message}")]
    Business { status: u16, message: String },
    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("secure storage error: {0}")]
    Storage(String),
    #[error("cache persistence error: {0}")]
    Persist(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { status, .. } | Self::Business { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Builds the error for a non-success response from its status and raw body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = extract_error_message(body);
        if status == 401 {
            Self::Unauthorized { status, message }
        } else {
            Self::Business { status, message }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        let msg = crate::redact::redact_secrets(&err.to_string()).into_owned();
        Self::Network(msg)
    }
}

impl From<keyring::Error> for ApiError {
    fn from(err: keyring::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Outcome shared by every waiter of a single refresh cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token is stored")]
    MissingRefreshToken,
    #[error("refresh token was rejected ({status})")]
    Rejected { status: u16 },
    #[error("refresh exchange failed: {0}")]
    Exchange(String),
    #[error("session ended while the refresh was in flight")]
    SessionEnded,
}

fn read_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

/// User-facing message from an error payload, or the generic fallback.
pub fn extract_error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return GENERIC_ERROR_MESSAGE.to_string();
    };
    let Some(obj) = json.as_object() else {
        return GENERIC_ERROR_MESSAGE.to_string();
    };
    ["message", "error"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(read_message))
        .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_message_prefers_message_field() {
        let body = r#"{"message":"Task already completed","error":"Conflict"}"#;
        assert_eq!(extract_error_message(body), "Task already completed");
    }

    #[test]
    fn extract_error_message_joins_validation_arrays() {
        let body = r#"{"message":["title is required","dueDate must be a date"]}"#;
        assert_eq!(
            extract_error_message(body),
            "title is required, dueDate must be a date"
        );
    }

    #[test]
    fn extract_error_message_falls_back_on_unparseable_payload() {
        assert_eq!(extract_error_message("<html>502</html>"), GENERIC_ERROR_MESSAGE);
        assert_eq!(extract_error_message(r#"{"message":""}"#), GENERIC_ERROR_MESSAGE);
        assert_eq!(extract_error_message("[1,2]"), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn from_response_maps_401_to_unauthorized() {
        assert!(ApiError::from_response(401, "{}").is_unauthorized());
        let err = ApiError::from_response(409, r#"{"error":"Duplicate property"}"#);
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.to_string(), "Duplicate property");
    }
}
