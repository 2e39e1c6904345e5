use crate::config::{ClientConfig, Endpoints};
use crate::error::{ApiError, RefreshFailure};
use crate::redact::redact_secrets;
use crate::refresh::{is_auth_endpoint, should_attempt_refresh, RefreshCoordinator, TokenExchanger};
use crate::state::TokenStore;
use crate::types::TokenPair;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Describes one outbound call so it can be replayed after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub(crate) struct RawResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl RawResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn build_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers
}

fn bearer(access_token: &str) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {access_token}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}

const ENVELOPE_KEYS: [&str; 4] = ["data", "meta", "success", "message"];

/// Unwraps `{ "data": ... }` envelopes; any other shape passes through.
pub(crate) fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map)
            if map.contains_key("data") && map.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str())) =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub(crate) fn decode_body(body: &str) -> Result<Value, ApiError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let json: Value = serde_json::from_str(body)?;
    Ok(unwrap_envelope(json))
}

/// Base URL, default headers and timeout around a `reqwest::Client`.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    endpoints: Endpoints,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(build_headers(&config.user_agent))
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.parsed_base_url()?,
            endpoints: config.endpoints.clone(),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn url_for(&self, path: &str, query: &[(String, String)]) -> Result<Url, ApiError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Validation(format!("invalid request path '{path}': {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    pub(crate) async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<RawResponse, ApiError> {
        let url = self.url_for(&request.path, &request.query)?;
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(value) = access_token.and_then(bearer) {
            builder = builder.header(AUTHORIZATION, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder.send().await?;
        let status = res.status().as_u16();
        let body = res.text().await?;
        debug!(
            method = %request.method,
            path = %request.path,
            status,
            retried = request.retried,
            "api response"
        );
        Ok(RawResponse { status, body })
    }
}

#[async_trait]
impl TokenExchanger for HttpTransport {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        let request = ApiRequest::post(self.endpoints.refresh.clone())
            .json(json!({ "refreshToken": refresh_token }));
        let response = self
            .execute(&request, None)
            .await
            .map_err(|e| RefreshFailure::Exchange(redact_secrets(&e.to_string()).into_owned()))?;

        match response.status {
            200..=299 => {
                let value = decode_body(&response.body)
                    .map_err(|e| RefreshFailure::Exchange(e.to_string()))?;
                serde_json::from_value(value).map_err(|e| RefreshFailure::Exchange(e.to_string()))
            }
            status @ (400 | 401 | 403) => Err(RefreshFailure::Rejected { status }),
            status => Err(RefreshFailure::Exchange(format!(
                "refresh endpoint returned {status}"
            ))),
        }
    }
}

/// Authenticated client: attaches the access token and recovers from 401s
/// through the shared [`RefreshCoordinator`].
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<HttpTransport>,
    tokens: TokenStore,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, tokens: TokenStore) -> Result<Self, ApiError> {
        let transport = Arc::new(HttpTransport::new(config)?);
        let coordinator = RefreshCoordinator::new(tokens.clone(), transport.clone());
        Ok(Self {
            transport,
            tokens,
            coordinator,
        })
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn endpoints(&self) -> &Endpoints {
        self.transport.endpoints()
    }

    pub async fn send(&self, mut request: ApiRequest) -> Result<Value, ApiError> {
        let endpoints = self.transport.endpoints();
        let access_token = if is_auth_endpoint(endpoints, &request.path) {
            None
        } else {
            self.tokens.access_token().await?
        };

        let response = self.transport.execute(&request, access_token.as_deref()).await?;
        if response.is_success() {
            return decode_body(&response.body);
        }

        let original = ApiError::from_response(response.status, &response.body);
        if !should_attempt_refresh(endpoints, response.status, &request.path, request.retried) {
            return Err(original);
        }

        // A refresh that settled while this request was in flight already
        // produced a newer token; replay with it instead of starting a cycle.
        let current = self.tokens.access_token().await.ok().flatten();
        let outcome = match current {
            Some(token) if access_token.as_deref() != Some(token.as_str()) => Ok(token),
            _ => self.coordinator.refresh().await.map(|pair| pair.access_token),
        };

        match outcome {
            Ok(token) => {
                request.retried = true;
                let replay = self.transport.execute(&request, Some(&token)).await?;
                if replay.is_success() {
                    decode_body(&replay.body)
                } else {
                    Err(ApiError::from_response(replay.status, &replay.body))
                }
            }
            Err(failure) => {
                debug!(path = %request.path, error = %failure, "refresh failed; surfacing original 401");
                Err(original)
            }
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let value = self.send(request).await?;
        Ok(serde_json::from_value(value)?)
    }
}
