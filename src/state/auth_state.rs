use crate::cache::{PersistedCache, QueryCache};
use crate::error::ApiError;
use crate::http::{ApiClient, ApiRequest};
use crate::redact::redact_secrets;
use crate::types::{LoginCredentials, LoginResponse, Session, User};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Observable session. Only `login`, `logout` and `check_auth` publish new values.
#[derive(Clone)]
pub struct AuthState {
    session: Arc<watch::Sender<Session>>,
    api: ApiClient,
    cache: QueryCache,
    persisted: Option<PersistedCache>,
}

impl AuthState {
    pub fn new(api: ApiClient, cache: QueryCache, persisted: Option<PersistedCache>) -> Self {
        let (tx, _rx) = watch::channel(Session::checking());
        Self {
            session: Arc::new(tx),
            api,
            cache,
            persisted,
        }
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    fn publish(&self, session: Session) {
        self.session.send_replace(session);
    }

    /// Leaves the session untouched on any failure.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<User, ApiError> {
        credentials.validate().map_err(ApiError::Validation)?;

        let request = ApiRequest::post(self.api.endpoints().login.clone()).json(json!({
            "email": credentials.email.trim(),
            "password": credentials.password,
        }));
        let response: LoginResponse = self.api.send_json(request).await?;

        if let Err(e) = self.api.tokens().set(&response.tokens).await {
            warn!(error = %e, "tokens could not be persisted; session is kept in memory only");
        }
        info!(user_id = %response.user.id, "signed in");
        self.publish(Session::authenticated(response.user.clone()));
        Ok(response.user)
    }

    /// Always ends unauthenticated, whatever the network does.
    pub async fn logout(&self) {
        self.publish(Session::unauthenticated());
        self.cache.cancel_all();
        self.cache.clear();

        let mut request = ApiRequest::post(self.api.endpoints().logout.clone());
        // Best-effort call: a 401 here must not start a refresh cycle.
        request.retried = true;
        if let Err(e) = self.api.send(request).await {
            warn!(error = %redact_secrets(&e.to_string()), "logout request failed; local session already cleared");
        }

        if let Err(e) = self.api.tokens().clear().await {
            warn!(error = %e, "failed to clear stored tokens on logout");
        }
        if let Some(persisted) = &self.persisted {
            if let Err(e) = persisted.clear().await {
                warn!(error = %e, "failed to clear persisted query cache on logout");
            }
        }
        info!("signed out");
    }

    pub async fn check_auth(&self) -> Session {
        if !self.api.tokens().has().await {
            self.publish(Session::unauthenticated());
            return self.session();
        }

        let request = ApiRequest::get(self.api.endpoints().me.clone());
        match self.api.send_json::<User>(request).await {
            Ok(user) => {
                info!(user_id = %user.id, "session restored");
                self.publish(Session::authenticated(user));
            }
            Err(e) => {
                warn!(error = %redact_secrets(&e.to_string()), "session check failed");
                if let Err(e) = self.api.tokens().clear().await {
                    warn!(error = %e, "failed to clear stored tokens after session check");
                }
                self.publish(Session::unauthenticated());
            }
        }
        self.session()
    }
}
