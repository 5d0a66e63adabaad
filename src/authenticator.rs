use std::sync::{Arc, Mutex};

use http::header::AUTHORIZATION;
use http::{HeaderValue, Request, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth_config::{AuthField, AuthenticationConfig};
use crate::event::{AuthEvent, EventDispatcher};
use crate::grant::factory::AdapterFactory;
use crate::grant::{ExchangeContext, GrantAdapter, GrantError, form_post, send};
use crate::http_client::HttpClient;
use crate::session::manager::{SessionGuard, SessionManager, SessionManagerError};
use crate::session::storage::SessionStorage;
use crate::session::{AuthState, Session, SessionStatus};
use crate::token::{TokenResponse, TokenResponseError};
use crate::trace::Trace;

/// Substring of a `400` refresh response meaning the refresh token itself expired.
const REFRESH_TOKEN_EXPIRED_MARKER: &str = "JWT expired";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("session refresh required")]
    RefreshRequired,
    #[error("reauthentication required: {0}")]
    ReauthenticationRequired(String),
    #[error("reauthentication required, the authentication config changed")]
    ReauthenticationRequiredDueToConfigChange,
    #[error("the session has no refresh token")]
    NoRefreshToken,
    #[error("unexpected response from `{endpoint}` ({status}, trace id {trace_id}): {message}")]
    InvalidState {
        message: String,
        endpoint: String,
        trace_id: String,
        status: u16,
    },
    #[error("misconfigured authentication: {0}")]
    Misconfiguration(String),
    #[error("token exchange failed: {0}")]
    Grant(#[from] GrantError),
    #[error("invalid token response: {0}")]
    Token(#[from] TokenResponseError),
    #[error("session manager: {0}")]
    SessionManager(#[from] SessionManagerError),
    #[error("building request: `{0}`")]
    RequestBuild(String),
    #[error("acquiring cached session lock")]
    PoisonError,
}

/// Maps a non-ready status to the error naming what it takes to get a session.
fn ready_session(status: SessionStatus) -> Result<Session, AuthError> {
    match status {
        SessionStatus::Ready(session) => Ok(session),
        SessionStatus::NeedsAuth => Err(AuthError::AuthenticationRequired),
        SessionStatus::NeedsRefresh(_) => Err(AuthError::RefreshRequired),
        SessionStatus::NeedsReauth => Err(AuthError::ReauthenticationRequired(
            "the session expired and cannot be refreshed".to_string(),
        )),
        SessionStatus::NeedsReauthConfigChanged => {
            Err(AuthError::ReauthenticationRequiredDueToConfigChange)
        }
    }
}

/// Attaches credentials to outgoing requests.
pub trait Authenticator {
    /// Key of the credential this authenticator manages.
    fn session_id(&self) -> &str;

    /// Makes sure a valid session exists, authenticating or refreshing as needed, and sets the
    /// `Authorization` header of `request`.
    fn before_request(&self, request: &mut Request<Vec<u8>>, trace: &Trace) -> Result<(), AuthError>;

    /// Forgets the current session. Revoking twice is not an error.
    fn revoke(&self) -> Result<(), AuthError>;
}

impl<A> Authenticator for Arc<A>
where
    A: Authenticator + ?Sized,
{
    fn session_id(&self) -> &str {
        self.as_ref().session_id()
    }

    fn before_request(&self, request: &mut Request<Vec<u8>>, trace: &Trace) -> Result<(), AuthError> {
        self.as_ref().before_request(request, trace)
    }

    fn revoke(&self) -> Result<(), AuthError> {
        self.as_ref().revoke()
    }
}

/// OAuth2 authenticator for one [`AuthenticationConfig`].
///
/// Sessions live in the shared [`SessionManager`] under the config hash, so authenticators
/// built from equal configs share their credential. The whole restore/authenticate/save
/// sequence of a request runs under the lock of that key: concurrent requests wait for the
/// first one to authenticate and reuse its session.
pub struct OAuth2Authenticator<C, S> {
    config: AuthenticationConfig,
    session_id: String,
    http_client: C,
    session_manager: Arc<SessionManager<S>>,
    adapters: AdapterFactory,
    events: EventDispatcher,
    cached: Mutex<Option<Session>>,
}

impl<C, S> OAuth2Authenticator<C, S>
where
    C: HttpClient,
    S: SessionStorage,
{
    pub fn new(
        config: AuthenticationConfig,
        http_client: C,
        session_manager: Arc<SessionManager<S>>,
    ) -> Self {
        Self {
            session_id: config.config_hash(),
            config,
            http_client,
            session_manager,
            adapters: AdapterFactory::default(),
            events: EventDispatcher::default(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_adapter_factory(self, adapters: AdapterFactory) -> Self {
        Self { adapters, ..self }
    }

    /// Publishes this authenticator's events on `events`, which may be shared.
    pub fn with_events(self, events: EventDispatcher) -> Self {
        Self { events, ..self }
    }

    pub fn config(&self) -> &AuthenticationConfig {
        &self.config
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Checks the stored session of this config.
    pub fn restore_session(&self) -> Result<SessionStatus, AuthError> {
        let guard = self.session_manager.lock(&self.session_id)?;
        self.restore_with(&guard)
    }

    /// The current session, or the error naming what it takes to get one.
    pub fn require_session(&self) -> Result<Session, AuthError> {
        ready_session(self.restore_session()?)
    }

    /// Runs the grant of this config and stores the resulting session.
    pub fn authenticate(&self, trace: &Trace) -> Result<Session, AuthError> {
        let guard = self.session_manager.lock(&self.session_id)?;
        self.authenticate_with(&guard, trace)
    }

    /// Trades the refresh token of the stored session for a new session.
    pub fn refresh(&self, trace: &Trace) -> Result<Session, AuthError> {
        let guard = self.session_manager.lock(&self.session_id)?;
        let session = guard.restore()?.ok_or(AuthError::AuthenticationRequired)?;
        self.refresh_with(&guard, session, trace)
    }

    pub fn get_state(&self) -> Result<AuthState, AuthError> {
        Ok(AuthState::from(&self.restore_session()?))
    }

    /// The stored session, whatever its state.
    pub fn session_info(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.session_manager.restore(&self.session_id)?)
    }

    fn restore_with(&self, guard: &SessionGuard<'_, S>) -> Result<SessionStatus, AuthError> {
        let status = SessionStatus::evaluate(guard.restore()?, &self.session_id);
        match &status {
            SessionStatus::Ready(session) => {
                self.cache(Some(session.clone()))?;
                debug!(session_id = %self.session_id, valid_until = %session.valid_until(), "session restored");
                self.events.dispatch(AuthEvent::SessionRestored {
                    session_id: self.session_id.clone(),
                });
            }
            other => {
                self.cache(None)?;
                let reason = AuthState::from(other).to_string();
                debug!(session_id = %self.session_id, %reason, "session not restored");
                self.events.dispatch(AuthEvent::SessionNotRestored {
                    session_id: self.session_id.clone(),
                    reason,
                });
            }
        }
        Ok(status)
    }

    fn authenticate_with(
        &self,
        guard: &SessionGuard<'_, S>,
        trace: &Trace,
    ) -> Result<Session, AuthError> {
        self.events.dispatch(AuthEvent::AuthenticationBefore {
            session_id: self.session_id.clone(),
        });

        let result = self.exchange(trace).and_then(|session| {
            guard.save(&session)?;
            self.cache(Some(session.clone()))?;
            Ok(session)
        });

        match &result {
            Ok(session) => {
                info!(session_id = %self.session_id, trace_id = trace.trace_id(), valid_until = %session.valid_until(), "authenticated");
                self.events.dispatch(AuthEvent::AuthenticationOk {
                    session_id: self.session_id.clone(),
                });
            }
            Err(err) => {
                warn!(session_id = %self.session_id, trace_id = trace.trace_id(), "authentication failed: {err}");
                self.events.dispatch(AuthEvent::AuthenticationFailure {
                    session_id: self.session_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        result
    }

    fn exchange(&self, trace: &Trace) -> Result<Session, AuthError> {
        let adapter = self.adapters.get_from(&self.config).ok_or_else(|| {
            AuthError::Misconfiguration(format!(
                "no grant adapter supports the `{}` config for `{}`",
                self.config.grant_type(),
                self.config.resource_url()
            ))
        })?;
        adapter.check_config_readiness(&self.config)?;

        let span = trace.create_span(adapter.name());
        let response = adapter.exchange_tokens(&ExchangeContext {
            http_client: &self.http_client,
            config: &self.config,
            events: &self.events,
            trace: &span,
        })?;
        Ok(Session::from_token_response(response, &self.config, None)?)
    }

    fn refresh_with(
        &self,
        guard: &SessionGuard<'_, S>,
        session: Session,
        trace: &Trace,
    ) -> Result<Session, AuthError> {
        self.events.dispatch(AuthEvent::RefreshBefore {
            session_id: self.session_id.clone(),
        });

        let result = self.exchange_refresh_token(&session, trace).and_then(|refreshed| {
            guard.save(&refreshed)?;
            self.cache(Some(refreshed.clone()))?;
            Ok(refreshed)
        });

        match &result {
            Ok(refreshed) => {
                info!(session_id = %self.session_id, valid_until = %refreshed.valid_until(), "session refreshed");
                self.events.dispatch(AuthEvent::RefreshOk {
                    session_id: self.session_id.clone(),
                });
            }
            Err(err) => {
                warn!(session_id = %self.session_id, trace_id = trace.trace_id(), "refresh failed: {err}");
                self.events.dispatch(AuthEvent::RefreshFailure {
                    session_id: self.session_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        result
    }

    /// Refreshes with the config recorded in the session, not the current one.
    fn exchange_refresh_token(&self, session: &Session, trace: &Trace) -> Result<Session, AuthError> {
        let refresh_token = session.refresh_token().ok_or(AuthError::NoRefreshToken)?;
        let auth_info = session
            .auth_info()
            .filter(|_| session.supports_refresh())
            .ok_or_else(|| {
                AuthError::ReauthenticationRequired(format!(
                    "sessions of model version {} cannot be refreshed",
                    session.model_version()
                ))
            })?;
        let endpoint = auth_info.field(AuthField::TokenEndpoint).ok_or_else(|| {
            AuthError::ReauthenticationRequired("the session has no token endpoint".to_string())
        })?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let span = trace.create_span("refresh");
        let request = form_post(endpoint, &params, auth_info, &span)?;
        let response = send(&self.http_client, endpoint, request)?;

        let status = response.status();
        let body = String::from_utf8_lossy(response.body());
        if status == StatusCode::BAD_REQUEST && body.contains(REFRESH_TOKEN_EXPIRED_MARKER) {
            return Err(AuthError::ReauthenticationRequired(
                "the refresh token expired".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(AuthError::InvalidState {
                message: body.to_string(),
                endpoint: endpoint.to_string(),
                trace_id: span.trace_id().to_string(),
                status: status.as_u16(),
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(response.body()).map_err(|e| GrantError::Decode {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Session::from_token_response(
            token,
            auth_info,
            Some(refresh_token.clone()),
        )?)
    }

    fn cache(&self, session: Option<Session>) -> Result<(), AuthError> {
        *self.cached.lock().map_err(|_| AuthError::PoisonError)? = session;
        Ok(())
    }

    fn cached_ready(&self) -> Result<Option<Session>, AuthError> {
        let cached = self.cached.lock().map_err(|_| AuthError::PoisonError)?;
        Ok(cached
            .as_ref()
            .filter(|s| !s.is_expired() && s.config_hash() == self.session_id)
            .cloned())
    }

    fn valid_session(&self, trace: &Trace) -> Result<Session, AuthError> {
        if let Some(session) = self.cached_ready()? {
            return Ok(session);
        }

        // One lock for the whole sequence, the guard methods must not lock again.
        let guard = self.session_manager.lock(&self.session_id)?;
        match self.restore_with(&guard)? {
            SessionStatus::Ready(session) => Ok(session),
            SessionStatus::NeedsRefresh(session) => {
                match self.refresh_with(&guard, session, trace) {
                    Err(AuthError::ReauthenticationRequired(reason)) => {
                        debug!(session_id = %self.session_id, %reason, "falling back to authentication");
                        self.authenticate_with(&guard, trace)
                    }
                    Err(AuthError::NoRefreshToken) => self.authenticate_with(&guard, trace),
                    other => other,
                }
            }
            SessionStatus::NeedsAuth
            | SessionStatus::NeedsReauth
            | SessionStatus::NeedsReauthConfigChanged => self.authenticate_with(&guard, trace),
        }
    }
}

impl<C, S> Authenticator for OAuth2Authenticator<C, S>
where
    C: HttpClient,
    S: SessionStorage,
{
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn before_request(&self, request: &mut Request<Vec<u8>>, trace: &Trace) -> Result<(), AuthError> {
        let session = self.valid_session(trace)?;

        let mut value = HeaderValue::from_str(&session.authorization()).map_err(|_| {
            AuthError::RequestBuild("invalid HTTP header value set for Authorization".to_string())
        })?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    fn revoke(&self) -> Result<(), AuthError> {
        self.session_manager.delete(&self.session_id)?;
        self.cache(None)?;
        info!(session_id = %self.session_id, "session revoked");
        self.events.dispatch(AuthEvent::SessionRevoked {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }
}
