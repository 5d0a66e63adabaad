use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::auth_config::AuthenticationConfig;
use crate::token::{AccessToken, RefreshToken, TokenResponse, TokenResponseError, TokenType};

pub mod manager;
pub mod storage;

/// Current persisted schema. Version 1 sessions carry no `auth_info` and cannot be refreshed.
pub const SESSION_MODEL_VERSION: u32 = 2;
/// Lifetime assumed when a token response has no `expires_in` (RFC 6749 §5.1 makes it optional).
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

fn legacy_model_version() -> u32 {
    1
}

/// A previously obtained credential, keyed by the hash of the config that produced it.
///
/// Sessions are never mutated: a refresh or a new exchange produces a new value.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "legacy_model_version")]
    model_version: u32,
    config_hash: String,
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    token_type: TokenType,
    issued_at: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_info: Option<AuthenticationConfig>,
}

impl Session {
    pub fn new(
        config_hash: impl Into<String>,
        access_token: AccessToken,
        token_type: TokenType,
        issued_at: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            model_version: SESSION_MODEL_VERSION,
            config_hash: config_hash.into(),
            access_token,
            refresh_token: None,
            scope: None,
            token_type,
            issued_at,
            valid_until,
            auth_info: None,
        }
    }

    pub fn with_refresh_token(self, refresh_token: RefreshToken) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            ..self
        }
    }

    pub fn with_scope(self, scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..self
        }
    }

    pub fn with_auth_info(self, auth_info: AuthenticationConfig) -> Self {
        Self {
            auth_info: Some(auth_info),
            ..self
        }
    }

    /// Builds a session out of a token endpoint response obtained with `config`.
    ///
    /// `valid_until` is `now + expires_in`, or `now +` [`DEFAULT_TOKEN_LIFETIME`] when the server
    /// omits it. When the server omits the refresh token,
    /// `previous_refresh_token` is kept.
    pub fn from_token_response(
        response: TokenResponse,
        config: &AuthenticationConfig,
        previous_refresh_token: Option<RefreshToken>,
    ) -> Result<Self, TokenResponseError> {
        let token_type = response.token_type()?;
        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(TokenResponseError::MissingAccessToken)?;
        let expires_in = response
            .expires_in
            .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs);

        let time_delta = TimeDelta::from_std(expires_in)
            .map_err(|e| TokenResponseError::InvalidExpiration(e.to_string()))?;
        let issued_at = Utc::now();
        let valid_until = issued_at.checked_add_signed(time_delta).ok_or_else(|| {
            TokenResponseError::InvalidExpiration("expiration time out of range".to_string())
        })?;

        Ok(Self {
            model_version: SESSION_MODEL_VERSION,
            config_hash: config.config_hash(),
            access_token,
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .or(previous_refresh_token),
            scope: response.scope.or_else(|| {
                config
                    .field(crate::auth_config::AuthField::Scope)
                    .map(str::to_string)
            }),
            token_type,
            issued_at,
            valid_until,
            auth_info: Some(config.clone()),
        })
    }

    pub fn model_version(&self) -> u32 {
        self.model_version
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref().filter(|t| !t.is_empty())
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    pub fn auth_info(&self) -> Option<&AuthenticationConfig> {
        self.auth_info.as_ref()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.valid_until
    }

    /// Whether the persisted schema carries what a refresh needs.
    pub fn supports_refresh(&self) -> bool {
        self.model_version >= SESSION_MODEL_VERSION && self.auth_info.is_some()
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("model_version", &self.model_version)
            .field("config_hash", &self.config_hash)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("valid_until", &self.valid_until)
            .field("auth_info", &self.auth_info)
            .finish()
    }
}

/// Outcome of checking the cached session of a config.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Valid session for the current config.
    Ready(Session),
    /// Nothing cached.
    NeedsAuth,
    /// Expired session holding a refresh token.
    NeedsRefresh(Session),
    /// Expired session without a refresh token.
    NeedsReauth,
    /// The session was obtained with a different config.
    NeedsReauthConfigChanged,
}

impl SessionStatus {
    pub fn evaluate(session: Option<Session>, config_hash: &str) -> Self {
        match session {
            None => SessionStatus::NeedsAuth,
            Some(session) if session.config_hash() != config_hash => {
                SessionStatus::NeedsReauthConfigChanged
            }
            Some(session) if !session.is_expired() => SessionStatus::Ready(session),
            Some(session) if session.refresh_token().is_some() => {
                SessionStatus::NeedsRefresh(session)
            }
            Some(_) => SessionStatus::NeedsReauth,
        }
    }
}

/// Read-only projection of a [`SessionStatus`] for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Uninitialized,
    Ready,
    RefreshRequired,
    ReauthRequired,
}

impl From<&SessionStatus> for AuthState {
    fn from(status: &SessionStatus) -> Self {
        match status {
            SessionStatus::Ready(_) => AuthState::Ready,
            SessionStatus::NeedsAuth => AuthState::Uninitialized,
            SessionStatus::NeedsRefresh(_) => AuthState::RefreshRequired,
            SessionStatus::NeedsReauth | SessionStatus::NeedsReauthConfigChanged => {
                AuthState::ReauthRequired
            }
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::Uninitialized => "uninitialized",
            AuthState::Ready => "ready",
            AuthState::RefreshRequired => "refresh-required",
            AuthState::ReauthRequired => "reauth-required",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::auth_config::tests::client_credentials_config;

    /// A session for `config` that expires `valid_for` from now (negative means already expired).
    pub(crate) fn session_for(config: &AuthenticationConfig, valid_for: TimeDelta) -> Session {
        let now = Utc::now();
        Session::new(
            config.config_hash(),
            "cached-token".to_string(),
            TokenType::Bearer,
            now - TimeDelta::seconds(3600),
            now + valid_for,
        )
        .with_auth_info(config.clone())
    }

    #[test]
    fn from_token_response() {
        let config = client_credentials_config("https://x/auth/token");
        let response: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "T",
            "token_type": "bearer",
            "expires_in": 60,
        }))
        .unwrap();

        let session = Session::from_token_response(response, &config, None).unwrap();

        assert_eq!(session.access_token(), "T");
        assert_eq!(session.config_hash(), config.config_hash());
        assert_eq!(session.refresh_token(), None);
        let remaining = session.valid_until() - Utc::now();
        assert!(remaining <= TimeDelta::seconds(60) && remaining > TimeDelta::seconds(55));
        assert!(session.supports_refresh());
    }

    #[test]
    fn from_token_response_keeps_previous_refresh_token() {
        let config = client_credentials_config("https://x/auth/token");
        let response = TokenResponse {
            access_token: Some("T2".into()),
            expires_in: Some(10),
            ..Default::default()
        };

        let session =
            Session::from_token_response(response, &config, Some("R".to_string())).unwrap();

        assert_eq!(session.refresh_token().map(String::as_str), Some("R"));
    }

    #[test]
    fn missing_expiration_uses_the_default_lifetime() {
        let config = client_credentials_config("https://x/auth/token");
        let response = TokenResponse {
            access_token: Some("T".into()),
            ..Default::default()
        };

        let session = Session::from_token_response(response, &config, None).unwrap();

        let remaining = session.valid_until() - Utc::now();
        let lifetime = TimeDelta::from_std(DEFAULT_TOKEN_LIFETIME).unwrap();
        assert!(remaining <= lifetime && remaining > lifetime - TimeDelta::seconds(5));
    }

    #[test]
    fn missing_access_token_is_a_protocol_violation() {
        let config = client_credentials_config("https://x/auth/token");
        let response = TokenResponse {
            expires_in: Some(10),
            ..Default::default()
        };

        assert_matches!(
            Session::from_token_response(response, &config, None),
            Err(TokenResponseError::MissingAccessToken)
        );
    }

    #[test]
    fn out_of_range_expiration() {
        let config = client_credentials_config("https://x/auth/token");
        let response = TokenResponse {
            access_token: Some("T".into()),
            expires_in: Some(u64::MAX),
            ..Default::default()
        };

        assert_matches!(
            Session::from_token_response(response, &config, None),
            Err(TokenResponseError::InvalidExpiration(_))
        );
    }

    #[test]
    fn status_without_session() {
        assert_eq!(SessionStatus::evaluate(None, "hash"), SessionStatus::NeedsAuth);
    }

    #[test]
    fn status_of_valid_session() {
        let config = client_credentials_config("https://x/auth/token");
        let session = session_for(&config, TimeDelta::seconds(60));

        assert_eq!(
            SessionStatus::evaluate(Some(session.clone()), &config.config_hash()),
            SessionStatus::Ready(session)
        );
    }

    #[test]
    fn expired_session_with_refresh_token_needs_refresh() {
        let config = client_credentials_config("https://x/auth/token");
        // Even without auth_info, the refresh token alone decides the state.
        let session = Session::new(
            config.config_hash(),
            "T".to_string(),
            TokenType::Bearer,
            Utc::now() - TimeDelta::seconds(120),
            Utc::now() - TimeDelta::seconds(60),
        )
        .with_refresh_token("R".to_string());

        let status = SessionStatus::evaluate(Some(session), &config.config_hash());

        assert_matches!(status, SessionStatus::NeedsRefresh(_));
        assert_eq!(AuthState::from(&status), AuthState::RefreshRequired);
    }

    #[test]
    fn expired_session_without_refresh_token_needs_reauth() {
        let config = client_credentials_config("https://x/auth/token");
        let session = session_for(&config, TimeDelta::seconds(-1));

        let status = SessionStatus::evaluate(Some(session), &config.config_hash());

        assert_eq!(status, SessionStatus::NeedsReauth);
        assert_eq!(AuthState::from(&status), AuthState::ReauthRequired);
    }

    #[test]
    fn config_change_wins_over_validity() {
        let config = client_credentials_config("https://x/auth/token");
        let session = session_for(&config, TimeDelta::seconds(600))
            .with_refresh_token("R".to_string());
        let changed = config.with_scope("other");

        assert_eq!(
            SessionStatus::evaluate(Some(session), &changed.config_hash()),
            SessionStatus::NeedsReauthConfigChanged
        );
    }

    #[test]
    fn legacy_sessions_cannot_refresh() {
        let config = client_credentials_config("https://x/auth/token");
        let json = serde_json::json!({
            "config_hash": config.config_hash(),
            "access_token": "T",
            "refresh_token": "R",
            "token_type": "Bearer",
            "issued_at": "2024-01-01T00:00:00Z",
            "valid_until": "2024-01-01T01:00:00Z",
        });

        let session: Session = serde_json::from_value(json).unwrap();

        assert_eq!(session.model_version(), 1);
        assert!(!session.supports_refresh());
        assert!(session.is_expired());
    }

    #[test]
    fn authorization_header_value() {
        let config = client_credentials_config("https://x/auth/token");
        let session = session_for(&config, TimeDelta::seconds(60));

        assert_eq!(session.authorization(), "Bearer cached-token");
        assert!(!format!("{session:?}").contains("cached-token"));
    }
}
