use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth_config::AuthenticationConfig;
use crate::authenticator::OAuth2Authenticator;
use crate::event::EventDispatcher;
use crate::http_client::HttpClient;
use crate::session::manager::SessionManager;
use crate::session::storage::SessionStorage;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("reading endpoint file `{path}`: {reason}")]
    Read { path: String, reason: String },
    #[error("invalid endpoint definition: {0}")]
    Invalid(String),
}

/// A remote API and the credentials that may call it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_authentications: Vec<AuthenticationConfig>,
}

impl ServiceEndpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            authentication: None,
            fallback_authentications: Vec::new(),
        }
    }

    pub fn with_authentication(self, authentication: AuthenticationConfig) -> Self {
        Self {
            authentication: Some(authentication),
            ..self
        }
    }

    pub fn with_fallback_authentication(mut self, authentication: AuthenticationConfig) -> Self {
        self.fallback_authentications.push(authentication);
        self
    }

    /// Loads a JSON endpoint definition.
    pub fn from_file(path: &Path) -> Result<Self, EndpointError> {
        let raw = fs::read_to_string(path).map_err(|e| EndpointError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| EndpointError::Invalid(e.to_string()))
    }

    /// The primary config followed by the fallbacks, in order.
    pub fn authentications(&self) -> impl Iterator<Item = &AuthenticationConfig> {
        self.authentication
            .iter()
            .chain(self.fallback_authentications.iter())
    }

    /// One authenticator per config, all sharing `session_manager` and `events`.
    pub fn authenticators<C, S>(
        &self,
        http_client: C,
        session_manager: Arc<SessionManager<S>>,
        events: &EventDispatcher,
    ) -> Vec<OAuth2Authenticator<C, S>>
    where
        C: HttpClient + Clone,
        S: SessionStorage,
    {
        self.authentications()
            .map(|config| {
                OAuth2Authenticator::new(
                    config.clone(),
                    http_client.clone(),
                    Arc::clone(&session_manager),
                )
                .with_events(events.clone())
            })
            .collect()
    }
}
