use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth_config::GrantType;
use crate::authenticator::{AuthError, OAuth2Authenticator};
use crate::http_client::HttpClient;
use crate::session::AuthState;
use crate::session::storage::SessionStorage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub grant_type: GrantType,
    pub resource_url: String,
    pub state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Reports the session state of every authenticator of an endpoint.
pub struct StatusCommand<'a, C, S> {
    authenticators: &'a [OAuth2Authenticator<C, S>],
}

impl<'a, C, S> StatusCommand<'a, C, S>
where
    C: HttpClient,
    S: SessionStorage,
{
    pub fn new(authenticators: &'a [OAuth2Authenticator<C, S>]) -> Self {
        Self { authenticators }
    }

    pub fn report(&self) -> Result<Vec<StatusReport>, AuthError> {
        self.authenticators
            .iter()
            .map(|authenticator| {
                let config = authenticator.config();
                Ok(StatusReport {
                    session_id: config.config_hash(),
                    grant_type: config.grant_type(),
                    resource_url: config.resource_url().to_string(),
                    state: authenticator.get_state()?,
                    valid_until: authenticator.session_info()?.map(|s| s.valid_until()),
                })
            })
            .collect()
    }
}
