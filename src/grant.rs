use base64::{Engine, engine::general_purpose};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Request, Response};
use serde::Deserialize;
use thiserror::Error;
use url::form_urlencoded;

use crate::auth_config::{AuthField, AuthenticationConfig, GrantType};
use crate::event::EventDispatcher;
use crate::http_client::{HttpClient, HttpClientError};
use crate::token::TokenResponse;
use crate::trace::Trace;

pub mod client_credentials;
pub mod device_code;
pub mod factory;
pub mod personal_access_token;

use client_credentials::ClientCredentialsAdapter;
use device_code::DeviceCodeFlowAdapter;
use personal_access_token::PersonalAccessTokenAdapter;

pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Error, Debug)]
pub enum GrantError {
    #[error("{adapter} cannot use this config, missing fields: {missing:?}")]
    IncompatibleConfig {
        adapter: &'static str,
        missing: Vec<AuthField>,
    },
    #[error("request to `{endpoint}` failed: {source}")]
    Transport {
        endpoint: String,
        source: HttpClientError,
    },
    #[error("`{endpoint}` responded {status}: {body}")]
    UnsuccessfulResponse {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from `{endpoint}`: {reason}")]
    Decode { endpoint: String, reason: String },
    #[error("building request: `{0}`")]
    RequestBuild(String),
    #[error("device code expired before the user completed the verification")]
    DeviceCodeExpired,
    #[error("device authorization rejected: {error}")]
    DeviceCodeRejected {
        error: String,
        description: Option<String>,
    },
    #[error("`{endpoint}` responded {status} instead of redirecting")]
    MissingRedirect { endpoint: String, status: u16 },
    #[error("redirect from `{endpoint}` has no `{name}` query parameter")]
    MissingQueryParameter { endpoint: String, name: String },
}

/// Everything a grant adapter needs to run a token exchange.
pub struct ExchangeContext<'a, C> {
    pub http_client: &'a C,
    pub config: &'a AuthenticationConfig,
    pub events: &'a EventDispatcher,
    pub trace: &'a Trace,
}

/// One OAuth2 grant strategy.
pub trait GrantAdapter {
    fn name(&self) -> &'static str;

    /// Grant type a config must declare for this adapter to use it.
    fn grant_type(&self) -> GrantType;

    /// Fields that must be set on a config for this adapter to use it.
    fn expected_fields(&self) -> &'static [AuthField];

    /// Expected fields the config lacks. A config declaring another grant type lacks
    /// [`AuthField::GrantType`].
    fn missing_fields(&self, config: &AuthenticationConfig) -> Vec<AuthField> {
        self.expected_fields()
            .iter()
            .filter(|field| match field {
                AuthField::GrantType => config.grant_type() != self.grant_type(),
                field => config.field(**field).is_none(),
            })
            .copied()
            .collect()
    }

    fn is_compatible_with(&self, config: &AuthenticationConfig) -> bool {
        self.missing_fields(config).is_empty()
    }

    fn check_config_readiness(&self, config: &AuthenticationConfig) -> Result<(), GrantError> {
        let missing = self.missing_fields(config);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GrantError::IncompatibleConfig {
                adapter: self.name(),
                missing,
            })
        }
    }

    /// Runs the grant against the network and returns the raw token payload.
    fn exchange_tokens<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<TokenResponse, GrantError>;
}

/// Enumerates all grant adapters for static dispatching reasons.
#[derive(Debug, Clone)]
pub enum GrantAdapterImpl {
    DeviceCode(DeviceCodeFlowAdapter),
    ClientCredentials(ClientCredentialsAdapter),
    PersonalAccessToken(PersonalAccessTokenAdapter),
}

impl GrantAdapter for GrantAdapterImpl {
    fn name(&self) -> &'static str {
        match self {
            Self::DeviceCode(adapter) => adapter.name(),
            Self::ClientCredentials(adapter) => adapter.name(),
            Self::PersonalAccessToken(adapter) => adapter.name(),
        }
    }

    fn grant_type(&self) -> GrantType {
        match self {
            Self::DeviceCode(adapter) => adapter.grant_type(),
            Self::ClientCredentials(adapter) => adapter.grant_type(),
            Self::PersonalAccessToken(adapter) => adapter.grant_type(),
        }
    }

    fn expected_fields(&self) -> &'static [AuthField] {
        match self {
            Self::DeviceCode(adapter) => adapter.expected_fields(),
            Self::ClientCredentials(adapter) => adapter.expected_fields(),
            Self::PersonalAccessToken(adapter) => adapter.expected_fields(),
        }
    }

    fn exchange_tokens<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<TokenResponse, GrantError> {
        match self {
            Self::DeviceCode(adapter) => adapter.exchange_tokens(ctx),
            Self::ClientCredentials(adapter) => adapter.exchange_tokens(ctx),
            Self::PersonalAccessToken(adapter) => adapter.exchange_tokens(ctx),
        }
    }
}

/// OAuth2 error payload (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorResponse {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

/// Builds a form-encoded POST to a token-like endpoint.
///
/// The client authenticates with HTTP Basic when the config has a secret, otherwise
/// `client_id` goes in the form.
pub(crate) fn form_post(
    endpoint: &str,
    params: &[(&str, &str)],
    config: &AuthenticationConfig,
    trace: &Trace,
) -> Result<Request<Vec<u8>>, GrantError> {
    let mut form = form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        form.append_pair(name, value);
    }

    let client_id = config.field(AuthField::ClientId);
    let basic = match (client_id, config.field(AuthField::ClientSecret)) {
        (Some(id), Some(secret)) => Some(basic_authorization(id, secret)?),
        (Some(id), None) => {
            form.append_pair("client_id", id);
            None
        }
        _ => None,
    };

    let mut builder = Request::post(endpoint)
        .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
        .header(ACCEPT, "application/json");
    if let Some(basic) = basic {
        builder = builder.header(AUTHORIZATION, basic);
    }
    let mut request = builder
        .body(form.finish().into_bytes())
        .map_err(|e| GrantError::RequestBuild(e.to_string()))?;
    trace.apply_headers(request.headers_mut());
    Ok(request)
}

fn basic_authorization(client_id: &str, client_secret: &str) -> Result<HeaderValue, GrantError> {
    let encoded = general_purpose::STANDARD.encode(format!("{client_id}:{client_secret}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|_| {
        GrantError::RequestBuild("invalid HTTP header value set for Authorization".to_string())
    })?;
    value.set_sensitive(true);
    Ok(value)
}

/// `resource` parameters, one per space-separated resource of the config.
pub(crate) fn resource_params(config: &AuthenticationConfig) -> Vec<(&'static str, &str)> {
    config.resources().map(|r| ("resource", r)).collect()
}

pub(crate) fn send<C: HttpClient>(
    http_client: &C,
    endpoint: &str,
    request: Request<Vec<u8>>,
) -> Result<Response<Vec<u8>>, GrantError> {
    http_client
        .send(request)
        .map_err(|source| GrantError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })
}

/// Fails on non-2xx responses, otherwise decodes the token payload.
pub(crate) fn decode_token_response(
    endpoint: &str,
    response: &Response<Vec<u8>>,
) -> Result<TokenResponse, GrantError> {
    if !response.status().is_success() {
        return Err(GrantError::UnsuccessfulResponse {
            endpoint: endpoint.to_string(),
            status: response.status().as_u16(),
            body: String::from_utf8_lossy(response.body()).to_string(),
        });
    }
    serde_json::from_slice(response.body()).map_err(|e| GrantError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// Looks up a required config field, reporting it as missing for `adapter` otherwise.
pub(crate) fn required<'a>(
    config: &'a AuthenticationConfig,
    adapter: &'static str,
    field: AuthField,
) -> Result<&'a str, GrantError> {
    config
        .field(field)
        .ok_or_else(|| GrantError::IncompatibleConfig {
            adapter,
            missing: vec![field],
        })
}
