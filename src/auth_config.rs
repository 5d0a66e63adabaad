use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// OAuth2 grant type declared by an [`AuthenticationConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantType {
    #[serde(rename = "client_credentials")]
    ClientCredentials,
    #[serde(rename = "urn:ietf:params:oauth:grant-type:device_code")]
    DeviceCode,
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::ClientCredentials => "client_credentials",
            GrantType::DeviceCode => "urn:ietf:params:oauth:grant-type:device_code",
            GrantType::AuthorizationCode => "authorization_code",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names every field of an [`AuthenticationConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthField {
    AuthorizationEndpoint,
    ClientId,
    ClientSecret,
    DeviceCodeEndpoint,
    GrantType,
    PersonalAccessEmail,
    PersonalAccessEndpoint,
    PersonalAccessToken,
    RedirectUrl,
    ResourceUrl,
    Scope,
    TokenEndpoint,
}

impl AuthField {
    pub const ALL: [AuthField; 12] = [
        AuthField::AuthorizationEndpoint,
        AuthField::ClientId,
        AuthField::ClientSecret,
        AuthField::DeviceCodeEndpoint,
        AuthField::GrantType,
        AuthField::PersonalAccessEmail,
        AuthField::PersonalAccessEndpoint,
        AuthField::PersonalAccessToken,
        AuthField::RedirectUrl,
        AuthField::ResourceUrl,
        AuthField::Scope,
        AuthField::TokenEndpoint,
    ];

    /// Serialized name of the field.
    pub fn name(&self) -> &'static str {
        match self {
            AuthField::AuthorizationEndpoint => "authorization_endpoint",
            AuthField::ClientId => "client_id",
            AuthField::ClientSecret => "client_secret",
            AuthField::DeviceCodeEndpoint => "device_code_endpoint",
            AuthField::GrantType => "grant_type",
            AuthField::PersonalAccessEmail => "personal_access_email",
            AuthField::PersonalAccessEndpoint => "personal_access_endpoint",
            AuthField::PersonalAccessToken => "personal_access_token",
            AuthField::RedirectUrl => "redirect_url",
            AuthField::ResourceUrl => "resource_url",
            AuthField::Scope => "scope",
            AuthField::TokenEndpoint => "token_endpoint",
        }
    }
}

impl fmt::Display for AuthField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One OAuth2 credential.
///
/// The value is immutable: the `with_*` methods consume it and return a new config, so a
/// changed field always yields a new [`AuthenticationConfig::config_hash`]. Two configs with
/// the same non-empty fields have the same hash and therefore share one cached session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    grant_type: GrantType,
    /// One or more space-separated resource URIs.
    resource_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_code_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    personal_access_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    personal_access_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    personal_access_token: Option<String>,
}

impl AuthenticationConfig {
    pub fn new(grant_type: GrantType, resource_url: impl Into<String>) -> Self {
        Self {
            grant_type,
            resource_url: resource_url.into(),
            scope: None,
            client_id: None,
            client_secret: None,
            token_endpoint: None,
            device_code_endpoint: None,
            authorization_endpoint: None,
            redirect_url: None,
            personal_access_endpoint: None,
            personal_access_email: None,
            personal_access_token: None,
        }
    }

    pub fn with_scope(self, scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..self
        }
    }

    pub fn with_client(self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            ..self
        }
    }

    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..self
        }
    }

    pub fn with_token_endpoint(self, token_endpoint: impl Into<String>) -> Self {
        Self {
            token_endpoint: Some(token_endpoint.into()),
            ..self
        }
    }

    pub fn with_device_code_endpoint(self, device_code_endpoint: impl Into<String>) -> Self {
        Self {
            device_code_endpoint: Some(device_code_endpoint.into()),
            ..self
        }
    }

    pub fn with_authorization_endpoint(self, authorization_endpoint: impl Into<String>) -> Self {
        Self {
            authorization_endpoint: Some(authorization_endpoint.into()),
            ..self
        }
    }

    pub fn with_redirect_url(self, redirect_url: impl Into<String>) -> Self {
        Self {
            redirect_url: Some(redirect_url.into()),
            ..self
        }
    }

    pub fn with_personal_access(
        self,
        endpoint: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            personal_access_endpoint: Some(endpoint.into()),
            personal_access_email: Some(email.into()),
            personal_access_token: Some(token.into()),
            ..self
        }
    }

    pub fn grant_type(&self) -> GrantType {
        self.grant_type
    }

    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }

    /// Each resource of the space-separated `resource_url`.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.resource_url.split_whitespace()
    }

    /// Returns the value of `field`, treating empty strings as unset.
    pub fn field(&self, field: AuthField) -> Option<&str> {
        let value = match field {
            AuthField::GrantType => Some(self.grant_type.as_str()),
            AuthField::ResourceUrl => Some(self.resource_url.as_str()),
            AuthField::Scope => self.scope.as_deref(),
            AuthField::ClientId => self.client_id.as_deref(),
            AuthField::ClientSecret => self.client_secret.as_deref(),
            AuthField::TokenEndpoint => self.token_endpoint.as_deref(),
            AuthField::DeviceCodeEndpoint => self.device_code_endpoint.as_deref(),
            AuthField::AuthorizationEndpoint => self.authorization_endpoint.as_deref(),
            AuthField::RedirectUrl => self.redirect_url.as_deref(),
            AuthField::PersonalAccessEndpoint => self.personal_access_endpoint.as_deref(),
            AuthField::PersonalAccessEmail => self.personal_access_email.as_deref(),
            AuthField::PersonalAccessToken => self.personal_access_token.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Content hash of the normalized field set: SHA-256 over the JSON object of every set
    /// field, keys sorted, as lowercase hex.
    pub fn config_hash(&self) -> String {
        let normalized: Map<String, Value> = AuthField::ALL
            .iter()
            .filter_map(|f| {
                self.field(*f)
                    .map(|v| (f.name().to_string(), Value::String(v.to_string())))
            })
            .collect();

        let digest = Sha256::digest(Value::Object(normalized).to_string().as_bytes());
        format!("{digest:x}")
    }
}

impl fmt::Debug for AuthenticationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthenticationConfig")
            .field("grant_type", &self.grant_type)
            .field("resource_url", &self.resource_url)
            .field("scope", &self.scope)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("token_endpoint", &self.token_endpoint)
            .field("device_code_endpoint", &self.device_code_endpoint)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("redirect_url", &self.redirect_url)
            .field("personal_access_endpoint", &self.personal_access_endpoint)
            .field("personal_access_email", &self.personal_access_email)
            .field("personal_access_token", &redacted(&self.personal_access_token))
            .finish()
    }
}
