use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AccessToken = String;
pub type RefreshToken = String;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    Bearer,
}

impl TryFrom<&str> for TokenType {
    type Error = TokenResponseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("bearer") {
            Ok(TokenType::Bearer)
        } else {
            Err(TokenResponseError::InvalidTokenType(value.to_string()))
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Bearer => write!(f, "Bearer"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TokenResponseError {
    #[error("token response has no access_token")]
    MissingAccessToken,
    #[error("invalid token type: `{0}`")]
    InvalidTokenType(String),
    #[error("invalid token expiration: `{0}`")]
    InvalidExpiration(String),
}

/// Raw token payload returned by an OAuth2 token endpoint.
///
/// Every field is optional on the wire; [`crate::session::Session::from_token_response`] decides
/// which ones are mandatory.
#[derive(Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// The lifetime in seconds of the access token.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenResponse {
    /// The token type, `Bearer` when the server omits it.
    pub fn token_type(&self) -> Result<TokenType, TokenResponseError> {
        self.token_type
            .as_deref()
            .map_or(Ok(TokenType::Bearer), TokenType::try_from)
    }
}
