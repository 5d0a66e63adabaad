use http::Uri;
use std::env;
use std::env::VarError;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for a whole request, including the body.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for establishing the connection.
pub const DEFAULT_HTTP_CONN_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_PROXY_ENV_NAME: &str = "HTTP_PROXY";
const HTTPS_PROXY_ENV_NAME: &str = "HTTPS_PROXY";

/// Transport settings used to build [`crate::http::client::HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub(crate) timeout: Duration,
    pub(crate) conn_timeout: Duration,
    pub(crate) proxy: ProxyConfig,
}

impl HttpConfig {
    pub fn new(timeout: Duration, conn_timeout: Duration, proxy: ProxyConfig) -> Self {
        Self {
            timeout,
            conn_timeout,
            proxy,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_HTTP_TIMEOUT,
            DEFAULT_HTTP_CONN_TIMEOUT,
            ProxyConfig::default(),
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("invalid proxy url `{0}`: `{1}`")]
    InvalidUrl(String, String),
}

/// A possibly empty proxy url. Non-empty values are validated as URIs.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct ProxyUrl(Option<Uri>);

impl TryFrom<&str> for ProxyUrl {
    type Error = ProxyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Ok(Self(None));
        }
        let uri = s
            .parse::<Uri>()
            .map_err(|err| ProxyError::InvalidUrl(s.to_string(), err.to_string()))?;
        if uri.host().is_none() {
            return Err(ProxyError::InvalidUrl(
                s.to_string(),
                "missing host".to_string(),
            ));
        }
        Ok(Self(Some(uri)))
    }
}

impl Display for ProxyUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(url) => write!(f, "{url}"),
            None => write!(f, ""),
        }
    }
}

impl ProxyUrl {
    fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Proxy used by the outbound HTTP client.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ProxyConfig {
    /// `<protocol>://<user>:<password>@<host>:<port>`, everything but the host is optional.
    url: ProxyUrl,
    /// Directory whose `.pem` files are trusted as proxy CA certificates.
    ca_bundle_dir: PathBuf,
    /// Single PEM file trusted as a proxy CA certificate.
    ca_bundle_file: PathBuf,
}

impl ProxyConfig {
    pub fn new(
        proxy_url: String,
        ca_bundle_dir: PathBuf,
        ca_bundle_file: PathBuf,
    ) -> Result<Self, ProxyError> {
        let url = ProxyUrl::try_from(proxy_url.as_str())?;
        Ok(Self {
            url,
            ca_bundle_dir,
            ca_bundle_file,
        })
    }

    pub fn ca_bundle_dir(&self) -> &Path {
        self.ca_bundle_dir.as_path()
    }

    pub fn ca_bundle_file(&self) -> &Path {
        self.ca_bundle_file.as_path()
    }

    pub fn url_as_string(&self) -> String {
        self.url.to_string()
    }

    /// Fills an empty url from `HTTPS_PROXY`, then `HTTP_PROXY`.
    pub fn try_with_url_from_env(self) -> Result<Self, ProxyError> {
        self.with_env_aware_url(env::var)
    }

    fn with_env_aware_url<F>(self, env_var: F) -> Result<Self, ProxyError>
    where
        F: Fn(&'static str) -> Result<String, VarError>,
    {
        if !self.url.is_empty() {
            return Ok(self);
        }
        let url = env_var(HTTPS_PROXY_ENV_NAME)
            .or_else(|_| env_var(HTTP_PROXY_ENV_NAME))
            .unwrap_or_default()
            .as_str()
            .try_into()?;
        Ok(ProxyConfig { url, ..self })
    }
}
