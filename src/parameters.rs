use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use thiserror::Error;

use crate::endpoint::{EndpointError, ServiceEndpoint};
use crate::grant::device_code::DeviceCodeFlowAdapter;
use crate::grant::factory::AdapterFactory;
use crate::http::config::{DEFAULT_HTTP_CONN_TIMEOUT, HttpConfig, ProxyConfig, ProxyError};
use crate::session::manager::{
    STATIC_SESSION_ENV_NAME, SessionManager, SessionManagerError, StaticSession,
};
use crate::session::storage::file::FileSessionStorage;

#[derive(Error, Debug)]
pub enum ParametersError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),
    #[error("{0}")]
    Proxy(#[from] ProxyError),
    #[error("{0}")]
    StaticSession(#[from] SessionManagerError),
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticates every credential of the endpoint that has no valid session.
    Login {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Authenticate even when a valid session exists
        #[arg(long)]
        force: bool,
    },
    /// Shows the session state of every credential of the endpoint.
    Status {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Select how the report is printed
        #[arg(long, default_value = "Plain")]
        output_format: OutputFormat,
    },
    /// Revokes the sessions of every credential of the endpoint.
    Logout {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Sends an authenticated GET and prints the response body.
    Get {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Path relative to the endpoint url
        path: String,
    },
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum OutputFormat {
    /// One line per credential
    #[value(name = "Plain")]
    Plain,
    /// Full report in json format
    #[value(name = "Json")]
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// JSON file describing the endpoint and its credentials
    #[arg(long, short)]
    pub endpoint_file: PathBuf,

    /// Directory holding the session files, the per-user data directory by default
    #[arg(long)]
    pub session_dir: Option<PathBuf>,

    /// Timeout in seconds of every HTTP request
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Proxy url. `HTTPS_PROXY` and `HTTP_PROXY` are used when empty
    #[arg(long, default_value = "")]
    pub proxy: String,

    /// Stop waiting for a device authorization after this many seconds
    #[arg(long)]
    pub device_code_timeout: Option<u64>,
}

impl EndpointArgs {
    pub fn endpoint(&self) -> Result<ServiceEndpoint, ParametersError> {
        Ok(ServiceEndpoint::from_file(&self.endpoint_file)?)
    }

    pub fn http_config(&self) -> Result<HttpConfig, ParametersError> {
        let proxy = ProxyConfig::new(self.proxy.clone(), PathBuf::default(), PathBuf::default())?
            .try_with_url_from_env()?;
        Ok(HttpConfig::new(
            Duration::from_secs(self.timeout),
            DEFAULT_HTTP_CONN_TIMEOUT,
            proxy,
        ))
    }

    /// Session manager over the session directory, serving the static session from the
    /// environment when one is set.
    pub fn session_manager(&self) -> Result<SessionManager<FileSessionStorage>, ParametersError> {
        let storage = self
            .session_dir
            .as_ref()
            .map_or_else(FileSessionStorage::new_default, |dir| FileSessionStorage::new(dir.clone()));
        let manager = SessionManager::new(storage);
        Ok(match StaticSession::from_env(STATIC_SESSION_ENV_NAME)? {
            Some(session) => manager.with_static_session(session),
            None => manager,
        })
    }

    pub fn adapter_factory(&self) -> AdapterFactory {
        let device_code = match self.device_code_timeout {
            Some(secs) => DeviceCodeFlowAdapter::new().with_expiry(Duration::from_secs(secs)),
            None => DeviceCodeFlowAdapter::new(),
        };
        AdapterFactory::new().with_device_code_adapter(device_code)
    }
}
