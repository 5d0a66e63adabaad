use std::fmt;

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::authenticator::{AuthError, Authenticator};
use crate::grant::FORM_CONTENT_TYPE;
use crate::http_client::{HttpClient, HttpClientError};
use crate::trace::Trace;

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// One `401` answered while trying to get through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Session id of the authenticator whose credential was rejected.
    pub authenticator: String,
    pub status: u16,
    pub trace_id: String,
}

impl fmt::Display for RetryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rejected with {} (trace id {})",
            self.authenticator, self.status, self.trace_id
        )
    }
}

#[derive(Error, Debug)]
pub enum HttpSessionError {
    #[error("authenticating request: {0}")]
    Auth(#[from] AuthError),
    #[error("request to `{url}` failed: {source}")]
    Transport {
        url: String,
        source: HttpClientError,
    },
    #[error("`{url}` responded {status} (trace id {trace_id}): {body}")]
    ClientError {
        status: u16,
        url: String,
        body: String,
        trace_id: String,
    },
    #[error("`{url}` failed with {status} (trace id {trace_id}): {body}")]
    ServerError {
        status: u16,
        url: String,
        body: String,
        trace_id: String,
    },
    #[error("every authenticator was rejected by `{url}` after {} attempts", .history.len())]
    AuthenticationFailed { url: String, history: Vec<RetryEntry> },
    #[error("invalid retry state: {0}")]
    InvalidState(String),
    #[error("building request: `{0}`")]
    RequestBuild(String),
}

/// Where the retry protocol stands for the current call.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    authenticator_index: usize,
    retry_with_reauthentication: bool,
    retry_with_next_authenticator: bool,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            authenticator_index: 0,
            retry_with_reauthentication: true,
            retry_with_next_authenticator: false,
        }
    }
}

impl RetryState {
    /// State after a `401` answered the current authenticator.
    fn after_unauthorized(self) -> Result<Self, HttpSessionError> {
        if self.retry_with_reauthentication {
            // Same credential once more, its session was just revoked.
            Ok(Self {
                retry_with_reauthentication: false,
                retry_with_next_authenticator: true,
                ..self
            })
        } else if self.retry_with_next_authenticator {
            Ok(Self {
                authenticator_index: self.authenticator_index + 1,
                ..Self::default()
            })
        } else {
            Err(HttpSessionError::InvalidState(format!(
                "no retry left for authenticator {}",
                self.authenticator_index
            )))
        }
    }
}

/// Sends requests to an endpoint, attaching credentials from an ordered list of authenticators.
///
/// A `401` revokes the current authenticator's session and retries once with a fresh
/// authentication, then moves on to the next authenticator. When every authenticator was
/// rejected the call fails with [`HttpSessionError::AuthenticationFailed`].
pub struct HttpSession<C, A> {
    http_client: C,
    authenticators: Vec<A>,
    enable_auth: bool,
    suppress_errors: bool,
}

impl<C, A> HttpSession<C, A>
where
    C: HttpClient,
    A: Authenticator,
{
    pub fn new(http_client: C, authenticators: Vec<A>) -> Self {
        Self {
            http_client,
            authenticators,
            enable_auth: true,
            suppress_errors: false,
        }
    }

    /// Sends requests without credentials.
    pub fn with_auth_enabled(self, enable_auth: bool) -> Self {
        Self {
            enable_auth,
            ..self
        }
    }

    /// Returns non-2xx responses instead of failing.
    pub fn with_suppressed_errors(self, suppress_errors: bool) -> Self {
        Self {
            suppress_errors,
            ..self
        }
    }

    pub fn authenticators(&self) -> &[A] {
        &self.authenticators
    }

    pub fn submit(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
        trace: &Trace,
    ) -> Result<Response<Vec<u8>>, HttpSessionError> {
        let mut state = RetryState::default();
        let mut history = Vec::new();

        loop {
            let authenticator = self.authenticator_for(&state, url, &history)?;
            let span = trace.create_span("http-session");

            let mut request = Request::builder()
                .method(method.clone())
                .uri(url)
                .body(body.to_vec())
                .map_err(|e| HttpSessionError::RequestBuild(e.to_string()))?;
            request.headers_mut().extend(headers.clone());
            span.apply_headers(request.headers_mut());
            if let Some(authenticator) = authenticator {
                authenticator.before_request(&mut request, &span)?;
            }

            debug!(%method, url, trace_id = span.trace_id(), attempt = history.len() + 1, "sending request");
            let response = self
                .http_client
                .send(request)
                .map_err(|source| HttpSessionError::Transport {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            if status.is_success() || self.suppress_errors {
                return Ok(response);
            }

            match authenticator {
                Some(authenticator) if status == StatusCode::UNAUTHORIZED => {
                    warn!(url, session_id = authenticator.session_id(), trace_id = span.trace_id(), "request unauthorized, revoking session");
                    authenticator.revoke()?;
                    history.push(RetryEntry {
                        authenticator: authenticator.session_id().to_string(),
                        status: status.as_u16(),
                        trace_id: span.trace_id().to_string(),
                    });
                    state = state.after_unauthorized()?;
                }
                _ => return Err(status_error(url, &response, &span)),
            }
        }
    }

    pub fn get(&self, url: &str, trace: &Trace) -> Result<Response<Vec<u8>>, HttpSessionError> {
        self.submit(Method::GET, url, &HeaderMap::new(), &[], trace)
    }

    pub fn delete(&self, url: &str, trace: &Trace) -> Result<Response<Vec<u8>>, HttpSessionError> {
        self.submit(Method::DELETE, url, &HeaderMap::new(), &[], trace)
    }

    pub fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
        trace: &Trace,
    ) -> Result<Response<Vec<u8>>, HttpSessionError> {
        let headers = content_type_header(content_type)?;
        self.submit(Method::POST, url, &headers, body, trace)
    }

    pub fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
        trace: &Trace,
    ) -> Result<Response<Vec<u8>>, HttpSessionError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        self.post(url, FORM_CONTENT_TYPE, body.as_bytes(), trace)
    }

    pub fn post_json<T: Serialize>(
        &self,
        url: &str,
        payload: &T,
        trace: &Trace,
    ) -> Result<Response<Vec<u8>>, HttpSessionError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| HttpSessionError::RequestBuild(e.to_string()))?;
        self.post(url, JSON_CONTENT_TYPE, &body, trace)
    }

    /// Sends `patch` (a JSON Patch document) with `PATCH`.
    pub fn json_patch<T: Serialize>(
        &self,
        url: &str,
        patch: &T,
        trace: &Trace,
    ) -> Result<Response<Vec<u8>>, HttpSessionError> {
        let body =
            serde_json::to_vec(patch).map_err(|e| HttpSessionError::RequestBuild(e.to_string()))?;
        let headers = content_type_header(JSON_PATCH_CONTENT_TYPE)?;
        self.submit(Method::PATCH, url, &headers, &body, trace)
    }

    fn authenticator_for(
        &self,
        state: &RetryState,
        url: &str,
        history: &[RetryEntry],
    ) -> Result<Option<&A>, HttpSessionError> {
        if !self.enable_auth || self.authenticators.is_empty() {
            return Ok(None);
        }
        self.authenticators
            .get(state.authenticator_index)
            .map(Some)
            .ok_or_else(|| HttpSessionError::AuthenticationFailed {
                url: url.to_string(),
                history: history.to_vec(),
            })
    }
}

fn content_type_header(content_type: &str) -> Result<HeaderMap, HttpSessionError> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(content_type)
        .map_err(|e| HttpSessionError::RequestBuild(e.to_string()))?;
    headers.insert(CONTENT_TYPE, value);
    Ok(headers)
}

/// Client error below `500`, server error otherwise.
fn status_error(url: &str, response: &Response<Vec<u8>>, trace: &Trace) -> HttpSessionError {
    let status = response.status().as_u16();
    let url = url.to_string();
    let body = String::from_utf8_lossy(response.body()).to_string();
    let trace_id = trace.trace_id().to_string();
    if response.status().is_server_error() {
        HttpSessionError::ServerError {
            status,
            url,
            body,
            trace_id,
        }
    } else {
        HttpSessionError::ClientError {
            status,
            url,
            body,
            trace_id,
        }
    }
}
