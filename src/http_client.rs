use std::sync::Arc;

use http::{Request, Response};

#[derive(thiserror::Error, Debug)]
pub enum HttpClientError {
    /// Represents an http transport crate error.
    #[error("HTTP Transport error: `{0}`")]
    TransportError(String),
    /// Represents an unexpected response.
    #[error("invalid http response: `{0}`")]
    InvalidResponse(String),
}

/// A synchronous trait that defines the internal methods for HTTP clients.
///
/// Implementations must return every response the server produced, including `3xx`, `4xx` and
/// `5xx` ones. Deciding what a status means is up to the caller.
pub trait HttpClient {
    /// A synchronous function sends a request. The method and url are defined inside the Request.
    fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpClientError>;
}

// A shared client is a client, so one transport can serve several authenticators and sessions.
impl<C> HttpClient for Arc<C>
where
    C: HttpClient + ?Sized,
{
    fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpClientError> {
        self.as_ref().send(req)
    }
}
