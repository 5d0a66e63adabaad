use http::Response;
use thiserror::Error;
use url::Url;

use crate::authenticator::Authenticator;
use crate::http_client::HttpClient;
use crate::http_session::{HttpSession, HttpSessionError};
use crate::trace::Trace;

#[derive(Error, Debug)]
pub enum GetError {
    #[error("invalid url: `{0}`")]
    InvalidUrl(String),
    #[error("{0}")]
    Session(#[from] HttpSessionError),
}

/// Authenticated `GET` of a path relative to the endpoint url.
pub struct GetCommand<C, A> {
    base_url: String,
    session: HttpSession<C, A>,
}

impl<C, A> GetCommand<C, A>
where
    C: HttpClient,
    A: Authenticator,
{
    pub fn new(base_url: impl Into<String>, session: HttpSession<C, A>) -> Self {
        Self {
            base_url: base_url.into(),
            session,
        }
    }

    pub fn get(&self, path: &str, trace: &Trace) -> Result<Response<Vec<u8>>, GetError> {
        let url = Url::parse(&self.base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| GetError::InvalidUrl(e.to_string()))?;
        Ok(self.session.get(url.as_str(), trace)?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::authenticator::tests::MockAuthenticator;
    use crate::http_client::tests::{MockHttpClient, json_response};

    #[test]
    fn path_is_resolved_against_the_endpoint() {
        let mut http_client = MockHttpClient::new();
        http_client
            .expect_send()
            .once()
            .withf(|req| req.uri() == "https://x/api/v1/things")
            .returning(|_| Ok(json_response(200, serde_json::json!({}))));
        let session: HttpSession<_, MockAuthenticator> = HttpSession::new(http_client, Vec::new());

        let response = GetCommand::new("https://x/api/", session)
            .get("v1/things", &Trace::new())
            .unwrap();

        assert_eq!(response.status(), 200);
    }

    #[test]
    fn invalid_base_url() {
        let session: HttpSession<_, MockAuthenticator> =
            HttpSession::new(MockHttpClient::new(), Vec::new());

        assert_matches!(
            GetCommand::new("not a url", session).get("things", &Trace::new()),
            Err(GetError::InvalidUrl(_))
        );
    }
}
