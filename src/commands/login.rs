use tracing::debug;

use crate::authenticator::{AuthError, OAuth2Authenticator};
use crate::http_client::HttpClient;
use crate::session::storage::SessionStorage;
use crate::session::{AuthState, Session};
use crate::trace::Trace;

/// Makes sure every authenticator of an endpoint holds a usable session.
pub struct LoginCommand<'a, C, S> {
    authenticators: &'a [OAuth2Authenticator<C, S>],
}

impl<'a, C, S> LoginCommand<'a, C, S>
where
    C: HttpClient,
    S: SessionStorage,
{
    pub fn new(authenticators: &'a [OAuth2Authenticator<C, S>]) -> Self {
        Self { authenticators }
    }

    /// Authenticates every authenticator without a ready session, or all of them with `force`.
    ///
    /// Expired sessions are refreshed when possible, so interactive grants only prompt when
    /// the refresh token is unusable.
    pub fn login(&self, force: bool, trace: &Trace) -> Result<Vec<Session>, AuthError> {
        self.authenticators
            .iter()
            .map(|authenticator| {
                if force {
                    return authenticator.authenticate(trace);
                }
                match authenticator.get_state()? {
                    AuthState::Ready => {
                        debug!(config = ?authenticator.config(), "already logged in");
                        authenticator.require_session()
                    }
                    AuthState::RefreshRequired => match authenticator.refresh(trace) {
                        Err(AuthError::ReauthenticationRequired(_) | AuthError::NoRefreshToken) => {
                            authenticator.authenticate(trace)
                        }
                        other => other,
                    },
                    _ => authenticator.authenticate(trace),
                }
            })
            .collect()
    }
}
