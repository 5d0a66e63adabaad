use crate::authenticator::{AuthError, Authenticator};

/// Revokes the sessions of every authenticator of an endpoint.
pub struct LogoutCommand<'a, A> {
    authenticators: &'a [A],
}

impl<'a, A> LogoutCommand<'a, A>
where
    A: Authenticator,
{
    pub fn new(authenticators: &'a [A]) -> Self {
        Self { authenticators }
    }

    /// Returns the ids of the revoked sessions.
    pub fn logout(&self) -> Result<Vec<String>, AuthError> {
        self.authenticators
            .iter()
            .map(|authenticator| {
                authenticator.revoke()?;
                Ok(authenticator.session_id().to_string())
            })
            .collect()
    }
}
