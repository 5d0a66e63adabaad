use tracing::debug;

use super::{
    ExchangeContext, GrantAdapter, GrantError, decode_token_response, form_post, required,
    resource_params, send,
};
use crate::auth_config::{AuthField, GrantType};
use crate::http_client::HttpClient;
use crate::token::TokenResponse;

const NAME: &str = "client-credentials";

/// Single POST to the token endpoint with `grant_type=client_credentials`.
#[derive(Debug, Clone, Default)]
pub struct ClientCredentialsAdapter;

impl GrantAdapter for ClientCredentialsAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn grant_type(&self) -> GrantType {
        GrantType::ClientCredentials
    }

    fn expected_fields(&self) -> &'static [AuthField] {
        &[
            AuthField::ClientId,
            AuthField::ClientSecret,
            AuthField::GrantType,
            AuthField::ResourceUrl,
            AuthField::TokenEndpoint,
        ]
    }

    fn exchange_tokens<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<TokenResponse, GrantError> {
        let token_endpoint = required(ctx.config, NAME, AuthField::TokenEndpoint)?;

        let mut params = vec![("grant_type", GrantType::ClientCredentials.as_str())];
        params.extend(resource_params(ctx.config));
        if let Some(scope) = ctx.config.field(AuthField::Scope) {
            params.push(("scope", scope));
        }

        debug!(trace_id = ctx.trace.trace_id(), endpoint = token_endpoint, "requesting client credentials token");
        let request = form_post(token_endpoint, &params, ctx.config, ctx.trace)?;
        let response = send(ctx.http_client, token_endpoint, request)?;

        decode_token_response(token_endpoint, &response)
    }
}
