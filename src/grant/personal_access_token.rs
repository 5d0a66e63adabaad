use http::header::{COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Request, Response};
use tracing::debug;
use url::Url;

use super::{
    ExchangeContext, GrantAdapter, GrantError, FORM_CONTENT_TYPE, decode_token_response,
    form_post, required, send,
};
use crate::auth_config::{AuthField, GrantType};
use crate::http_client::HttpClient;
use crate::token::TokenResponse;

const NAME: &str = "personal-access-token";
const CODE_PARAM: &str = "code";

/// Deprecated browser-emulation flow trading a personal access token for an authorization code.
///
/// Every hop but the last must answer with a redirect; the session cookie set by the login hop
/// is replayed on the following ones.
#[derive(Debug, Clone, Default)]
pub struct PersonalAccessTokenAdapter;

impl PersonalAccessTokenAdapter {
    fn login<C: HttpClient>(&self, ctx: &ExchangeContext<'_, C>) -> Result<String, GrantError> {
        let endpoint = required(ctx.config, NAME, AuthField::PersonalAccessEndpoint)?;
        let url = with_query(
            endpoint,
            &[
                ("token", required(ctx.config, NAME, AuthField::PersonalAccessToken)?),
                ("email", required(ctx.config, NAME, AuthField::PersonalAccessEmail)?),
            ],
        )?;

        let response = self.get(ctx, &url, None)?;
        expect_redirect(endpoint, &response)?;
        Ok(cookies_of(response.headers()))
    }

    /// Asks for an authorization code. Returns the code, or the URL of the consent form when
    /// the user still has to allow the client.
    fn authorize<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        cookie: &str,
    ) -> Result<Result<String, Url>, GrantError> {
        let endpoint = required(ctx.config, NAME, AuthField::AuthorizationEndpoint)?;
        let mut params = vec![
            ("response_type", CODE_PARAM),
            ("client_id", required(ctx.config, NAME, AuthField::ClientId)?),
            ("redirect_uri", required(ctx.config, NAME, AuthField::RedirectUrl)?),
        ];
        params.extend(ctx.config.resources().map(|r| ("resource", r)));
        if let Some(scope) = ctx.config.field(AuthField::Scope) {
            params.push(("scope", scope));
        }
        let url = with_query(endpoint, &params)?;

        let response = self.get(ctx, &url, Some(cookie))?;
        let location = expect_redirect(endpoint, &response)?;
        let location = url.join(location).map_err(|e| GrantError::Decode {
            endpoint: endpoint.to_string(),
            reason: format!("invalid redirect location: {e}"),
        })?;

        Ok(query_value(&location, CODE_PARAM).ok_or(location))
    }

    fn confirm_access<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        consent_url: &Url,
        cookie: &str,
    ) -> Result<String, GrantError> {
        let endpoint = consent_url.as_str();
        let mut builder = Request::post(endpoint).header(http::header::CONTENT_TYPE, FORM_CONTENT_TYPE);
        if !cookie.is_empty() {
            builder = builder.header(COOKIE, cookie);
        }
        let mut request = builder
            .body(b"decision=allow".to_vec())
            .map_err(|e| GrantError::RequestBuild(e.to_string()))?;
        ctx.trace.apply_headers(request.headers_mut());

        let response = send(ctx.http_client, endpoint, request)?;
        let location = expect_redirect(endpoint, &response)?;
        let location = consent_url.join(location).map_err(|e| GrantError::Decode {
            endpoint: endpoint.to_string(),
            reason: format!("invalid redirect location: {e}"),
        })?;

        query_value(&location, CODE_PARAM).ok_or_else(|| GrantError::MissingQueryParameter {
            endpoint: endpoint.to_string(),
            name: CODE_PARAM.to_string(),
        })
    }

    fn redeem_code<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        code: &str,
    ) -> Result<TokenResponse, GrantError> {
        let token_endpoint = required(ctx.config, NAME, AuthField::TokenEndpoint)?;
        let params = [
            ("grant_type", GrantType::AuthorizationCode.as_str()),
            ("code", code),
            ("redirect_uri", required(ctx.config, NAME, AuthField::RedirectUrl)?),
        ];
        let request = form_post(token_endpoint, &params, ctx.config, ctx.trace)?;
        let response = send(ctx.http_client, token_endpoint, request)?;
        decode_token_response(token_endpoint, &response)
    }

    fn get<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        url: &Url,
        cookie: Option<&str>,
    ) -> Result<Response<Vec<u8>>, GrantError> {
        let mut builder = Request::get(url.as_str());
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            builder = builder.header(COOKIE, cookie);
        }
        let mut request = builder
            .body(Vec::new())
            .map_err(|e| GrantError::RequestBuild(e.to_string()))?;
        ctx.trace.apply_headers(request.headers_mut());

        let mut endpoint = url.clone();
        endpoint.set_query(None);
        send(ctx.http_client, endpoint.as_str(), request)
    }
}

impl GrantAdapter for PersonalAccessTokenAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn grant_type(&self) -> GrantType {
        GrantType::AuthorizationCode
    }

    fn expected_fields(&self) -> &'static [AuthField] {
        &[
            AuthField::AuthorizationEndpoint,
            AuthField::ClientId,
            AuthField::ClientSecret,
            AuthField::GrantType,
            AuthField::PersonalAccessEmail,
            AuthField::PersonalAccessEndpoint,
            AuthField::PersonalAccessToken,
            AuthField::RedirectUrl,
            AuthField::ResourceUrl,
            AuthField::TokenEndpoint,
        ]
    }

    fn exchange_tokens<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<TokenResponse, GrantError> {
        let cookie = self.login(ctx)?;
        let code = match self.authorize(ctx, &cookie)? {
            Ok(code) => code,
            Err(consent_url) => {
                debug!(trace_id = ctx.trace.trace_id(), "confirming client access");
                self.confirm_access(ctx, &consent_url, &cookie)?
            }
        };
        self.redeem_code(ctx, &code)
    }
}

fn with_query(endpoint: &str, params: &[(&str, &str)]) -> Result<Url, GrantError> {
    Url::parse_with_params(endpoint, params).map_err(|e| GrantError::RequestBuild(e.to_string()))
}

/// Returns the `Location` header of a `3xx` response.
fn expect_redirect<'r>(endpoint: &str, response: &'r Response<Vec<u8>>) -> Result<&'r str, GrantError> {
    let missing = || GrantError::MissingRedirect {
        endpoint: endpoint.to_string(),
        status: response.status().as_u16(),
    };
    if !response.status().is_redirection() {
        return Err(missing());
    }
    response
        .headers()
        .get(LOCATION)
        .and_then(|l| l.to_str().ok())
        .ok_or_else(missing)
}

/// `name=value` pairs of every `Set-Cookie` header, joined as a `Cookie` header value.
fn cookies_of(headers: &HeaderMap<HeaderValue>) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use httpmock::{Method::GET, Method::POST, MockServer};
    use mockall::Sequence;

    use super::*;
    use crate::auth_config::AuthenticationConfig;
    use crate::event::EventDispatcher;
    use crate::http::client::HttpClient as ReqwestHttpClient;
    use crate::http::config::HttpConfig;
    use crate::http_client::tests::{MockHttpClient, json_response};
    use crate::trace::Trace;

    fn pat_config(base: &str) -> AuthenticationConfig {
        AuthenticationConfig::new(GrantType::AuthorizationCode, "https://x/api/")
            .with_client("a", "b")
            .with_authorization_endpoint(format!("{base}/oauth/authorize"))
            .with_token_endpoint(format!("{base}/oauth/token"))
            .with_redirect_url("https://app/callback")
            .with_personal_access(format!("{base}/login/pat"), "me@x", "pat-secret")
    }

    fn redirect(location: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(302)
            .header(LOCATION, location)
            .header(SET_COOKIE, "sid=abc; Path=/; HttpOnly")
            .body(Vec::new())
            .unwrap()
    }

    fn exchange<C: HttpClient>(
        http_client: &C,
        config: &AuthenticationConfig,
    ) -> Result<TokenResponse, GrantError> {
        let events = EventDispatcher::new();
        let trace = Trace::new();
        PersonalAccessTokenAdapter.exchange_tokens(&ExchangeContext {
            http_client,
            config,
            events: &events,
            trace: &trace,
        })
    }

    #[test]
    fn code_granted_without_consent() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(GET)
                .path("/login/pat")
                .query_param("token", "pat-secret")
                .query_param("email", "me@x");
            then.status(302)
                .header("location", "/home")
                .header("set-cookie", "sid=abc; Path=/");
        });
        let authorize = server.mock(|when, then| {
            when.method(GET)
                .path("/oauth/authorize")
                .query_param("response_type", "code")
                .query_param("client_id", "a")
                .query_param("redirect_uri", "https://app/callback")
                .query_param("resource", "https://x/api/")
                .header("cookie", "sid=abc");
            then.status(302)
                .header("location", "https://app/callback?code=C0DE");
        });
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .header("authorization", "Basic YTpi");
            then.status(200).json_body(serde_json::json!({
                "access_token": "T",
                "refresh_token": "R",
                "expires_in": 60,
            }));
        });
        let http_client = ReqwestHttpClient::new(HttpConfig::default()).unwrap();

        let response = exchange(&http_client, &pat_config(&server.base_url())).unwrap();

        assert_eq!(response.access_token.as_deref(), Some("T"));
        login.assert();
        authorize.assert();
        token.assert();
    }

    #[test]
    fn consent_form_is_submitted_when_no_code_is_granted() {
        let config = pat_config("https://x");
        let mut seq = Sequence::new();
        let mut http_client = MockHttpClient::new();
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(redirect("/home")));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(redirect("/oauth/consent?client_id=a")));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .withf(|req| {
                *req.method() == http::Method::POST
                    && req.uri() == "https://x/oauth/consent?client_id=a"
                    && req.body() == b"decision=allow"
                    && req.headers().get(COOKIE).unwrap() == "sid=abc"
            })
            .returning(|_| Ok(redirect("https://app/callback?code=C0DE")));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .withf(|req| {
                let form: Vec<(String, String)> = url::form_urlencoded::parse(req.body())
                    .into_owned()
                    .collect();
                req.uri() == "https://x/oauth/token"
                    && form
                        == vec![
                            ("grant_type".to_string(), "authorization_code".to_string()),
                            ("code".to_string(), "C0DE".to_string()),
                            ("redirect_uri".to_string(), "https://app/callback".to_string()),
                        ]
            })
            .returning(|_| {
                Ok(json_response(
                    200,
                    serde_json::json!({"access_token": "T", "expires_in": 60}),
                ))
            });

        let response = exchange(&http_client, &config).unwrap();

        assert_eq!(response.access_token.as_deref(), Some("T"));
    }

    #[test]
    fn login_without_redirect_fails() {
        let mut http_client = MockHttpClient::new();
        http_client
            .expect_send()
            .once()
            .returning(|_| Ok(json_response(200, serde_json::json!({}))));

        assert_matches!(
            exchange(&http_client, &pat_config("https://x")),
            Err(GrantError::MissingRedirect { endpoint, status: 200 }) => {
                assert_eq!(endpoint, "https://x/login/pat");
            }
        );
    }

    #[test]
    fn consent_redirect_without_code_fails() {
        let mut seq = Sequence::new();
        let mut http_client = MockHttpClient::new();
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(redirect("/home")));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(redirect("/oauth/consent")));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(redirect("https://app/callback?error=denied")));

        assert_matches!(
            exchange(&http_client, &pat_config("https://x")),
            Err(GrantError::MissingQueryParameter { name, .. }) => {
                assert_eq!(name, "code");
            }
        );
    }

    #[test]
    fn set_cookie_values_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("csrf=xyz; Secure"));

        assert_eq!(cookies_of(&headers), "sid=abc; csrf=xyz");
    }
}
