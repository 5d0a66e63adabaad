use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    ExchangeContext, GrantAdapter, GrantError, OAuthErrorResponse, form_post, required,
    resource_params, send,
};
use crate::auth_config::{AuthField, GrantType};
use crate::event::AuthEvent;
use crate::http_client::HttpClient;
use crate::token::TokenResponse;

const NAME: &str = "device-code";
const BLOCKING_KIND: &str = "user-verification";

/// Poll interval when the server does not send one (RFC 8628 §3.2).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Device code lifetime when the server does not send one.
pub const DEFAULT_DEVICE_CODE_EXPIRY: Duration = Duration::from_secs(600);
/// Upper bound of the polling window, whatever lifetime the server announces.
pub const MAX_DEVICE_CODE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Two-phase device authorization grant (RFC 8628).
///
/// Phase one obtains a device code and a verification URL, which is announced with
/// [`AuthEvent::BlockingResponseRequired`]. Phase two polls the token endpoint on the calling
/// thread until the user approves, the server rejects the code or the deadline passes.
#[derive(Debug, Clone, Default)]
pub struct DeviceCodeFlowAdapter {
    poll_interval: Option<Duration>,
    expiry: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    #[serde(default)]
    user_code: Option<String>,
    #[serde(default)]
    verification_uri: Option<String>,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    interval: Option<u64>,
}

enum PollOutcome {
    Token(TokenResponse),
    Pending,
    SlowDown,
}

impl DeviceCodeFlowAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the server-provided poll interval.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval: Some(poll_interval),
            ..self
        }
    }

    /// Overrides the server-provided device code lifetime, which bounds the polling.
    pub fn with_expiry(self, expiry: Duration) -> Self {
        Self {
            expiry: Some(expiry),
            ..self
        }
    }

    fn request_device_code<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<DeviceCodeResponse, GrantError> {
        let endpoint = required(ctx.config, NAME, AuthField::DeviceCodeEndpoint)?;

        let mut params = resource_params(ctx.config);
        if let Some(scope) = ctx.config.field(AuthField::Scope) {
            params.push(("scope", scope));
        }
        let request = form_post(endpoint, &params, ctx.config, ctx.trace)?;
        let response = send(ctx.http_client, endpoint, request)?;

        if !response.status().is_success() {
            return Err(GrantError::UnsuccessfulResponse {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
                body: String::from_utf8_lossy(response.body()).to_string(),
            });
        }
        serde_json::from_slice(response.body()).map_err(|e| GrantError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    fn poll<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        token_endpoint: &str,
        device_code: &str,
    ) -> Result<PollOutcome, GrantError> {
        let params = [
            ("grant_type", GrantType::DeviceCode.as_str()),
            ("device_code", device_code),
        ];
        let request = form_post(token_endpoint, &params, ctx.config, ctx.trace)?;
        let response = send(ctx.http_client, token_endpoint, request)?;

        if response.status().is_success() {
            return serde_json::from_slice(response.body())
                .map(PollOutcome::Token)
                .map_err(|e| GrantError::Decode {
                    endpoint: token_endpoint.to_string(),
                    reason: e.to_string(),
                });
        }

        let error: OAuthErrorResponse = serde_json::from_slice(response.body()).map_err(|_| {
            GrantError::UnsuccessfulResponse {
                endpoint: token_endpoint.to_string(),
                status: response.status().as_u16(),
                body: String::from_utf8_lossy(response.body()).to_string(),
            }
        })?;
        match error.error.as_str() {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            _ => Err(GrantError::DeviceCodeRejected {
                error: error.error,
                description: error.error_description,
            }),
        }
    }

    fn poll_until_authorized<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
        device_code: &DeviceCodeResponse,
    ) -> Result<TokenResponse, GrantError> {
        let token_endpoint = required(ctx.config, NAME, AuthField::TokenEndpoint)?;
        let mut interval = self
            .poll_interval
            .or(device_code.interval.map(Duration::from_secs))
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let expiry = self
            .expiry
            .or(device_code.expires_in.map(Duration::from_secs))
            .unwrap_or(DEFAULT_DEVICE_CODE_EXPIRY)
            .min(MAX_DEVICE_CODE_EXPIRY);
        let deadline = Instant::now() + expiry;

        let mut attempts = 0u32;
        loop {
            if Instant::now() >= deadline {
                warn!(trace_id = ctx.trace.trace_id(), attempts, "device code expired while polling");
                return Err(GrantError::DeviceCodeExpired);
            }

            attempts += 1;
            match self.poll(ctx, token_endpoint, &device_code.device_code)? {
                PollOutcome::Token(token) => {
                    debug!(trace_id = ctx.trace.trace_id(), attempts, "device authorized");
                    return Ok(token);
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                    debug!(interval_secs = interval.as_secs(), "token endpoint asked to slow down");
                }
            }
            thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl GrantAdapter for DeviceCodeFlowAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn grant_type(&self) -> GrantType {
        GrantType::DeviceCode
    }

    fn expected_fields(&self) -> &'static [AuthField] {
        &[
            AuthField::ClientId,
            AuthField::DeviceCodeEndpoint,
            AuthField::GrantType,
            AuthField::ResourceUrl,
            AuthField::TokenEndpoint,
        ]
    }

    fn exchange_tokens<C: HttpClient>(
        &self,
        ctx: &ExchangeContext<'_, C>,
    ) -> Result<TokenResponse, GrantError> {
        let device_code = self.request_device_code(ctx)?;
        let endpoint = ctx.config.field(AuthField::DeviceCodeEndpoint).unwrap_or_default();
        let url = device_code
            .verification_uri_complete
            .clone()
            .or_else(|| device_code.verification_uri.clone())
            .ok_or_else(|| GrantError::Decode {
                endpoint: endpoint.to_string(),
                reason: "no verification uri in the device code response".to_string(),
            })?;

        info!(url = %url, user_code = ?device_code.user_code, "waiting for device authorization");
        ctx.events.dispatch(AuthEvent::BlockingResponseRequired {
            kind: BLOCKING_KIND.to_string(),
            url,
        });

        match self.poll_until_authorized(ctx, &device_code) {
            Ok(token) => {
                ctx.events.dispatch(AuthEvent::BlockingResponseOk {
                    kind: BLOCKING_KIND.to_string(),
                });
                Ok(token)
            }
            Err(err) => {
                ctx.events.dispatch(AuthEvent::BlockingResponseFailed {
                    kind: BLOCKING_KIND.to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockall::Sequence;

    use super::*;
    use crate::auth_config::AuthenticationConfig;
    use crate::event::EventDispatcher;
    use crate::event::tests::{event_names, record_events};
    use crate::http_client::tests::{MockHttpClient, json_response};
    use crate::trace::Trace;

    const DEVICE_ENDPOINT: &str = "https://x/oauth/device/code";
    const TOKEN_ENDPOINT: &str = "https://x/oauth/token";

    fn device_code_config() -> AuthenticationConfig {
        AuthenticationConfig::new(GrantType::DeviceCode, "https://x/api/")
            .with_client_id("cli")
            .with_device_code_endpoint(DEVICE_ENDPOINT)
            .with_token_endpoint(TOKEN_ENDPOINT)
    }

    fn to(uri: &'static str) -> impl Fn(&http::Request<Vec<u8>>) -> bool {
        move |req| req.uri() == uri
    }

    fn expect_device_code(http_client: &mut MockHttpClient, seq: &mut Sequence) {
        http_client
            .expect_send()
            .once()
            .in_sequence(seq)
            .withf(to(DEVICE_ENDPOINT))
            .returning(|_| {
                Ok(json_response(
                    200,
                    serde_json::json!({
                        "device_code": "dev-123",
                        "user_code": "ABCD-EFGH",
                        "verification_uri": "https://x/activate",
                        "verification_uri_complete": "https://x/activate?user_code=ABCD-EFGH",
                        "expires_in": 600,
                        "interval": 5,
                    }),
                ))
            });
    }

    fn pending() -> http::Response<Vec<u8>> {
        json_response(400, serde_json::json!({"error": "authorization_pending"}))
    }

    fn run(
        adapter: &DeviceCodeFlowAdapter,
        http_client: &MockHttpClient,
        events: &EventDispatcher,
    ) -> Result<TokenResponse, GrantError> {
        let config = device_code_config();
        let trace = Trace::new();
        adapter.exchange_tokens(&ExchangeContext {
            http_client,
            config: &config,
            events,
            trace: &trace,
        })
    }

    #[test]
    fn polls_until_authorized() {
        const PENDING_POLLS: usize = 3;

        let mut seq = Sequence::new();
        let mut http_client = MockHttpClient::new();
        expect_device_code(&mut http_client, &mut seq);
        http_client
            .expect_send()
            .times(PENDING_POLLS)
            .in_sequence(&mut seq)
            .withf(|req| {
                let form: Vec<(String, String)> = url::form_urlencoded::parse(req.body())
                    .into_owned()
                    .collect();
                req.uri() == TOKEN_ENDPOINT
                    && form.contains(&("device_code".to_string(), "dev-123".to_string()))
                    && form.contains(&(
                        "grant_type".to_string(),
                        "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                    ))
            })
            .returning(|_| Ok(pending()));
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .withf(to(TOKEN_ENDPOINT))
            .returning(|_| {
                Ok(json_response(
                    200,
                    serde_json::json!({
                        "access_token": "T",
                        "refresh_token": "R",
                        "expires_in": 60,
                    }),
                ))
            });

        let events = EventDispatcher::new();
        let recorded = record_events(&events);
        let adapter = DeviceCodeFlowAdapter::new().with_poll_interval(Duration::from_millis(10));

        let token = run(&adapter, &http_client, &events).unwrap();

        assert_eq!(token.access_token.as_deref(), Some("T"));
        assert_eq!(token.refresh_token.as_deref(), Some("R"));
        assert_eq!(
            event_names(&recorded),
            vec!["blocking-response-required", "blocking-response-ok"]
        );
        assert_eq!(
            recorded.lock().unwrap()[0],
            AuthEvent::BlockingResponseRequired {
                kind: BLOCKING_KIND.to_string(),
                url: "https://x/activate?user_code=ABCD-EFGH".to_string(),
            }
        );
    }

    #[test]
    fn deadline_stops_polling() {
        let mut seq = Sequence::new();
        let mut http_client = MockHttpClient::new();
        expect_device_code(&mut http_client, &mut seq);
        http_client
            .expect_send()
            .withf(to(TOKEN_ENDPOINT))
            .returning(|_| Ok(pending()));

        let events = EventDispatcher::new();
        let recorded = record_events(&events);
        // Success would need 10 polls, the deadline allows about 3.
        let adapter = DeviceCodeFlowAdapter::new()
            .with_poll_interval(Duration::from_millis(50))
            .with_expiry(Duration::from_millis(120));

        let started = Instant::now();
        let result = run(&adapter, &http_client, &events);

        assert_matches!(result, Err(GrantError::DeviceCodeExpired));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(
            event_names(&recorded),
            vec!["blocking-response-required", "blocking-response-failed"]
        );
    }

    fn expect_device_code_with(http_client: &mut MockHttpClient, body: serde_json::Value) {
        http_client
            .expect_send()
            .once()
            .withf(to(DEVICE_ENDPOINT))
            .returning(move |_| Ok(json_response(200, body.clone())));
    }

    #[test]
    fn huge_server_lifetime_is_capped() {
        let mut http_client = MockHttpClient::new();
        expect_device_code_with(
            &mut http_client,
            serde_json::json!({
                "device_code": "dev-123",
                "verification_uri": "https://x/activate",
                "expires_in": u64::MAX,
                "interval": 1,
            }),
        );
        http_client
            .expect_send()
            .once()
            .withf(to(TOKEN_ENDPOINT))
            .returning(|_| {
                Ok(json_response(
                    200,
                    serde_json::json!({"access_token": "T", "expires_in": 60}),
                ))
            });

        let token = run(&DeviceCodeFlowAdapter::new(), &http_client, &EventDispatcher::new()).unwrap();

        assert_eq!(token.access_token.as_deref(), Some("T"));
    }

    #[test]
    fn sleeping_never_overshoots_the_deadline() {
        let mut http_client = MockHttpClient::new();
        expect_device_code_with(
            &mut http_client,
            serde_json::json!({
                "device_code": "dev-123",
                "verification_uri": "https://x/activate",
                "interval": u64::MAX,
            }),
        );
        http_client
            .expect_send()
            .withf(to(TOKEN_ENDPOINT))
            .returning(|_| Ok(json_response(400, serde_json::json!({"error": "slow_down"}))));

        let adapter = DeviceCodeFlowAdapter::new().with_expiry(Duration::from_millis(100));
        let started = Instant::now();

        assert_matches!(
            run(&adapter, &http_client, &EventDispatcher::new()),
            Err(GrantError::DeviceCodeExpired)
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn device_code_request_failure_is_fatal() {
        let mut http_client = MockHttpClient::new();
        http_client
            .expect_send()
            .once()
            .withf(to(DEVICE_ENDPOINT))
            .returning(|_| Ok(json_response(500, serde_json::json!({"error": "boom"}))));

        let events = EventDispatcher::new();
        let recorded = record_events(&events);

        assert_matches!(
            run(&DeviceCodeFlowAdapter::new(), &http_client, &events),
            Err(GrantError::UnsuccessfulResponse { status: 500, .. })
        );
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[test]
    fn other_poll_errors_are_fatal() {
        let mut seq = Sequence::new();
        let mut http_client = MockHttpClient::new();
        expect_device_code(&mut http_client, &mut seq);
        http_client
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(json_response(
                    400,
                    serde_json::json!({
                        "error": "access_denied",
                        "error_description": "user said no",
                    }),
                ))
            });

        let adapter = DeviceCodeFlowAdapter::new().with_poll_interval(Duration::from_millis(1));

        assert_matches!(
            run(&adapter, &http_client, &EventDispatcher::new()),
            Err(GrantError::DeviceCodeRejected { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description.as_deref(), Some("user said no"));
            }
        );
    }
}
