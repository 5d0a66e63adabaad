use tracing::debug;

use super::client_credentials::ClientCredentialsAdapter;
use super::device_code::DeviceCodeFlowAdapter;
use super::personal_access_token::PersonalAccessTokenAdapter;
use super::{GrantAdapter, GrantAdapterImpl};
use crate::auth_config::AuthenticationConfig;

/// Picks the grant adapter for a config.
///
/// Adapters are tried in a fixed priority order: device code, client credentials, then the
/// deprecated personal access token flow.
#[derive(Debug, Clone, Default)]
pub struct AdapterFactory {
    device_code: DeviceCodeFlowAdapter,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `device_code` (e.g. with a custom poll interval) whenever the device flow is picked.
    pub fn with_device_code_adapter(self, device_code: DeviceCodeFlowAdapter) -> Self {
        Self { device_code }
    }

    fn candidates(&self) -> [GrantAdapterImpl; 3] {
        [
            GrantAdapterImpl::DeviceCode(self.device_code.clone()),
            GrantAdapterImpl::ClientCredentials(ClientCredentialsAdapter),
            GrantAdapterImpl::PersonalAccessToken(PersonalAccessTokenAdapter),
        ]
    }

    /// The first adapter compatible with `config`, if any.
    pub fn get_from(&self, config: &AuthenticationConfig) -> Option<GrantAdapterImpl> {
        let adapter = self
            .candidates()
            .into_iter()
            .find(|adapter| adapter.is_compatible_with(config));
        debug!(
            adapter = adapter.as_ref().map(GrantAdapter::name),
            "grant adapter resolved"
        );
        adapter
    }
}
