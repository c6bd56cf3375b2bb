//! Client configuration and protocol defaults.

use std::time::Duration;

use crate::{device::RecoveryPolicy, token::TokenPolicy, transport::TransportConfig};

/// Production base URL of the Kumo cloud API.
pub const DEFAULT_CLOUD_URL: &str = "https://app-prod.kumocloud.com";

/// App version sent in the `x-app-version` header and in the login body.
pub const DEFAULT_APP_VERSION: &str = "3.2.4";

/// Timeout for establishing a cloud connection.
pub const DEFAULT_CLOUD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a whole cloud request.
pub const DEFAULT_CLOUD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for connecting to a device adapter.
pub const DEFAULT_DEVICE_CONNECT_TIMEOUT: Duration = Duration::from_millis(1200);

/// Timeout for a device adapter to answer once connected.
pub const DEFAULT_DEVICE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);

/// Nominal access token lifetime when the token carries no `exp` claim.
pub const ACCESS_TOKEN_LIFETIME_SECS: i64 = 20 * 60;

/// Nominal refresh token lifetime when the token carries no `exp` claim.
pub const REFRESH_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 60 * 60;

/// An access token is treated as expired this many seconds before its real expiry.
pub const ACCESS_TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

/// Minimum interval between two adapter reboots of the same device.
pub const REBOOT_INTERVAL_SECS: i64 = 30 * 60;

/// Consecutive faults after which an unrecoverable fault is reported as persistent.
pub const FAULT_ESCALATION_THRESHOLD: u32 = 3;

/// Top-level configuration for a [`SessionOrchestrator`](crate::SessionOrchestrator).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use kumo_core::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_cloud_url("https://cloud.example.test")
///     .with_cloud_timeouts(Duration::from_secs(5), Duration::from_secs(15));
/// assert_eq!(config.cloud_url, "https://cloud.example.test");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cloud base URL without a trailing slash.
    pub cloud_url: String,
    /// Value of the `x-app-version` header.
    pub app_version: String,
    /// Cloud connect timeout.
    pub cloud_connect_timeout: Duration,
    /// Cloud request timeout.
    pub cloud_read_timeout: Duration,
    /// Local device transport settings.
    pub transport: TransportConfig,
    /// Token lifetimes and safety margin.
    pub tokens: TokenPolicy,
    /// Reboot throttle and fault escalation.
    pub recovery: RecoveryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cloud_url: DEFAULT_CLOUD_URL.to_string(),
            app_version: DEFAULT_APP_VERSION.to_string(),
            cloud_connect_timeout: DEFAULT_CLOUD_CONNECT_TIMEOUT,
            cloud_read_timeout: DEFAULT_CLOUD_READ_TIMEOUT,
            transport: TransportConfig::default(),
            tokens: TokenPolicy::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Sets the cloud base URL. A trailing slash is stripped.
    pub fn with_cloud_url(mut self, url: impl Into<String>) -> Self {
        self.cloud_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the app version header.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Sets the cloud connect and request timeouts.
    pub fn with_cloud_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.cloud_connect_timeout = connect;
        self.cloud_read_timeout = read;
        self
    }

    /// Sets the local transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the token policy.
    pub fn with_token_policy(mut self, tokens: TokenPolicy) -> Self {
        self.tokens = tokens;
        self
    }

    /// Sets the recovery policy.
    pub fn with_recovery_policy(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }
}
