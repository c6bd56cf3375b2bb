//! Local transport to device adapters.
//!
//! A [`LocalTransport`] performs exactly one encrypted request/response exchange with
//! an adapter at a known address. It never retries; retry and recovery belong to
//! [`DeviceSession`](crate::DeviceSession).
//!
//! [`HttpTransport`] is the production implementation: plain HTTP/1.1 on the local
//! network, AES-128-CBC payloads, and a signed request token in the query string.

pub mod http;

pub use http::HttpTransport;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::{DEFAULT_DEVICE_CONNECT_TIMEOUT, DEFAULT_DEVICE_RESPONSE_TIMEOUT},
    crypto::DeviceKeyMaterial,
    error::Error,
};

/// Default HTTP port of the adapter's local API.
pub const DEFAULT_PORT: u16 = 80;

/// Timeouts for local exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Time allowed to establish the TCP connection.
    pub connect_timeout: Duration,
    /// Time allowed for the request to be written and the response read.
    pub response_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_DEVICE_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_DEVICE_RESPONSE_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// One encrypted exchange with a device.
///
/// Implementations must release the connection when the returned future is dropped,
/// so callers can cancel with `tokio::time::timeout` or `select!`.
#[async_trait]
pub trait LocalTransport: Send + Sync {
    /// Encrypts `payload`, sends it to `address`, and returns the decrypted response.
    ///
    /// `address` is a host or IP, optionally with `:port`.
    ///
    /// # Errors
    ///
    /// Transport failures ([`Error::ConnectionFailed`], [`Error::Timeout`],
    /// [`Error::HttpStatus`], [`Error::Io`]) or [`Error::Decryption`] when the body
    /// does not decrypt to JSON.
    async fn exchange(
        &self,
        address: &str,
        key_material: &DeviceKeyMaterial,
        payload: &Value,
    ) -> Result<Value, Error>;
}

/// Splits `host[:port]`, defaulting to [`DEFAULT_PORT`]. Bare IPv6 addresses are
/// returned unchanged.
pub fn split_host_port(address: &str) -> (&str, u16) {
    if let Some((host, port)) = address.rsplit_once(':')
        && !host.contains(':')
        && let Ok(port) = port.parse()
    {
        return (host, port);
    }
    (address, DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("192.168.1.20"), ("192.168.1.20", 80));
        assert_eq!(split_host_port("192.168.1.20:8080"), ("192.168.1.20", 8080));
        assert_eq!(split_host_port("kumo.local"), ("kumo.local", 80));
        assert_eq!(split_host_port("fe80::1"), ("fe80::1", 80));
    }

    #[test]
    fn test_config_builders() {
        let config = TransportConfig::default()
            .with_connect_timeout(Duration::from_millis(500))
            .with_response_timeout(Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.response_timeout, Duration::from_secs(2));
    }
}
