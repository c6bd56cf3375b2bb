//! Kumo cloud API client.
//!
//! Only the endpoints the session lifecycle needs are covered: login, refresh, and
//! the per-device status resource that carries the crypto parameters.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    config::ClientConfig, credentials::Credentials, crypto::DeviceIdentity, error::Error,
};

const APP_VERSION_HEADER: &str = "x-app-version";

fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Access and refresh tokens as issued by the cloud.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    access: String,
    refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    pub fn access(&self) -> &str {
        &self.access
    }

    pub fn refresh(&self) -> &str {
        &self.refresh
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    token: TokenPair,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    app_version: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Device status resource. Only the crypto parameters are interpreted.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub crypto_serial: String,
    /// Key-set tag. Accepts a string or a number.
    #[serde(default, deserialize_with = "deserialize_key_set")]
    pub crypto_key_set: Option<String>,
    /// Base64 adapter password, the local request signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Everything else the resource returns.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStatus")
            .field("crypto_serial", &self.crypto_serial)
            .field("crypto_key_set", &self.crypto_key_set)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("extra", &self.extra)
            .finish()
    }
}

impl DeviceStatus {
    /// Identity for the device this status belongs to.
    pub fn identity(&self, device_serial: &str) -> DeviceIdentity {
        let identity = DeviceIdentity::new(
            device_serial,
            self.crypto_serial.clone(),
            self.crypto_key_set.clone(),
        );
        match &self.password {
            Some(password) => identity.with_adapter_password(password.clone()),
            None => identity,
        }
    }
}

fn deserialize_key_set<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Cloud endpoints used by the session lifecycle.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Exchanges username and password for a token pair.
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, Error>;

    /// Exchanges a refresh token for a new pair. The old refresh token is dead after
    /// this call succeeds.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, Error>;

    /// Fetches the status resource of one device.
    async fn device_status(&self, access_token: &str, serial: &str)
    -> Result<DeviceStatus, Error>;
}

/// [`CloudApi`] over HTTPS with `reqwest`.
#[derive(Clone)]
pub struct KumoCloudClient {
    http: reqwest::Client,
    base_url: String,
    app_version: String,
}

impl KumoCloudClient {
    /// Creates a client from the cloud section of `config`.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.cloud_connect_timeout)
            .timeout(config.cloud_read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.cloud_url.clone(),
            app_version: config.app_version.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_summary(response: reqwest::Response) -> (StatusCode, String) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        (status, summarize_response_body(&body))
    }
}

impl fmt::Debug for KumoCloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KumoCloudClient")
            .field("base_url", &self.base_url)
            .field("app_version", &self.app_version)
            .finish()
    }
}

#[async_trait]
impl CloudApi for KumoCloudClient {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, Error> {
        debug!(username = %credentials.username, "Logging in to Kumo cloud");
        let response = self
            .http
            .post(self.url("/v3/login"))
            .header(APP_VERSION_HEADER, &self.app_version)
            .json(&LoginRequest {
                username: &credentials.username,
                password: credentials.expose_password(),
                app_version: &self.app_version,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, summary) = Self::error_summary(response).await;
            warn!(status = status.as_u16(), body = %summary, "Login rejected");
            return match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    Err(Error::InvalidCredentials(format!("HTTP {status}")))
                }
                _ => Err(Error::Cloud(format!("login failed: HTTP {status} ({summary})"))),
            };
        }

        let body: LoginResponse = response.json().await?;
        Ok(body.token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, Error> {
        let response = self
            .http
            .post(self.url("/v3/refresh"))
            .header(APP_VERSION_HEADER, &self.app_version)
            .header(header::AUTHORIZATION, format!("Bearer {refresh_token}"))
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, summary) = Self::error_summary(response).await;
            warn!(status = status.as_u16(), body = %summary, "Token refresh rejected");
            return match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::RefreshTokenExpired),
                _ => Err(Error::Cloud(format!(
                    "refresh failed: HTTP {status} ({summary})"
                ))),
            };
        }

        Ok(response.json().await?)
    }

    async fn device_status(
        &self,
        access_token: &str,
        serial: &str,
    ) -> Result<DeviceStatus, Error> {
        let response = self
            .http
            .get(self.url(&format!("/v3/devices/{serial}/status")))
            .header(APP_VERSION_HEADER, &self.app_version)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, summary) = Self::error_summary(response).await;
            debug!(serial, status = status.as_u16(), body = %summary, "Device status failed");
            return match status {
                StatusCode::UNAUTHORIZED => Err(Error::Unauthorized(format!(
                    "device status for {serial}"
                ))),
                StatusCode::NOT_FOUND => Err(Error::UnknownDevice(serial.to_string())),
                _ => Err(Error::Cloud(format!(
                    "device status for {serial} failed: HTTP {status} ({summary})"
                ))),
            };
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_key_set_forms() {
        let status: DeviceStatus = serde_json::from_str(
            r#"{"cryptoSerial":"0a1b2c3d4e5f60718293","cryptoKeySet":2,"rssi":-60}"#,
        )
        .unwrap();
        assert_eq!(status.crypto_key_set.as_deref(), Some("2"));
        assert_eq!(status.extra["rssi"], -60);

        let status: DeviceStatus =
            serde_json::from_str(r#"{"cryptoSerial":"00","cryptoKeySet":"v1"}"#).unwrap();
        assert_eq!(status.crypto_key_set.as_deref(), Some("v1"));

        let status: DeviceStatus = serde_json::from_str(r#"{"cryptoSerial":"00"}"#).unwrap();
        assert_eq!(status.crypto_key_set, None);
    }

    #[test]
    fn test_identity_from_status() {
        let status: DeviceStatus =
            serde_json::from_str(r#"{"cryptoSerial":"abcd","cryptoKeySet":"2"}"#).unwrap();
        let identity = status.identity("2234P008M100013F");
        assert_eq!(identity.device_serial, "2234P008M100013F");
        assert_eq!(identity.crypto_serial, "abcd");
        assert_eq!(identity.crypto_key_set.as_deref(), Some("2"));
        assert_eq!(identity.adapter_password, None);
    }

    #[test]
    fn test_identity_carries_adapter_password() {
        let status: DeviceStatus =
            serde_json::from_str(r#"{"cryptoSerial":"abcd","password":"cGFzcw=="}"#).unwrap();
        assert!(!status.extra.contains_key("password"));
        assert!(!format!("{status:?}").contains("cGFzcw=="));

        let identity = status.identity("2234P008M100013F");
        assert_eq!(identity.adapter_password.as_deref(), Some("cGFzcw=="));
    }

    #[test]
    fn test_login_response_shape() {
        let body: LoginResponse =
            serde_json::from_str(r#"{"token":{"access":"a","refresh":"r"},"user":{}}"#).unwrap();
        assert_eq!(body.token, TokenPair::new("a", "r"));
    }

    #[test]
    fn test_summary_hides_body() {
        let summary = summarize_response_body(r#"{"refresh":"secret"}"#);
        assert!(summary.starts_with("len=20,digest="));
        assert!(!summary.contains("secret"));
    }

    #[test]
    fn test_client_uses_configured_url() {
        let client =
            KumoCloudClient::new(&ClientConfig::default().with_cloud_url("http://127.0.0.1:9/"))
                .unwrap();
        assert_eq!(client.url("/v3/login"), "http://127.0.0.1:9/v3/login");
    }
}
