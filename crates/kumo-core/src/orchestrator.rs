//! Top-level client tying the cloud session to device sessions.
//!
//! [`SessionOrchestrator`] makes sure every cloud call carries a valid access token,
//! renewing it by refresh (or login when the refresh token is gone), and that every
//! device call uses key material derived from the device's current identity.
//!
//! # Example
//!
//! ```no_run
//! use kumo_core::{ClientConfig, Credentials, SessionOrchestrator, commands};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kumo_core::Error> {
//!     let client = SessionOrchestrator::new(
//!         Credentials::new("user@example.com", "password"),
//!         ClientConfig::default(),
//!     )?;
//!     client.login().await?;
//!     client.bootstrap_device("2234P008M100013F", "192.168.1.20").await?;
//!
//!     let status = client
//!         .query("2234P008M100013F", &commands::indoor_unit_status())
//!         .await?;
//!     println!("{}", status.response);
//!     Ok(())
//! }
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    auth::CloudAuthenticator,
    clock::{Clock, SystemClock},
    cloud::{CloudApi, KumoCloudClient},
    config::ClientConfig,
    credentials::Credentials,
    crypto::DeviceIdentity,
    device::{DeviceResponse, DeviceSession, RecoveryPolicy},
    error::Error,
    token::{AccessToken, CloudCredential, CloudTokenStore},
    transport::{HttpTransport, LocalTransport},
};

/// Client for one Kumo account and its devices.
pub struct SessionOrchestrator {
    credentials: Credentials,
    api: Arc<dyn CloudApi>,
    store: Arc<CloudTokenStore>,
    authenticator: CloudAuthenticator,
    transport: Arc<dyn LocalTransport>,
    clock: Arc<dyn Clock>,
    recovery: RecoveryPolicy,
    devices: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionOrchestrator {
    /// Creates a client using the Kumo cloud and the local HTTP transport.
    pub fn new(credentials: Credentials, config: ClientConfig) -> Result<Self, Error> {
        let api = Arc::new(KumoCloudClient::new(&config)?);
        let transport = Arc::new(HttpTransport::new(config.transport));
        Ok(Self::with_components(
            credentials,
            api,
            transport,
            Arc::new(SystemClock),
            &config,
        ))
    }

    /// Creates a client from explicit collaborators.
    pub fn with_components(
        credentials: Credentials,
        api: Arc<dyn CloudApi>,
        transport: Arc<dyn LocalTransport>,
        clock: Arc<dyn Clock>,
        config: &ClientConfig,
    ) -> Self {
        let store = Arc::new(CloudTokenStore::new(clock.clone(), config.tokens));
        let authenticator = CloudAuthenticator::new(api.clone(), store.clone(), clock.clone());
        Self {
            credentials,
            api,
            store,
            authenticator,
            transport,
            clock,
            recovery: config.recovery,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The account's token store.
    pub fn token_store(&self) -> &Arc<CloudTokenStore> {
        &self.store
    }

    /// Logs in with the configured credentials.
    pub async fn login(&self) -> Result<Arc<CloudCredential>, Error> {
        self.authenticator.login(&self.credentials).await
    }

    /// Returns a valid access token, refreshing or logging in as needed.
    pub async fn access_token(&self) -> Result<AccessToken, Error> {
        let generation = self.store.generation();
        match self.store.current_access_token() {
            Ok(token) => Ok(token),
            Err(Error::AccessTokenExpired) => {
                debug!("Access token expired, renewing");
                self.renew(generation).await
            }
            Err(Error::NotLoggedIn) => {
                self.authenticator
                    .login_from(&self.credentials, generation)
                    .await?;
                self.store.current_access_token()
            }
            Err(e) => Err(e),
        }
    }

    /// Refreshes past `observed_generation`, falling back to login when the refresh
    /// token is expired or unknown.
    async fn renew(&self, observed_generation: u64) -> Result<AccessToken, Error> {
        match self.authenticator.refresh_from(observed_generation).await {
            Ok(_) => {}
            Err(Error::RefreshTokenExpired | Error::NotLoggedIn) => {
                warn!("Refresh token unusable, logging in again");
                self.authenticator
                    .login_from(&self.credentials, observed_generation)
                    .await?;
            }
            Err(e) => return Err(e),
        }
        self.store.current_access_token()
    }

    /// Runs a cloud call with a valid access token.
    ///
    /// If the call fails with [`Error::Unauthorized`] although the token looked valid,
    /// the token is renewed once and the call retried once.
    pub async fn authorized_call<T, F, Fut>(&self, mut call: F) -> Result<T, Error>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let token = self.access_token().await?;
        match call(token.expose().to_string()).await {
            Err(Error::Unauthorized(reason)) => {
                warn!(%reason, "Cloud rejected access token, renewing once");
                let token = self.renew(token.generation()).await?;
                call(token.expose().to_string()).await
            }
            other => other,
        }
    }

    /// Fetches the current identity of a device from the cloud.
    pub async fn device_identity(&self, serial: &str) -> Result<DeviceIdentity, Error> {
        let status = self
            .authorized_call(|token| {
                let api = self.api.clone();
                let serial = serial.to_string();
                async move { api.device_status(&token, &serial).await }
            })
            .await?;
        Ok(status.identity(serial))
    }

    /// Creates or refreshes the session for a device at a local address.
    ///
    /// The cached session is kept when the cloud reports the same identity and the
    /// address is unchanged. Otherwise keys are re-derived and a new session replaces
    /// it, inheriting the reboot throttle state.
    pub async fn bootstrap_device(
        &self,
        serial: &str,
        address: &str,
    ) -> Result<Arc<DeviceSession>, Error> {
        let identity = self.device_identity(serial).await?;
        let existing = self.cached(serial);

        if let Some(session) = &existing
            && session.identity() == &identity
            && session.address() == address
            && !session.is_key_rejected()
        {
            return Ok(session.clone());
        }

        if existing.is_some() {
            info!(serial, address, "Device identity changed, re-deriving keys");
        }
        self.install(identity, address, existing.as_deref())
    }

    /// Returns the cached session for a device.
    pub fn device(&self, serial: &str) -> Result<Arc<DeviceSession>, Error> {
        self.cached(serial)
            .ok_or_else(|| Error::UnknownDevice(serial.to_string()))
    }

    /// Serials of all bootstrapped devices.
    pub fn device_serials(&self) -> Vec<String> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let mut serials: Vec<_> = devices.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Queries a bootstrapped device.
    ///
    /// On a key mismatch the device identity is re-fetched, keys are derived into a
    /// new session and the query is retried once. A second mismatch is
    /// [`Error::KeyMaterialRejected`].
    pub async fn query(&self, serial: &str, payload: &Value) -> Result<DeviceResponse, Error> {
        let session = self.device(serial)?;
        match session.query(payload).await {
            Err(e) if is_key_failure(&e) => {
                let session = self.rebootstrap(&session).await?;
                session.query(payload).await.map_err(|e| rejected(serial, e))
            }
            other => other,
        }
    }

    /// Sends a command to a bootstrapped device, with the same key recovery as
    /// [`query`](Self::query).
    pub async fn command(&self, serial: &str, payload: &Value) -> Result<DeviceResponse, Error> {
        let session = self.device(serial)?;
        match session.command(payload).await {
            Err(e) if is_key_failure(&e) => {
                let session = self.rebootstrap(&session).await?;
                session.command(payload).await.map_err(|e| rejected(serial, e))
            }
            other => other,
        }
    }

    /// Drops the session for a device.
    pub fn forget_device(&self, serial: &str) -> Option<Arc<DeviceSession>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(serial)
    }

    /// Discards the credential and all device sessions.
    pub fn logout(&self) {
        self.store.clear();
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Logged out");
    }

    fn cached(&self, serial: &str) -> Option<Arc<DeviceSession>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
    }

    fn install(
        &self,
        identity: DeviceIdentity,
        address: &str,
        previous: Option<&DeviceSession>,
    ) -> Result<Arc<DeviceSession>, Error> {
        let serial = identity.device_serial.clone();
        let mut session = DeviceSession::new(
            identity,
            address,
            self.transport.clone(),
            self.clock.clone(),
            self.recovery,
        )?;
        if let Some(previous) = previous {
            session = session.with_state(previous.state());
        }
        let session = Arc::new(session);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial.clone(), session.clone());
        debug!(serial, address, "Device session ready");
        Ok(session)
    }

    /// Re-fetches the identity behind a rejected session and installs a fresh
    /// session for it, keeping the recovery state.
    async fn rebootstrap(&self, session: &DeviceSession) -> Result<Arc<DeviceSession>, Error> {
        let identity = self.device_identity(session.serial()).await?;
        if &identity == session.identity() {
            warn!(
                serial = %session.serial(),
                "Device rejected key material with an unchanged identity, retrying on a fresh session"
            );
        } else {
            info!(serial = %session.serial(), "Device identity changed, re-deriving keys");
        }
        self.install(identity, session.address(), Some(session))
    }
}

fn is_key_failure(error: &Error) -> bool {
    matches!(
        error,
        Error::Decryption(_) | Error::KeyMaterialRejected { .. }
    )
}

/// Maps a key failure on the retried exchange to [`Error::KeyMaterialRejected`].
fn rejected(serial: &str, error: Error) -> Error {
    if is_key_failure(&error) {
        Error::KeyMaterialRejected {
            serial: serial.to_string(),
        }
    } else {
        error
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("credentials", &self.credentials)
            .field("store", &self.store)
            .field("devices", &self.device_serials())
            .finish()
    }
}
