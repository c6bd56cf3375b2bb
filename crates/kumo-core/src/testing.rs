//! Test doubles shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value, json};

use crate::{
    clock::Clock,
    cloud::{CloudApi, DeviceStatus, TokenPair},
    commands,
    credentials::Credentials,
    crypto::DeviceKeyMaterial,
    error::Error,
    transport::LocalTransport,
};

/// Clock that only moves when told to.
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn starting_now() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub(crate) fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type Responder =
    Box<dyn Fn(&DeviceKeyMaterial, &Value) -> Result<Value, Error> + Send + Sync + 'static>;

/// Scripted device. Reboot commands are acknowledged and counted separately from the
/// responder.
pub(crate) struct FakeTransport {
    responder: Mutex<Responder>,
    requests: Mutex<Vec<(String, Value)>>,
    reboots: AtomicUsize,
    fail_reboots: AtomicBool,
    garble_reboot_acks: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&DeviceKeyMaterial, &Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
            fail_reboots: AtomicBool::new(false),
            garble_reboot_acks: AtomicBool::new(false),
        })
    }

    pub(crate) fn replying(reply: Value) -> Arc<Self> {
        Self::new(move |_, _| Ok(reply.clone()))
    }

    pub(crate) fn failing(error: Error) -> Arc<Self> {
        Self::new(move |_, _| Err(error.clone()))
    }

    pub(crate) fn set_reply(&self, reply: Value) {
        *self.responder.lock().unwrap() = Box::new(move |_, _| Ok(reply.clone()));
    }

    pub(crate) fn fail_reboots(&self) {
        self.fail_reboots.store(true, Ordering::SeqCst);
    }

    /// Reboots reach the adapter but the ack does not decrypt.
    pub(crate) fn garble_reboot_acks(&self) {
        self.garble_reboot_acks.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reboot_count(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalTransport for FakeTransport {
    async fn exchange(
        &self,
        address: &str,
        key_material: &DeviceKeyMaterial,
        payload: &Value,
    ) -> Result<Value, Error> {
        self.requests
            .lock()
            .unwrap()
            .push((address.to_string(), payload.clone()));

        if *payload == commands::reboot() {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            if self.fail_reboots.load(Ordering::SeqCst) {
                return Err(Error::ConnectionFailed("adapter went away".into()));
            }
            if self.garble_reboot_acks.load(Ordering::SeqCst) {
                return Err(Error::Decryption("truncated ack".into()));
            }
            return Ok(json!({"r": {"adapter": {"status": {"runState": "reboot"}}}}));
        }

        let responder = self.responder.lock().unwrap();
        (*responder)(key_material, payload)
    }
}

#[derive(Default)]
struct CloudState {
    live_refresh: Option<String>,
    live_access: HashSet<String>,
    issued: u64,
    devices: HashMap<String, DeviceStatus>,
}

/// In-memory cloud with single-use refresh rotation.
///
/// Only the most recently issued tokens are accepted. A refresh token is dead as
/// soon as it has been used once.
pub(crate) struct FakeCloud {
    state: Mutex<CloudState>,
    refresh_delay: Option<Duration>,
    login_delay: Option<Duration>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl FakeCloud {
    pub(crate) const USERNAME: &'static str = "user@example.com";
    pub(crate) const PASSWORD: &'static str = "hunter2";

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(None, None))
    }

    pub(crate) fn with_refresh_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(delay), None))
    }

    pub(crate) fn with_login_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(None, Some(delay)))
    }

    fn build(refresh_delay: Option<Duration>, login_delay: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            refresh_delay,
            login_delay,
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn credentials() -> Credentials {
        Credentials::new(Self::USERNAME, Self::PASSWORD)
    }

    pub(crate) fn add_device(&self, serial: &str, crypto_serial: &str, key_set: Option<&str>) {
        self.state.lock().unwrap().devices.insert(
            serial.to_string(),
            DeviceStatus {
                crypto_serial: crypto_serial.to_string(),
                crypto_key_set: key_set.map(String::from),
                password: None,
                extra: Map::new(),
            },
        );
    }

    pub(crate) fn set_adapter_password(&self, serial: &str, password: &str) {
        if let Some(status) = self.state.lock().unwrap().devices.get_mut(serial) {
            status.password = Some(password.to_string());
        }
    }

    /// Invalidates every access token server-side.
    pub(crate) fn revoke_access(&self) {
        self.state.lock().unwrap().live_access.clear();
    }

    /// Invalidates the refresh token server-side.
    pub(crate) fn revoke_refresh(&self) {
        self.state.lock().unwrap().live_refresh = None;
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn issue(state: &mut CloudState) -> TokenPair {
        state.issued += 1;
        let pair = TokenPair::new(
            format!("access-{}", state.issued),
            format!("refresh-{}", state.issued),
        );
        state.live_access = HashSet::from([pair.access().to_string()]);
        state.live_refresh = Some(pair.refresh().to_string());
        pair
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, Error> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.login_delay {
            tokio::time::sleep(delay).await;
        }
        if credentials.username != Self::USERNAME || credentials.expose_password() != Self::PASSWORD
        {
            return Err(Error::InvalidCredentials("HTTP 401 Unauthorized".into()));
        }
        Ok(Self::issue(&mut self.state.lock().unwrap()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, Error> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.live_refresh.as_deref() != Some(refresh_token) {
            return Err(Error::RefreshTokenExpired);
        }
        Ok(Self::issue(&mut state))
    }

    async fn device_status(&self, access_token: &str, serial: &str) -> Result<DeviceStatus, Error> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if !state.live_access.contains(access_token) {
            return Err(Error::Unauthorized(format!("device status for {serial}")));
        }
        state
            .devices
            .get(serial)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(serial.to_string()))
    }
}
