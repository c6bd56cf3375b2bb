//! Stateful session with one device adapter.
//!
//! A [`DeviceSession`] owns the key material for one device and sends queries and
//! commands through a [`LocalTransport`]. Responses are checked for firmware fault
//! markers. A fault triggers an adapter reboot, at most once per
//! [`RecoveryPolicy::reboot_interval`], and the response is still returned to the
//! caller with the fault attached.
//!
//! Exchanges with the same device are serialized. Different devices are independent.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    commands,
    config::{FAULT_ESCALATION_THRESHOLD, REBOOT_INTERVAL_SECS},
    crypto::{DeviceIdentity, DeviceKeyMaterial, derive_key_material},
    error::Error,
    transport::LocalTransport,
};

const API_ERROR_KEY: &str = "_api_error";
const SERIALIZER_ERROR: &str = "serializer_error";
const NO_MEMORY_MARKER: &str = "__no_memory";

/// Reboot throttle and fault escalation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Minimum time between two reboots of the same adapter.
    pub reboot_interval: TimeDelta,
    /// Consecutive faults after which a fault that could not reboot is persistent.
    pub escalation_threshold: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            reboot_interval: TimeDelta::seconds(REBOOT_INTERVAL_SECS),
            escalation_threshold: FAULT_ESCALATION_THRESHOLD,
        }
    }
}

/// Firmware distress marker found in an otherwise valid response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFault {
    /// `"_api_error": "serializer_error"`.
    SerializerError,
    /// `__no_memory` somewhere in the response.
    NoMemory,
}

impl DeviceFault {
    /// Looks for a fault marker in a decrypted response.
    pub fn detect(response: &Value) -> Option<Self> {
        if api_error(response) == Some(SERIALIZER_ERROR) {
            return Some(Self::SerializerError);
        }
        if contains_marker(response, NO_MEMORY_MARKER) {
            return Some(Self::NoMemory);
        }
        None
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::SerializerError => write!(f, "serializer_error"),
            DeviceFault::NoMemory => write!(f, "no_memory"),
        }
    }
}

fn api_error(response: &Value) -> Option<&str> {
    response.get(API_ERROR_KEY)?.as_str()
}

fn contains_marker(value: &Value, marker: &str) -> bool {
    match value {
        Value::String(s) => s.contains(marker),
        Value::Array(items) => items.iter().any(|v| contains_marker(v, marker)),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains(marker) || contains_marker(v, marker)),
        _ => false,
    }
}

/// Recovery bookkeeping for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSessionState {
    /// When the last reboot was sent, if ever.
    pub last_reboot_issued_at: Option<DateTime<Utc>>,
    /// Faults seen since the last clean exchange.
    pub consecutive_error_count: u32,
}

impl DeviceSessionState {
    /// Earliest time the next reboot may be sent.
    pub fn next_reboot_allowed_at(&self, interval: TimeDelta) -> Option<DateTime<Utc>> {
        self.last_reboot_issued_at.map(|last| last + interval)
    }

    fn reboot_allowed(&self, now: DateTime<Utc>, interval: TimeDelta) -> bool {
        self.next_reboot_allowed_at(interval)
            .is_none_or(|next| now >= next)
    }
}

/// What happened to the reboot a fault asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootAction {
    /// A reboot command was sent.
    Issued,
    /// A reboot was sent too recently.
    Throttled {
        next_allowed_at: DateTime<Utc>,
    },
    /// The reboot command could not be delivered. It still counts for throttling.
    Failed(String),
}

/// Fault observed on a response and how it was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub fault: DeviceFault,
    /// Consecutive faults including this one.
    pub consecutive_errors: u32,
    pub reboot: RebootAction,
    /// The fault keeps recurring and no reboot could be sent for it.
    pub persistent: bool,
}

/// A decrypted device response, with the fault it carried if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub response: Value,
    pub fault: Option<FaultReport>,
}

impl DeviceResponse {
    /// `true` if the payload came with a fault marker and may be incomplete.
    pub fn is_soft_failure(&self) -> bool {
        self.fault.is_some()
    }
}

/// Session with one device adapter.
pub struct DeviceSession {
    identity: DeviceIdentity,
    address: String,
    key_material: DeviceKeyMaterial,
    transport: Arc<dyn LocalTransport>,
    clock: Arc<dyn Clock>,
    policy: RecoveryPolicy,
    state: Mutex<DeviceSessionState>,
    io: tokio::sync::Mutex<()>,
    key_rejected: AtomicBool,
}

impl DeviceSession {
    /// Derives key material for `identity` and creates a session.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedKeyVersion`] or [`Error::InvalidIdentity`] if keys cannot
    /// be derived.
    pub fn new(
        identity: DeviceIdentity,
        address: impl Into<String>,
        transport: Arc<dyn LocalTransport>,
        clock: Arc<dyn Clock>,
        policy: RecoveryPolicy,
    ) -> Result<Self, Error> {
        let key_material = derive_key_material(&identity)?;
        Ok(Self {
            identity,
            address: address.into(),
            key_material,
            transport,
            clock,
            policy,
            state: Mutex::new(DeviceSessionState::default()),
            io: tokio::sync::Mutex::new(()),
            key_rejected: AtomicBool::new(false),
        })
    }

    /// Carries recovery state over from a previous session for the same device.
    pub fn with_state(self, state: DeviceSessionState) -> Self {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self
    }

    /// Identity the session's keys were derived from.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Device serial, as listed by the cloud.
    pub fn serial(&self) -> &str {
        &self.identity.device_serial
    }

    /// Local address, `host[:port]`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Snapshot of the recovery state.
    pub fn state(&self) -> DeviceSessionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` once the device failed to decrypt with this session's keys.
    pub fn is_key_rejected(&self) -> bool {
        self.key_rejected.load(Ordering::Acquire)
    }

    /// Sends a query. Fault markers trigger recovery but do not fail the call.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceUnreachable`] on transport failure, [`Error::Decryption`] on a
    /// key mismatch, and [`Error::KeyMaterialRejected`] for every call after that.
    pub async fn query(&self, payload: &Value) -> Result<DeviceResponse, Error> {
        let _io = self.io.lock().await;
        let response = self.exchange(payload).await?;
        let fault = self.inspect(&response).await;
        Ok(DeviceResponse { response, fault })
    }

    /// Sends a command such as a set-point or mode change.
    ///
    /// Behaves like [`query`](Self::query), but an `_api_error` that is not a fault
    /// marker fails with [`Error::DeviceRejected`].
    pub async fn command(&self, payload: &Value) -> Result<DeviceResponse, Error> {
        let _io = self.io.lock().await;
        let response = self.exchange(payload).await?;
        let fault = self.inspect(&response).await;
        if fault.is_none()
            && let Some(reason) = api_error(&response)
        {
            warn!(serial = %self.serial(), reason, "Device rejected command");
            return Err(Error::DeviceRejected(reason.to_string()));
        }
        Ok(DeviceResponse { response, fault })
    }

    /// Reboots the adapter, subject to the same throttle as fault recovery.
    pub async fn reboot(&self) -> Result<RebootAction, Error> {
        let _io = self.io.lock().await;
        if self.is_key_rejected() {
            return Err(Error::KeyMaterialRejected {
                serial: self.serial().to_string(),
            });
        }
        if let Err(next_allowed_at) = self.claim_reboot_slot() {
            info!(serial = %self.serial(), %next_allowed_at, "Reboot throttled");
            return Ok(RebootAction::Throttled { next_allowed_at });
        }
        self.send_reboot().await?;
        Ok(RebootAction::Issued)
    }

    async fn exchange(&self, payload: &Value) -> Result<Value, Error> {
        if self.is_key_rejected() {
            return Err(Error::KeyMaterialRejected {
                serial: self.serial().to_string(),
            });
        }

        match self
            .transport
            .exchange(&self.address, &self.key_material, payload)
            .await
        {
            Ok(response) => Ok(response),
            Err(Error::Decryption(reason)) => {
                self.key_rejected.store(true, Ordering::Release);
                error!(
                    serial = %self.serial(),
                    version = %self.key_material.version,
                    reason = %reason,
                    "Device response did not decrypt; key material rejected"
                );
                Err(Error::Decryption(reason))
            }
            Err(e) if e.is_transport() => {
                debug!(
                    serial = %self.serial(),
                    address = %self.address,
                    error = %e,
                    "Exchange failed"
                );
                Err(Error::DeviceUnreachable {
                    serial: self.serial().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Updates recovery state for a response and reboots if a fault calls for it.
    async fn inspect(&self, response: &Value) -> Option<FaultReport> {
        let Some(fault) = DeviceFault::detect(response) else {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .consecutive_error_count = 0;
            return None;
        };

        let consecutive_errors = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.consecutive_error_count = state.consecutive_error_count.saturating_add(1);
            state.consecutive_error_count
        };
        warn!(serial = %self.serial(), %fault, consecutive_errors, "Device reported fault");

        let reboot = match self.claim_reboot_slot() {
            Ok(()) => match self.send_reboot().await {
                Ok(()) => RebootAction::Issued,
                Err(e) => {
                    warn!(serial = %self.serial(), error = %e, "Reboot command failed");
                    RebootAction::Failed(e.to_string())
                }
            },
            Err(next_allowed_at) => {
                info!(serial = %self.serial(), %next_allowed_at, "Reboot throttled");
                RebootAction::Throttled { next_allowed_at }
            }
        };

        let persistent = consecutive_errors >= self.policy.escalation_threshold
            && reboot != RebootAction::Issued;
        if persistent {
            error!(
                serial = %self.serial(),
                %fault,
                consecutive_errors,
                "Device fault persists and no reboot is available"
            );
        }

        Some(FaultReport {
            fault,
            consecutive_errors,
            reboot,
            persistent,
        })
    }

    /// Records a reboot as issued now, or returns when the next one is allowed.
    fn claim_reboot_slot(&self) -> Result<(), DateTime<Utc>> {
        let now = self.clock.now();
        let interval = self.policy.reboot_interval;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.reboot_allowed(now, interval) {
            state.last_reboot_issued_at = Some(now);
            Ok(())
        } else {
            Err(state
                .next_reboot_allowed_at(interval)
                .unwrap_or(now + interval))
        }
    }

    /// Sends the reboot command.
    ///
    /// An adapter going down may answer with a truncated or garbled body, so any
    /// reply that reaches us counts as issued and never marks the key rejected.
    /// Only a transport failure is an error.
    async fn send_reboot(&self) -> Result<(), Error> {
        warn!(serial = %self.serial(), address = %self.address, "Rebooting adapter");
        match self
            .transport
            .exchange(&self.address, &self.key_material, &commands::reboot())
            .await
        {
            Ok(_) => Ok(()),
            Err(e @ (Error::Decryption(_) | Error::Protocol(_) | Error::ParseError(_))) => {
                debug!(serial = %self.serial(), error = %e, "Unreadable reboot ack");
                Ok(())
            }
            Err(e) if e.is_transport() => Err(Error::DeviceUnreachable {
                serial: self.serial().to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.identity.device_serial)
            .field("address", &self.address)
            .field("key_material", &self.key_material)
            .field("key_rejected", &self.is_key_rejected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{FakeTransport, ManualClock};

    const SERIAL: &str = "2234P008M100013F";

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(SERIAL, "0a1b2c3d4e5f60718293", Some("2".into()))
    }

    fn session(transport: Arc<FakeTransport>, clock: Arc<ManualClock>) -> DeviceSession {
        DeviceSession::new(
            identity(),
            "192.168.1.20",
            transport,
            clock,
            RecoveryPolicy::default(),
        )
        .unwrap()
    }

    fn no_memory_reply() -> Value {
        json!({"error": "__no_memory"})
    }

    #[test]
    fn test_detect_faults() {
        assert_eq!(
            DeviceFault::detect(&json!({"_api_error": "serializer_error"})),
            Some(DeviceFault::SerializerError)
        );
        assert_eq!(
            DeviceFault::detect(&json!({"r": {"indoorUnit": {"__no_memory": {}}}})),
            Some(DeviceFault::NoMemory)
        );
        assert_eq!(
            DeviceFault::detect(&json!({"r": {"list": ["ok", "x__no_memory"]}})),
            Some(DeviceFault::NoMemory)
        );
        assert_eq!(
            DeviceFault::detect(&json!({"_api_error": "device_authentication_error"})),
            None
        );
        assert_eq!(DeviceFault::detect(&json!({"r": {"mode": "heat"}})), None);
    }

    #[tokio::test]
    async fn test_no_memory_reboots_and_returns_payload() {
        let transport = FakeTransport::replying(no_memory_reply());
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock);

        let result = session.query(&commands::indoor_unit_status()).await.unwrap();

        assert_eq!(result.response, no_memory_reply());
        assert!(result.is_soft_failure());
        let fault = result.fault.unwrap();
        assert_eq!(fault.fault, DeviceFault::NoMemory);
        assert_eq!(fault.reboot, RebootAction::Issued);
        assert_eq!(transport.reboot_count(), 1);
        assert_eq!(session.state().consecutive_error_count, 1);
    }

    #[tokio::test]
    async fn test_reboot_throttled_within_interval() {
        let transport = FakeTransport::replying(no_memory_reply());
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock.clone());

        session.query(&commands::indoor_unit_status()).await.unwrap();
        clock.advance(TimeDelta::minutes(10));
        let second = session.query(&commands::indoor_unit_status()).await.unwrap();

        assert_eq!(transport.reboot_count(), 1);
        assert!(matches!(
            second.fault.unwrap().reboot,
            RebootAction::Throttled { .. }
        ));
    }

    #[tokio::test]
    async fn test_reboot_allowed_after_interval() {
        let transport = FakeTransport::replying(no_memory_reply());
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock.clone());

        session.query(&commands::indoor_unit_status()).await.unwrap();
        clock.advance(TimeDelta::minutes(31));
        let second = session.query(&commands::indoor_unit_status()).await.unwrap();

        assert_eq!(transport.reboot_count(), 2);
        assert_eq!(second.fault.unwrap().reboot, RebootAction::Issued);
    }

    #[tokio::test]
    async fn test_clean_response_resets_error_count() {
        let transport = FakeTransport::replying(no_memory_reply());
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock);

        session.query(&commands::indoor_unit_status()).await.unwrap();
        session.query(&commands::indoor_unit_status()).await.unwrap();
        assert_eq!(session.state().consecutive_error_count, 2);

        transport.set_reply(json!({"r": {"indoorUnit": {"status": {"mode": "heat"}}}}));
        let clean = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert!(!clean.is_soft_failure());
        assert_eq!(session.state().consecutive_error_count, 0);
    }

    #[tokio::test]
    async fn test_persistent_fault_is_escalated() {
        let transport = FakeTransport::replying(json!({"_api_error": "serializer_error"}));
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock.clone());

        let mut reports = Vec::new();
        for _ in 0..3 {
            let result = session.query(&commands::indoor_unit_status()).await.unwrap();
            reports.push(result.fault.unwrap());
            clock.advance(TimeDelta::minutes(1));
        }

        assert!(!reports[0].persistent);
        assert!(!reports[1].persistent);
        assert!(reports[2].persistent);
        assert_eq!(reports[2].consecutive_errors, 3);
        assert_eq!(transport.reboot_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_reboot_still_counts() {
        let transport = FakeTransport::replying(no_memory_reply());
        transport.fail_reboots();
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock.clone());

        let first = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert!(matches!(first.fault.unwrap().reboot, RebootAction::Failed(_)));

        clock.advance(TimeDelta::minutes(5));
        let second = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert!(matches!(
            second.fault.unwrap().reboot,
            RebootAction::Throttled { .. }
        ));
        assert_eq!(transport.reboot_count(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_reboot_ack_keeps_key() {
        let transport = FakeTransport::replying(no_memory_reply());
        transport.garble_reboot_acks();
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock);

        let result = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert_eq!(result.fault.unwrap().reboot, RebootAction::Issued);
        assert!(!session.is_key_rejected());

        transport.set_reply(json!({"r": {"indoorUnit": {"status": {"mode": "cool"}}}}));
        let next = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert_eq!(next.response["r"]["indoorUnit"]["status"]["mode"], "cool");
        assert_eq!(transport.reboot_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_reboot_with_unreadable_ack_is_issued() {
        let transport = FakeTransport::replying(json!({"r": {}}));
        transport.garble_reboot_acks();
        let session = session(transport.clone(), ManualClock::starting_now());

        assert_eq!(session.reboot().await.unwrap(), RebootAction::Issued);
        assert!(!session.is_key_rejected());
    }

    #[tokio::test]
    async fn test_concurrent_faults_reboot_once() {
        let transport = FakeTransport::replying(no_memory_reply());
        let clock = ManualClock::starting_now();
        let session = Arc::new(session(transport.clone(), clock));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    session.query(&commands::indoor_unit_status()).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_soft_failure());
        }

        assert_eq!(transport.reboot_count(), 1);
        assert_eq!(session.state().consecutive_error_count, 5);
    }

    #[tokio::test]
    async fn test_command_rejected() {
        let transport = FakeTransport::replying(json!({"_api_error": "device_authentication_error"}));
        let session = session(transport.clone(), ManualClock::starting_now());

        let err = session
            .command(&commands::set_heat_setpoint(21.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceRejected(reason) if reason == "device_authentication_error"));
        assert_eq!(transport.reboot_count(), 0);

        let query = session.query(&commands::indoor_unit_status()).await.unwrap();
        assert!(!query.is_soft_failure());
    }

    #[tokio::test]
    async fn test_transport_error_is_device_unreachable() {
        let transport = FakeTransport::failing(Error::Timeout("no answer".into()));
        let session = session(transport, ManualClock::starting_now());

        let err = session.query(&commands::indoor_unit_status()).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnreachable { ref serial, .. } if serial == SERIAL));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_decryption_error_rejects_key_material() {
        let transport = FakeTransport::failing(Error::Decryption("bad padding".into()));
        let session = session(transport.clone(), ManualClock::starting_now());

        let err = session.query(&commands::indoor_unit_status()).await.unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
        assert!(session.is_key_rejected());

        let err = session.query(&commands::indoor_unit_status()).await.unwrap_err();
        assert!(matches!(err, Error::KeyMaterialRejected { .. }));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_reboot_respects_throttle() {
        let transport = FakeTransport::replying(json!({"r": {}}));
        let clock = ManualClock::starting_now();
        let session = session(transport.clone(), clock.clone());

        assert_eq!(session.reboot().await.unwrap(), RebootAction::Issued);
        clock.advance(TimeDelta::minutes(29));
        assert!(matches!(
            session.reboot().await.unwrap(),
            RebootAction::Throttled { .. }
        ));
        clock.advance(TimeDelta::minutes(2));
        assert_eq!(session.reboot().await.unwrap(), RebootAction::Issued);
        assert_eq!(transport.reboot_count(), 2);
    }

    #[test]
    fn test_unsupported_key_set_fails_construction() {
        let result = DeviceSession::new(
            DeviceIdentity::new(SERIAL, "0a1b2c3d4e5f60718293", Some("9".into())),
            "192.168.1.20",
            FakeTransport::replying(json!({})),
            ManualClock::starting_now(),
            RecoveryPolicy::default(),
        );
        assert!(matches!(result, Err(Error::UnsupportedKeyVersion(_))));
    }
}
