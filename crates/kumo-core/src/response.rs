//! Typed views over adapter responses.
//!
//! Adapters answer under `"r"` with the requested subtree, e.g.
//! `{"r":{"indoorUnit":{"status":{"mode":"heat","roomTemp":20.5}}}}`. Fields are
//! optional because adapters omit what they do not support.
//!
//! # Example
//!
//! ```
//! use kumo_core::response::IndoorUnitStatus;
//! use serde_json::json;
//!
//! let response = json!({"r": {"indoorUnit": {"status": {"mode": "cool", "spCool": 24.0}}}});
//! let status = IndoorUnitStatus::from_response(&response).unwrap();
//! assert_eq!(status.sp_cool, Some(24.0));
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    commands::{CompactEnvelope, Envelope, FanSpeed, OperatingMode, VaneDirection},
    error::Error,
};

fn extract<T: DeserializeOwned>(response: &Value, path: &[&str]) -> Result<T, Error> {
    let mut node = CompactEnvelope
        .open(response)
        .ok_or_else(|| Error::Protocol("response has no \"r\" body".into()))?;
    for key in path {
        node = node
            .get(key)
            .ok_or_else(|| Error::Protocol(format!("response is missing {}", path.join("."))))?;
    }
    Ok(serde_json::from_value(node.clone())?)
}

/// Indoor unit status from `{"c":{"indoorUnit":{"status":{}}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndoorUnitStatus {
    /// Operating mode, as reported.
    pub mode: Option<String>,
    /// Unit is idle in its current mode.
    pub standby: Option<bool>,
    /// Heating set point, Celsius.
    pub sp_heat: Option<f64>,
    /// Cooling set point, Celsius.
    pub sp_cool: Option<f64>,
    /// Room temperature, Celsius.
    pub room_temp: Option<f64>,
    pub fan_speed: Option<String>,
    pub vane_dir: Option<String>,
    pub filter_dirty: Option<bool>,
    pub defrost: Option<bool>,
}

impl IndoorUnitStatus {
    /// Parses a full adapter response.
    pub fn from_response(response: &Value) -> Result<Self, Error> {
        extract(response, &["indoorUnit", "status"])
    }

    /// Operating mode, if it is one this client knows.
    pub fn operating_mode(&self) -> Option<OperatingMode> {
        self.mode
            .as_deref()
            .and_then(|m| serde_json::from_value(Value::String(m.to_string())).ok())
    }

    pub fn fan_speed(&self) -> Option<FanSpeed> {
        self.fan_speed
            .as_deref()
            .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
    }

    pub fn vane_direction(&self) -> Option<VaneDirection> {
        self.vane_dir
            .as_deref()
            .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
    }
}

/// Indoor unit capabilities from `{"c":{"indoorUnit":{"profile":{}}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndoorUnitProfile {
    pub number_of_fan_speeds: Option<u8>,
    pub has_fan_speed_auto: Option<bool>,
    pub has_vane_swing: Option<bool>,
    pub has_vane_dir: Option<bool>,
    pub has_mode_dry: Option<bool>,
    pub has_mode_heat: Option<bool>,
    pub has_mode_vent: Option<bool>,
    pub has_mode_auto: Option<bool>,
}

impl IndoorUnitProfile {
    pub fn from_response(response: &Value) -> Result<Self, Error> {
        extract(response, &["indoorUnit", "profile"])
    }
}

/// Adapter status from `{"c":{"adapter":{"status":{}}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    /// Adapter run state, e.g. `"normal"`.
    pub run_state: Option<String>,
    /// Auto mode disabled by the installer.
    pub auto_mode_prevention: Option<bool>,
    pub user_has_mode_dry: Option<bool>,
    pub user_has_mode_heat: Option<bool>,
    /// Raw network details; only the station RSSI is interpreted.
    pub local_network: Option<Value>,
}

impl AdapterStatus {
    pub fn from_response(response: &Value) -> Result<Self, Error> {
        extract(response, &["adapter", "status"])
    }

    /// Wi-Fi signal strength of the adapter, in dBm.
    pub fn wifi_rssi(&self) -> Option<f64> {
        self.local_network
            .as_ref()?
            .get("stationMode")?
            .get("RSSI")?
            .as_f64()
    }
}
