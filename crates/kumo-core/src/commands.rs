//! Builders for local adapter queries and commands.
//!
//! Payloads are plain [`serde_json::Value`]s; the session layer treats them as opaque.
//! Requests are nested objects under a top-level envelope key, e.g.
//! `{"c":{"indoorUnit":{"status":{}}}}`, and the adapter answers under `"r"`.
//!
//! # Example
//!
//! ```
//! use kumo_core::commands::{self, OperatingMode};
//!
//! let query = commands::indoor_unit_status();
//! assert_eq!(query.to_string(), r#"{"c":{"indoorUnit":{"status":{}}}}"#);
//!
//! let cmd = commands::set_mode(OperatingMode::Heat);
//! assert_eq!(cmd["c"]["indoorUnit"]["status"]["mode"], "heat");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// `endTime` the thermostat reports for a permanent hold.
pub const PERMANENT_HOLD_END_TIME: u64 = 3_774_499_593;

/// Top-level framing of local requests and responses.
///
/// Firmware generations may frame payloads differently; implementing this trait is
/// the only change a new framing needs.
pub trait Envelope: Send + Sync {
    /// Key wrapping a request body.
    fn request_key(&self) -> &'static str;

    /// Key wrapping a response body.
    fn response_key(&self) -> &'static str;

    /// Wraps a request body.
    fn wrap(&self, body: Value) -> Value {
        let mut map = Map::new();
        map.insert(self.request_key().to_string(), body);
        Value::Object(map)
    }

    /// Returns the response body, if present.
    fn open<'a>(&self, response: &'a Value) -> Option<&'a Value> {
        response.get(self.response_key())
    }
}

/// Framing used by current adapters: `"c"` for requests, `"r"` for responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactEnvelope;

impl Envelope for CompactEnvelope {
    fn request_key(&self) -> &'static str {
        "c"
    }

    fn response_key(&self) -> &'static str {
        "r"
    }
}

fn nest(key: &str, inner: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), inner);
    Value::Object(map)
}

/// Builds a query for the subtree at `path`, e.g. `["indoorUnit", "status"]`.
pub fn query_path(path: &[&str]) -> Value {
    let body = path
        .iter()
        .rev()
        .fold(json!({}), |inner, key| nest(key, inner));
    CompactEnvelope.wrap(body)
}

/// Builds a command setting `value` at `path`.
pub fn set_path(path: &[&str], value: Value) -> Value {
    let body = path
        .iter()
        .rev()
        .fold(value, |inner, key| nest(key, inner));
    CompactEnvelope.wrap(body)
}

/// Operating mode of an indoor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Off,
    Cool,
    Heat,
    Dry,
    Vent,
    Auto,
}

impl OperatingMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Off => "off",
            OperatingMode::Cool => "cool",
            OperatingMode::Heat => "heat",
            OperatingMode::Dry => "dry",
            OperatingMode::Vent => "vent",
            OperatingMode::Auto => "auto",
        }
    }

    /// All modes, in wire order.
    pub fn all() -> &'static [OperatingMode] {
        &[
            OperatingMode::Off,
            OperatingMode::Cool,
            OperatingMode::Heat,
            OperatingMode::Dry,
            OperatingMode::Vent,
            OperatingMode::Auto,
        ]
    }
}

/// Fan speed of an indoor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanSpeed {
    SuperQuiet,
    Quiet,
    Low,
    Powerful,
    SuperPowerful,
    Auto,
}

/// Vane (air direction) setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaneDirection {
    Horizontal,
    Midhorizontal,
    Midpoint,
    Midvertical,
    Vertical,
    Auto,
    Swing,
}

/// Current indoor unit status.
pub fn indoor_unit_status() -> Value {
    query_path(&["indoorUnit", "status"])
}

/// Indoor unit capabilities.
pub fn indoor_unit_profile() -> Value {
    query_path(&["indoorUnit", "profile"])
}

/// Adapter status, including `runState` and Wi-Fi details.
pub fn adapter_status() -> Value {
    query_path(&["adapter", "status"])
}

/// Wireless sensor at `index`. Sensors are numbered from 0.
pub fn sensor(index: u8) -> Value {
    let index = index.to_string();
    query_path(&["sensors", index.as_str()])
}

/// Status of an attached MHK2 thermostat.
pub fn mhk2_status() -> Value {
    query_path(&["mhk2", "status"])
}

/// Programmed schedule.
pub fn schedule() -> Value {
    query_path(&["indoorUnit", "schedule"])
}

/// Sets the operating mode.
pub fn set_mode(mode: OperatingMode) -> Value {
    set_path(&["indoorUnit", "status", "mode"], json!(mode))
}

/// Heating set point in degrees Celsius.
pub fn set_heat_setpoint(celsius: f64) -> Value {
    set_path(&["indoorUnit", "status", "spHeat"], json!(celsius))
}

/// Cooling set point in degrees Celsius.
pub fn set_cool_setpoint(celsius: f64) -> Value {
    set_path(&["indoorUnit", "status", "spCool"], json!(celsius))
}

/// Sets the fan speed.
pub fn set_fan_speed(speed: FanSpeed) -> Value {
    set_path(&["indoorUnit", "status", "fanSpeed"], json!(speed))
}

/// Sets the vane position. `swing` oscillates.
pub fn set_vane_direction(direction: VaneDirection) -> Value {
    set_path(&["indoorUnit", "status", "vaneDir"], json!(direction))
}

/// Sets the MHK2 hold end time (seconds since the epoch).
///
/// Use [`PERMANENT_HOLD_END_TIME`] for a permanent hold.
pub fn set_hold(end_time: u64) -> Value {
    set_path(&["mhk2", "hold", "adapter", "endTime"], json!(end_time))
}

/// Reboots the WiFi adapter.
pub fn reboot() -> Value {
    set_path(&["adapter", "status", "runState"], json!("reboot"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_shapes() {
        assert_eq!(
            indoor_unit_profile().to_string(),
            r#"{"c":{"indoorUnit":{"profile":{}}}}"#
        );
        assert_eq!(sensor(2).to_string(), r#"{"c":{"sensors":{"2":{}}}}"#);
        assert_eq!(mhk2_status().to_string(), r#"{"c":{"mhk2":{"status":{}}}}"#);
    }

    #[test]
    fn test_reboot_command() {
        assert_eq!(
            reboot().to_string(),
            r#"{"c":{"adapter":{"status":{"runState":"reboot"}}}}"#
        );
    }

    #[test]
    fn test_setters() {
        assert_eq!(
            set_fan_speed(FanSpeed::SuperQuiet)["c"]["indoorUnit"]["status"]["fanSpeed"],
            "superQuiet"
        );
        assert_eq!(
            set_vane_direction(VaneDirection::Midhorizontal)["c"]["indoorUnit"]["status"]
                ["vaneDir"],
            "midhorizontal"
        );
        assert_eq!(
            set_heat_setpoint(21.5)["c"]["indoorUnit"]["status"]["spHeat"],
            21.5
        );
        assert_eq!(
            set_hold(PERMANENT_HOLD_END_TIME)["c"]["mhk2"]["hold"]["adapter"]["endTime"],
            3_774_499_593u64
        );
    }

    #[test]
    fn test_envelope_open() {
        let response = json!({"r": {"indoorUnit": {"status": {"mode": "cool"}}}});
        let body = CompactEnvelope.open(&response).unwrap();
        assert_eq!(body["indoorUnit"]["status"]["mode"], "cool");
        assert!(CompactEnvelope.open(&json!({"x": 1})).is_none());
    }

    #[test]
    fn test_mode_names_match_serde() {
        for mode in OperatingMode::all() {
            assert_eq!(json!(mode), mode.as_str());
        }
    }
}
