//! JSON envelope codec and the typed records exchanged with a plug.
//!
//! The wire shape is whatever the device firmware defines; this module is the
//! only place that knows it. Outgoing commands are serialized from request
//! structs, incoming payloads are decoded once into reply structs and never
//! inspected as loose maps elsewhere.

use crate::config::ConnParams;
use crate::error::{ControlError, Result};
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Untyped envelope, a JSON object.
pub type Envelope = Map<String, Value>;

/// Number of switchable outlets on a plug.
pub const PLUG_COUNT: usize = 6;

const REPORT_COMMAND: &str = "device report";

/// Serialize a command into JSON bytes.
pub fn encode<T: Serialize + ?Sized>(fields: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(fields).map_err(|e| ControlError::Encoding(e.to_string()))
}

/// Decode a payload into a typed reply. The payload must be a JSON object.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let envelope = decode_map(data)?;
    serde_json::from_value(Value::Object(envelope))
        .map_err(|e| ControlError::Decoding(e.to_string()))
}

/// Decode a payload into the generic key/value mapping.
pub fn decode_map(data: &[u8]) -> Result<Envelope> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ControlError::Decoding(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(ControlError::Decoding(e.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// -------------------------------------------------------------------------
// Plug addressing
// -------------------------------------------------------------------------

/// Index of one outlet, always within `0..PLUG_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlugIndex(u8);

impl PlugIndex {
    pub fn new(index: i64) -> Result<Self> {
        if (0..PLUG_COUNT as i64).contains(&index) {
            Ok(Self(index as u8))
        } else {
            Err(ControlError::InvalidPlugIndex(index))
        }
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Envelope key of this outlet, e.g. `plug_3`.
    pub fn key(self) -> String {
        format!("plug_{}", self.0)
    }

    pub fn all() -> impl Iterator<Item = PlugIndex> {
        (0..PLUG_COUNT as u8).map(PlugIndex)
    }
}

impl TryFrom<i64> for PlugIndex {
    type Error = ControlError;

    fn try_from(index: i64) -> Result<Self> {
        Self::new(index)
    }
}

impl fmt::Display for PlugIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -------------------------------------------------------------------------
// Requests
// -------------------------------------------------------------------------

/// Discovery probe, `{"cmd":"device report"}`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRequest {
    cmd: &'static str,
}

impl Default for ReportRequest {
    fn default() -> Self {
        Self {
            cmd: REPORT_COMMAND,
        }
    }
}

/// Hands broker settings to an unprovisioned plug.
#[derive(Debug, Clone, Serialize)]
pub struct AdoptRequest {
    pub mac: String,
    pub setting: BrokerSetting,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerSetting {
    pub mqtt_uri: String,
    /// The firmware expects the port as a string.
    pub mqtt_port: String,
    pub mqtt_user: String,
    pub mqtt_password: String,
}

impl AdoptRequest {
    pub fn new(mac: &str, conn: &ConnParams) -> Self {
        Self {
            mac: mac.to_string(),
            setting: BrokerSetting {
                mqtt_uri: conn.host.clone(),
                mqtt_port: conn.port.to_string(),
                mqtt_user: conn.username.clone().unwrap_or_default(),
                mqtt_password: conn.password.clone().unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivateRequest {
    pub mac: String,
    pub lock: String,
}

/// Sets one outlet; serialized as `{"mac":..,"plug_<n>":{"on":0|1}}`.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub mac: String,
    pub plug: PlugIndex,
    pub on: bool,
}

#[derive(Serialize)]
struct PlugCommand {
    on: u8,
}

impl Serialize for SwitchRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("mac", &self.mac)?;
        map.serialize_entry(&self.plug.key(), &PlugCommand { on: u8::from(self.on) })?;
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeRequest {
    pub mac: String,
    pub setting: OtaSetting,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaSetting {
    pub ota: String,
}

impl UpgradeRequest {
    pub fn new(mac: &str, url: &str) -> Self {
        Self {
            mac: mac.to_string(),
            setting: OtaSetting {
                ota: url.to_string(),
            },
        }
    }
}

// -------------------------------------------------------------------------
// Replies
// -------------------------------------------------------------------------

/// Reply to a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceReport {
    pub mac: String,
    pub name: Option<String>,
    pub type_name: Option<String>,
    pub ip: Option<String>,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Type: {}, Name: {}, Mac: {}, IP: {}",
            self.type_name.as_deref().unwrap_or("-"),
            self.name.as_deref().unwrap_or("-"),
            self.mac,
            self.ip.as_deref().unwrap_or("-"),
        )
    }
}

/// Power as reported by the firmware, which sends it as text on some builds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Power {
    Number(f64),
    Text(String),
}

impl Power {
    pub fn watts(&self) -> Option<f64> {
        match self {
            Power::Number(w) => Some(*w),
            Power::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Power::Number(w) => write!(f, "{}", w),
            Power::Text(s) => f.write_str(s),
        }
    }
}

/// Sensor telemetry: power draw and uptime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PowerReading {
    pub power: Power,
    /// Uptime in seconds
    #[serde(deserialize_with = "whole_seconds")]
    pub total_time: u64,
}

fn whole_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Ok(secs.max(0.0) as u64)
}

impl fmt::Display for PowerReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Power: {}W, Uptime: {} seconds", self.power, self.total_time)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Number(f64),
}

#[derive(Deserialize)]
struct PlugReading {
    on: Flag,
}

impl PlugReading {
    fn is_on(&self) -> bool {
        match self.on {
            Flag::Bool(b) => b,
            Flag::Number(n) => n as i64 == 1,
        }
    }
}

#[derive(Deserialize)]
struct StateReport {
    plug_0: PlugReading,
    plug_1: PlugReading,
    plug_2: PlugReading,
    plug_3: PlugReading,
    plug_4: PlugReading,
    plug_5: PlugReading,
}

/// On/off flags of all outlets, indexed by [`PlugIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlugState([bool; PLUG_COUNT]);

impl<'de> Deserialize<'de> for PlugState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let r = StateReport::deserialize(deserializer)?;
        Ok(Self([
            r.plug_0.is_on(),
            r.plug_1.is_on(),
            r.plug_2.is_on(),
            r.plug_3.is_on(),
            r.plug_4.is_on(),
            r.plug_5.is_on(),
        ]))
    }
}

impl PlugState {
    pub fn new(flags: [bool; PLUG_COUNT]) -> Self {
        Self(flags)
    }

    pub fn is_on(&self, plug: PlugIndex) -> bool {
        self.0[plug.get()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlugIndex, bool)> + '_ {
        PlugIndex::all().zip(self.0.iter().copied())
    }
}

impl fmt::Display for PlugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (plug, on) in self.iter() {
            writeln!(f, "Plug {}: {}", plug, on)?;
        }
        Ok(())
    }
}

/// Upgrade telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OtaProgress {
    pub ota_progress: f64,
}

impl OtaProgress {
    pub fn is_complete(&self) -> bool {
        self.ota_progress >= 100.0
    }
}
