use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AzmError;

/// Parameter name, e.g. `ZoneGain_0`. Opaque to the client.
pub type ParameterName = String;

/// Protocol-level type marker dictating which JSON field carries a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// Numeric value (`val`)
    Val,
    /// String value (`str`)
    Str,
    /// Percentage 0..100 (`pct`)
    Pct,
}

impl FormatTag {
    /// All tags, in wire lookup order
    pub const ALL: [FormatTag; 3] = [FormatTag::Val, FormatTag::Str, FormatTag::Pct];

    /// JSON key used for this format
    pub fn key(self) -> &'static str {
        match self {
            FormatTag::Val => "val",
            FormatTag::Str => "str",
            FormatTag::Pct => "pct",
        }
    }

    /// Whether `value` has the JSON type this format carries
    pub fn accepts(self, value: &ParameterValue) -> bool {
        matches!(
            (self, value),
            (FormatTag::Str, ParameterValue::Text(_))
                | (FormatTag::Val | FormatTag::Pct, ParameterValue::Number(_))
        )
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FormatTag {
    type Err = AzmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "val" => Ok(FormatTag::Val),
            "str" => Ok(FormatTag::Str),
            "pct" => Ok(FormatTag::Pct),
            other => Err(AzmError::Protocol(format!("unknown format tag: {}", other))),
        }
    }
}

/// Parameter value as carried on the wire
///
/// Whole numbers serialize without a fractional part (`3`, not `3.0`), since
/// source indices and mute flags are integer parameters on the device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// `val` or `pct` payload
    Number(f64),
    /// `str` payload
    Text(String),
}

impl ParameterValue {
    /// Numeric payload, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(n) => Some(*n),
            ParameterValue::Text(_) => None,
        }
    }

    /// Text payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Number(_) => None,
            ParameterValue::Text(s) => Some(s),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Number(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Number(f64::from(value))
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Number(if value { 1.0 } else { 0.0 })
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl Serialize for ParameterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParameterValue::Number(n) if is_integral(*n) => serializer.serialize_i64(*n as i64),
            ParameterValue::Number(n) => serializer.serialize_f64(*n),
            ParameterValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

fn is_integral(n: f64) -> bool {
    // i64::MAX as f64 rounds up to 2^63, which no longer fits
    n.is_finite() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Number(n) => write!(f, "{}", n),
            ParameterValue::Text(s) => f.write_str(s),
        }
    }
}

/// One entry of a `params` object or array.
///
/// With a value it serializes as `{"param": name, <fmt>: value}` (set, bmp,
/// update, getResp); without one as `{"param": name, "fmt": <fmt>}` (sub,
/// unsub, get).
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub param: ParameterName,
    pub format: FormatTag,
    pub value: Option<ParameterValue>,
}

impl ParamEntry {
    /// Entry naming a parameter and format only
    pub fn format_only(param: impl Into<ParameterName>, format: FormatTag) -> Self {
        Self {
            param: param.into(),
            format,
            value: None,
        }
    }

    /// Entry carrying a value under `format`
    pub fn with_value(
        param: impl Into<ParameterName>,
        format: FormatTag,
        value: impl Into<ParameterValue>,
    ) -> Self {
        Self {
            param: param.into(),
            format,
            value: Some(value.into()),
        }
    }
}

impl Serialize for ParamEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("param", &self.param)?;
        match &self.value {
            Some(value) => map.serialize_entry(self.format.key(), value)?,
            None => map.serialize_entry("fmt", &self.format)?,
        }
        map.end()
    }
}

/// Value change delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub param: ParameterName,
    pub format: FormatTag,
    pub value: ParameterValue,
}

/// Non-fatal error reported by the device
///
/// Errors answering a pending request go to its caller instead; only errors
/// nobody is waiting for reach the error stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceError {
    pub message: String,
    /// Request the error answers, when that request already timed out or failed
    pub id: Option<u64>,
}

/// State of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// How updates for a subscription are expected to arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed over the TCP control channel
    Control,
    /// Pushed over the UDP meter channel
    Meter,
}

/// Identifies one subscriber of a (parameter, format) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tag_checks_value_type() {
        assert!(FormatTag::Val.accepts(&ParameterValue::Number(-20.0)));
        assert!(FormatTag::Pct.accepts(&ParameterValue::Number(50.0)));
        assert!(FormatTag::Str.accepts(&"Lobby".into()));
        assert!(!FormatTag::Str.accepts(&ParameterValue::Number(1.0)));
        assert!(!FormatTag::Val.accepts(&"loud".into()));
    }

    #[test]
    fn entry_serializes_value_under_format_key() {
        let entry = ParamEntry::with_value("ZoneGain_0", FormatTag::Val, -20.5);
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"param":"ZoneGain_0","val":-20.5}"#
        );

        let entry = ParamEntry::format_only("ZoneName_1", FormatTag::Str);
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"param":"ZoneName_1","fmt":"str"}"#
        );
    }

    #[test]
    fn whole_numbers_serialize_as_integers() {
        let entry = ParamEntry::with_value("ZoneSource_0", FormatTag::Val, 3);
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"param":"ZoneSource_0","val":3}"#
        );
        let entry = ParamEntry::with_value("ZoneMute_0", FormatTag::Val, true);
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"param":"ZoneMute_0","val":1}"#
        );
        assert_eq!(serde_json::to_string(&ParameterValue::Number(-20.0)).unwrap(), "-20");
        assert_eq!(serde_json::to_string(&ParameterValue::Number(-0.5)).unwrap(), "-0.5");
    }

    #[test]
    fn bool_becomes_numeric() {
        assert_eq!(ParameterValue::from(true), ParameterValue::Number(1.0));
        assert_eq!(ParameterValue::from(false), ParameterValue::Number(0.0));
    }
}
