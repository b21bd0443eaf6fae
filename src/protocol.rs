//! JSON-RPC 2.0 message model for the AZM control protocol.
//!
//! One JSON value per line. Outbound requests carry `params` as a single
//! object or an array of objects; both shapes normalize to [`Params`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AzmError, Result};
use crate::types::{DeviceError, FormatTag, ParamEntry, ParameterValue};

const JSONRPC_VERSION: &str = "2.0";

/// Protocol methods
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Set,
    Bmp,
    Sub,
    Unsub,
    Get,
    Update,
    GetResp,
    Error,
    Result,
}

impl Method {
    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Set => "set",
            Method::Bmp => "bmp",
            Method::Sub => "sub",
            Method::Unsub => "unsub",
            Method::Get => "get",
            Method::Update => "update",
            Method::GetResp => "getResp",
            Method::Error => "error",
            Method::Result => "result",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        let method = match name {
            "set" => Method::Set,
            "bmp" => Method::Bmp,
            "sub" => Method::Sub,
            "unsub" => Method::Unsub,
            "get" => Method::Get,
            "update" => Method::Update,
            "getResp" => Method::GetResp,
            "error" => Method::Error,
            "result" => Method::Result,
            _ => return None,
        };
        Some(method)
    }
}

/// `params` payload: one object or a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    Single(ParamEntry),
    Batch(Vec<ParamEntry>),
}

impl Params {
    /// Use the single-object form for one entry, the array form otherwise
    pub fn from_entries(mut entries: Vec<ParamEntry>) -> Self {
        if entries.len() == 1 {
            if let Some(entry) = entries.pop() {
                return Params::Single(entry);
            }
        }
        Params::Batch(entries)
    }

    /// Normalized view over both shapes
    pub fn entries(&self) -> &[ParamEntry] {
        match self {
            Params::Single(entry) => std::slice::from_ref(entry),
            Params::Batch(entries) => entries,
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub params: Params,
    /// Present when an explicit `{"result":"OK","id":N}` reply is wanted
    pub id: Option<u64>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    method: Method,
    params: &'a Params,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

impl Request {
    /// Create a fire-and-forget request
    pub fn new(method: Method, params: Params) -> Self {
        Self {
            method,
            params,
            id: None,
        }
    }

    /// Ask the device to acknowledge with `id`
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Serialize to a single JSON line, without the terminator
    pub fn encode(&self) -> Result<String> {
        let wire = WireRequest {
            jsonrpc: JSONRPC_VERSION,
            method: self.method,
            params: &self.params,
            id: self.id,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Outbound-style request (`set`, `bmp`, `sub`, `unsub`, `get`)
    Request(Request),
    /// Pushed change on a subscribed parameter
    Update(Vec<ParamEntry>),
    /// Reply to a `get`
    GetResp(Vec<ParamEntry>),
    /// Reply correlated by id; `error` is set for anything but `"OK"`
    Response { id: u64, error: Option<String> },
    /// Uncorrelated device error
    DeviceError(DeviceError),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
}

/// Decode one JSON line into a [`Message`]
pub fn decode_message(line: &str) -> Result<Message> {
    let raw: RawMessage = serde_json::from_str(line)
        .map_err(|e| AzmError::Protocol(format!("malformed frame: {}", e)))?;
    let id = raw.id.as_ref().and_then(Value::as_u64);

    let Some(name) = raw.method.as_deref() else {
        return match (id, raw.result, raw.error) {
            (Some(id), _, Some(error)) => Ok(Message::Response {
                id,
                error: Some(error_message(&error)),
            }),
            (Some(id), Some(result), None) => Ok(Message::Response {
                id,
                error: result_error(&result),
            }),
            // `"id": null`, e.g. the device could not parse our request
            (None, _, Some(error)) => Ok(Message::DeviceError(DeviceError {
                message: error_message(&error),
                id: None,
            })),
            _ => Err(AzmError::Protocol("unclassified frame".to_string())),
        };
    };

    let method = Method::from_name(name)
        .ok_or_else(|| AzmError::Protocol(format!("unknown method: {}", name)))?;

    match method {
        Method::Update => Ok(Message::Update(parse_entries(raw.params.as_ref()))),
        Method::GetResp => Ok(Message::GetResp(parse_entries(raw.params.as_ref()))),
        Method::Error => {
            let message = raw
                .params
                .as_ref()
                .or(raw.error.as_ref())
                .map(error_message)
                .unwrap_or_else(|| "unspecified device error".to_string());
            match id {
                Some(id) => Ok(Message::Response {
                    id,
                    error: Some(message),
                }),
                None => Ok(Message::DeviceError(DeviceError { message, id: None })),
            }
        }
        Method::Result => {
            let id = id.ok_or_else(|| AzmError::Protocol("result without id".to_string()))?;
            let result = raw.result.or(raw.params).unwrap_or(Value::Null);
            Ok(Message::Response {
                id,
                error: result_error(&result),
            })
        }
        Method::Set | Method::Bmp | Method::Sub | Method::Unsub | Method::Get => {
            Ok(Message::Request(Request {
                method,
                params: Params::from_entries(parse_entries(raw.params.as_ref())),
                id,
            }))
        }
    }
}

fn result_error(result: &Value) -> Option<String> {
    if result.as_str() == Some("OK") {
        None
    } else {
        Some(format!("unexpected result: {}", result))
    }
}

fn error_message(value: &Value) -> String {
    if let Some(text) = value.as_str() {
        return text.to_string();
    }
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Parse `params` leniently: invalid entries are logged and skipped
fn parse_entries(params: Option<&Value>) -> Vec<ParamEntry> {
    let items: Vec<&Value> = match params {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match parse_entry(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping param entry {}: {}", item, e);
                None
            }
        })
        .collect()
}

fn parse_entry(item: &Value) -> Result<ParamEntry> {
    let obj = item
        .as_object()
        .ok_or_else(|| AzmError::Protocol("param entry is not an object".to_string()))?;

    let param = obj
        .get("param")
        .and_then(Value::as_str)
        .ok_or_else(|| AzmError::Protocol("param entry without name".to_string()))?;

    for format in FormatTag::ALL {
        let Some(raw) = obj.get(format.key()) else {
            continue;
        };
        let value = match (format, raw) {
            (FormatTag::Str, Value::String(s)) => ParameterValue::Text(s.clone()),
            (FormatTag::Val | FormatTag::Pct, Value::Number(n)) => n
                .as_f64()
                .map(ParameterValue::Number)
                .ok_or_else(|| AzmError::Protocol(format!("unrepresentable number {}", n)))?,
            _ => {
                return Err(AzmError::Protocol(format!(
                    "{} carries the wrong type: {}",
                    format, raw
                )))
            }
        };
        return Ok(ParamEntry::with_value(param, format, value));
    }

    let format = obj
        .get("fmt")
        .and_then(Value::as_str)
        .ok_or_else(|| AzmError::Protocol(format!("{} has neither value nor fmt", param)))?
        .parse()?;

    Ok(ParamEntry::format_only(param, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(request: &Request) -> Request {
        match decode_message(&request.encode().unwrap()).unwrap() {
            Message::Request(decoded) => decoded,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn encodes_single_set_with_id() {
        let request = Request::new(
            Method::Set,
            Params::Single(ParamEntry::with_value("ZoneGain_0", FormatTag::Val, -20.0)),
        )
        .with_id(7);

        assert_eq!(
            request.encode().unwrap(),
            r#"{"jsonrpc":"2.0","method":"set","params":{"param":"ZoneGain_0","val":-20},"id":7}"#
        );
    }

    #[test]
    fn encodes_batch_subscription_without_id() {
        let request = Request::new(
            Method::Sub,
            Params::Batch(vec![
                ParamEntry::format_only("ZoneName_0", FormatTag::Str),
                ParamEntry::format_only("ZoneGain_0", FormatTag::Val),
            ]),
        );

        assert_eq!(
            request.encode().unwrap(),
            r#"{"jsonrpc":"2.0","method":"sub","params":[{"param":"ZoneName_0","fmt":"str"},{"param":"ZoneGain_0","fmt":"val"}]}"#
        );
    }

    fn param_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex(r"(Zone|Source|Mix)(Gain|Mute|Name)_[0-9]{1,2}").unwrap()
    }

    /// Whole numbers and one-decimal values, which survive the JSON text form exactly
    fn valued_entry_strategy() -> impl Strategy<Value = ParamEntry> {
        let value = prop_oneof![
            (-100_000i64..100_000)
                .prop_map(|n| (FormatTag::Val, ParameterValue::Number(n as f64))),
            (-6_000i64..6_000)
                .prop_map(|n| (FormatTag::Val, ParameterValue::Number(n as f64 / 10.0))),
            (0i64..=1_000)
                .prop_map(|n| (FormatTag::Pct, ParameterValue::Number(n as f64 / 10.0))),
            "\\PC{0,24}".prop_map(|s| (FormatTag::Str, ParameterValue::Text(s))),
        ];
        (param_strategy(), value)
            .prop_map(|(param, (format, value))| ParamEntry::with_value(param, format, value))
    }

    fn format_entry_strategy() -> impl Strategy<Value = ParamEntry> {
        (param_strategy(), 0..FormatTag::ALL.len())
            .prop_map(|(param, format)| ParamEntry::format_only(param, FormatTag::ALL[format]))
    }

    /// A single entry is always sent in object form, so batches hold at least two
    fn params_strategy(entry: BoxedStrategy<ParamEntry>) -> impl Strategy<Value = Params> {
        prop_oneof![
            entry.clone().prop_map(Params::Single),
            prop::collection::vec(entry, 2..5).prop_map(Params::Batch),
        ]
    }

    fn request_strategy() -> impl Strategy<Value = Request> {
        let valued = (
            prop_oneof![Just(Method::Set), Just(Method::Bmp)],
            params_strategy(valued_entry_strategy().boxed()),
        );
        let format_only = (
            prop_oneof![Just(Method::Sub), Just(Method::Unsub), Just(Method::Get)],
            params_strategy(format_entry_strategy().boxed()),
        );
        (prop_oneof![valued, format_only], prop::option::of(1u64..1_000_000)).prop_map(
            |((method, params), id)| {
                let request = Request::new(method, params);
                match id {
                    Some(id) => request.with_id(id),
                    None => request,
                }
            },
        )
    }

    proptest! {
        #[test]
        fn request_roundtrip_preserves_content(request in request_strategy()) {
            prop_assert_eq!(roundtrip(&request), request);
        }
    }

    #[test]
    fn decodes_get_resp_object_and_array() {
        let array = decode_message(
            r#"{"jsonrpc":"2.0","method":"getResp","params":[{"param":"ZoneGain_0","val":-20}]}"#,
        )
        .unwrap();
        assert_eq!(
            array,
            Message::GetResp(vec![ParamEntry::with_value("ZoneGain_0", FormatTag::Val, -20.0)])
        );

        let object = decode_message(
            r#"{"jsonrpc":"2.0","method":"update","params":{"param":"ZoneName_2","str":"Bar"}}"#,
        )
        .unwrap();
        assert_eq!(
            object,
            Message::Update(vec![ParamEntry::with_value("ZoneName_2", FormatTag::Str, "Bar")])
        );
    }

    #[test]
    fn skips_invalid_entries_but_keeps_the_rest() {
        let message = decode_message(
            r#"{"jsonrpc":"2.0","method":"update","params":[{"val":1},{"param":"A_0","str":3},{"param":"B_0","pct":55}]}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            Message::Update(vec![ParamEntry::with_value("B_0", FormatTag::Pct, 55.0)])
        );
    }

    #[test]
    fn decodes_results_and_errors() {
        assert_eq!(
            decode_message(r#"{"jsonrpc":"2.0","result":"OK","id":3}"#).unwrap(),
            Message::Response { id: 3, error: None }
        );
        assert_eq!(
            decode_message(r#"{"jsonrpc":"2.0","method":"result","params":"OK","id":4}"#).unwrap(),
            Message::Response { id: 4, error: None }
        );
        assert!(matches!(
            decode_message(r#"{"jsonrpc":"2.0","result":"FAIL","id":5}"#).unwrap(),
            Message::Response { id: 5, error: Some(_) }
        ));
        assert_eq!(
            decode_message(r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":6}"#)
                .unwrap(),
            Message::Response {
                id: 6,
                error: Some("Invalid params".to_string())
            }
        );
        assert_eq!(
            decode_message(
                r#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"},"id":null}"#
            )
            .unwrap(),
            Message::DeviceError(DeviceError {
                message: "Parse error".to_string(),
                id: None
            })
        );
        assert_eq!(
            decode_message(r#"{"jsonrpc":"2.0","method":"error","params":{"message":"Out of range"}}"#)
                .unwrap(),
            Message::DeviceError(DeviceError {
                message: "Out of range".to_string(),
                id: None
            })
        );
    }

    #[test]
    fn rejects_malformed_and_unclassified_frames() {
        assert!(matches!(decode_message("{not json"), Err(AzmError::Protocol(_))));
        assert!(matches!(
            decode_message(r#"{"jsonrpc":"2.0","method":"reboot"}"#),
            Err(AzmError::Protocol(_))
        ));
        assert!(matches!(
            decode_message(r#"{"jsonrpc":"2.0"}"#),
            Err(AzmError::Protocol(_))
        ));
    }
}
