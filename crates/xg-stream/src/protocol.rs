//! Combined stream wire format.
//!
//! Outbound method call:
//!
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m"], "id": 1}
//! ```
//!
//! Inbound frames take one of three shapes:
//!
//! ```json
//! {"result": null, "id": 1}
//! {"error": {"code": 2, "msg": "Invalid request"}, "id": 1}
//! {"stream": "btcusdt@kline_1m", "data": {...}}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use xg_core::{Result, XgError};

pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
pub const LIST_SUBSCRIPTIONS: &str = "LIST_SUBSCRIPTIONS";
pub const SET_PROPERTY: &str = "SET_PROPERTY";
pub const GET_PROPERTY: &str = "GET_PROPERTY";

/// A method call sent to the exchange.
///
/// `id` is assigned by the transport; 0 means no reply is correlated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u64,
}

impl OutboundMessage {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: 0,
        }
    }
}

fn is_zero(id: &u64) -> bool {
    *id == 0
}

/// Structured error object returned for a failed method call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireError {
    #[serde(alias = "Code")]
    pub code: i64,
    #[serde(alias = "Msg", default)]
    pub msg: String,
}

impl From<WireError> for XgError {
    fn from(e: WireError) -> Self {
        XgError::Method {
            code: e.code,
            msg: e.msg,
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// The exchange rejected a call. Without an id the error is unaddressable.
    MethodError { id: Option<u64>, error: WireError },
    /// Reply to the call with this id.
    MethodResult { id: u64, result: Value },
    /// Market data for a subscribed channel; `data` is the raw JSON payload.
    Push { stream: String, data: Vec<u8> },
    /// Valid JSON object matching none of the shapes above.
    Unrecognized(String),
}

#[derive(Deserialize)]
struct RawFrame<'a> {
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    stream: Option<String>,
    /// `Some` whenever the key is present, including `"data": null`.
    #[serde(default, borrow, deserialize_with = "present")]
    data: Option<&'a RawValue>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<&'de RawValue>, D::Error>
where
    D: Deserializer<'de>,
{
    <&'de RawValue>::deserialize(deserializer).map(Some)
}

impl InboundMessage {
    /// Decode and classify a frame. Malformed frames are a
    /// [`XgError::Protocol`] error, which is fatal for the stream.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: RawFrame<'_> = serde_json::from_slice(bytes)
            .map_err(|e| XgError::Protocol(format!("undecodable frame: {e}")))?;

        let id = frame.id.filter(|id| *id != 0);

        if let Some(error) = frame.error {
            return Ok(InboundMessage::MethodError { id, error });
        }

        if let Some(id) = id {
            return Ok(InboundMessage::MethodResult {
                id,
                result: frame.result.unwrap_or(Value::Null),
            });
        }

        if let Some(stream) = frame.stream {
            let data = frame
                .data
                .ok_or_else(|| XgError::Protocol(format!("push on {stream} without data")))?;
            return Ok(InboundMessage::Push {
                stream,
                data: data.get().as_bytes().to_vec(),
            });
        }

        Ok(InboundMessage::Unrecognized(
            String::from_utf8_lossy(bytes).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_serializes_wire_shape() {
        let mut msg = OutboundMessage::new(SUBSCRIBE, vec![json!("btcusdt@kline_1m")]);
        msg.id = 7;
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m"], "id": 7})
        );

        let bare = OutboundMessage::new(LIST_SUBSCRIPTIONS, vec![]);
        assert_eq!(
            serde_json::to_string(&bare).unwrap(),
            r#"{"method":"LIST_SUBSCRIPTIONS"}"#
        );
    }

    #[test]
    fn decodes_null_result() {
        let msg = InboundMessage::decode(br#"{"result":null,"id":3}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::MethodResult {
                id: 3,
                result: Value::Null
            }
        );
    }

    #[test]
    fn decodes_method_error_in_either_case() {
        let lower = InboundMessage::decode(br#"{"error":{"code":2,"msg":"Invalid request"},"id":5}"#)
            .unwrap();
        let upper = InboundMessage::decode(br#"{"error":{"Code":2,"Msg":"Invalid request"},"id":5}"#)
            .unwrap();
        let expected = InboundMessage::MethodError {
            id: Some(5),
            error: WireError {
                code: 2,
                msg: "Invalid request".into(),
            },
        };
        assert_eq!(lower, expected);
        assert_eq!(upper, expected);
    }

    #[test]
    fn error_without_id_is_unaddressable() {
        let msg = InboundMessage::decode(br#"{"error":{"code":3,"msg":"bad"},"id":null}"#).unwrap();
        assert!(matches!(msg, InboundMessage::MethodError { id: None, .. }));
    }

    #[test]
    fn push_keeps_raw_payload() {
        let msg = InboundMessage::decode(
            br#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"c":"0.0010"}}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Push {
                stream: "btcusdt@kline_1m".into(),
                data: br#"{"e":"kline","k":{"c":"0.0010"}}"#.to_vec(),
            }
        );
    }

    #[test]
    fn push_with_null_data_delivers_null() {
        let msg = InboundMessage::decode(br#"{"stream":"x","data":null}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Push {
                stream: "x".into(),
                data: b"null".to_vec(),
            }
        );
    }

    #[test]
    fn unknown_shape_is_not_an_error() {
        let msg = InboundMessage::decode(br#"{"hello":"world"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Unrecognized(_)));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        let frames: [&[u8]; 4] = [b"not json", b"[1,2,3]", br#"{"stream":"x"}"#, br#"{"id":"abc"}"#];
        for frame in frames {
            let err = InboundMessage::decode(frame).unwrap_err();
            assert!(matches!(err, XgError::Protocol(_)), "{frame:?} → {err:?}");
        }
    }

    #[test]
    fn wire_error_maps_to_method_error() {
        let err: XgError = WireError {
            code: 1,
            msg: "Invalid value type".into(),
        }
        .into();
        assert_eq!(
            err,
            XgError::Method {
                code: 1,
                msg: "Invalid value type".into()
            }
        );
    }
}
