/*
[INPUT]:  Raw WebSocket text frames
[OUTPUT]: Parsed outer Envelope with routing fields extracted
[POS]:    WebSocket layer - message parsing and validation
[UPDATE]: When adding new envelope fields or venue formats
*/

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};

/// `arg` object echoed by pushes and subscribe acks
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelArg {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(rename = "instType", default, skip_serializing_if = "Option::is_none")]
    pub inst_type: Option<String>,
    #[serde(rename = "instId", default, skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
}

/// Outer frame of every inbound message.
///
/// Administrative replies carry `event`/`op` and usually `code`; data
/// pushes carry `arg` (or a flat `channel`/`symbol`) plus `data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub arg: Option<ChannelArg>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(skip)]
    pub raw: String,
}

impl Envelope {
    /// Decode a text frame; anything other than a JSON object is rejected
    pub fn decode(raw: &str) -> Result<Self> {
        let mut envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| StreamError::Decode(format!("invalid frame: {e}")))?;
        envelope.raw = raw.to_string();
        Ok(envelope)
    }

    /// Event name of an administrative reply (`event`, falling back to `op`)
    pub fn event_name(&self) -> Option<&str> {
        self.event.as_deref().or(self.op.as_deref())
    }

    pub fn channel(&self) -> Option<&str> {
        self.arg
            .as_ref()
            .and_then(|arg| arg.channel.as_deref())
            .or(self.channel.as_deref())
    }

    pub fn inst_id(&self) -> Option<&str> {
        self.arg
            .as_ref()
            .and_then(|arg| arg.inst_id.as_deref())
            .or(self.symbol.as_deref())
    }

    pub fn inst_type(&self) -> Option<&str> {
        self.arg.as_ref().and_then(|arg| arg.inst_type.as_deref())
    }

    /// Replies and acks go to the multiplexer, pushes to channel handlers
    pub fn is_admin(&self) -> bool {
        self.event.is_some() || self.op.is_some() || self.id.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|event| event.eq_ignore_ascii_case("error"))
            || self.code.as_deref().is_some_and(|code| code != "0")
    }

    /// Convert an error reply into `StreamError::Api`
    pub fn api_error(&self) -> StreamError {
        StreamError::Api {
            code: self.code.clone().unwrap_or_default(),
            message: self.msg.clone().unwrap_or_default(),
        }
    }

    /// Decode the `data` array into typed rows
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let Some(data) = &self.data else {
            return Err(StreamError::Decode(format!(
                "{} push without data",
                self.channel().unwrap_or("unknown")
            )));
        };
        Vec::<T>::deserialize(data)
            .map_err(|e| StreamError::Decode(format!("invalid data payload: {e}")))
    }
}

// Venues disagree on whether ids and codes are strings or numbers
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Serialized outbound operation: `{"op": ..., "args": [...]}`
#[derive(Debug, Clone, Serialize)]
pub struct OutboundRequest<'a, A: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    pub op: &'a str,
    pub args: A,
}

impl<'a, A: Serialize> OutboundRequest<'a, A> {
    pub fn new(op: &'a str, args: A) -> Self {
        Self { id: None, op, args }
    }

    pub fn with_id(mut self, id: &'a str) -> Self {
        self.id = Some(id);
        self
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_push_with_arg() {
        let raw = r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot","data":[{"asks":[],"bids":[]}]}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert!(!envelope.is_admin());
        assert_eq!(envelope.channel(), Some("books"));
        assert_eq!(envelope.inst_id(), Some("BTC-USDT"));
        assert_eq!(envelope.inst_type(), None);
        assert_eq!(envelope.action.as_deref(), Some("snapshot"));
        assert_eq!(envelope.raw, raw);
    }

    #[test]
    fn test_decode_flat_channel() {
        let envelope =
            Envelope::decode(r#"{"channel":"price","symbol":"BTC-USD","data":{"x":1}}"#).unwrap();
        assert_eq!(envelope.channel(), Some("price"));
        assert_eq!(envelope.inst_id(), Some("BTC-USD"));
    }

    #[test]
    fn test_decode_admin_reply() {
        let envelope =
            Envelope::decode(r#"{"event":"error","code":"60009","msg":"Login failed."}"#).unwrap();
        assert!(envelope.is_admin());
        assert!(envelope.is_error());
        assert_eq!(envelope.event_name(), Some("error"));
        assert!(matches!(
            envelope.api_error(),
            StreamError::Api { code, .. } if code == "60009"
        ));
    }

    #[test]
    fn test_numeric_code_and_id() {
        let envelope = Envelope::decode(r#"{"op":"order","id":42,"code":0,"data":[]}"#).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("42"));
        assert_eq!(envelope.code.as_deref(), Some("0"));
        assert!(!envelope.is_error());
        assert_eq!(envelope.event_name(), Some("order"));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(Envelope::decode("pong"), Err(StreamError::Decode(_))));
        assert!(matches!(Envelope::decode("[1,2]"), Err(StreamError::Decode(_))));
    }

    #[test]
    fn test_outbound_request_text() {
        let text = OutboundRequest::new("subscribe", vec![ChannelArg {
            channel: Some("tickers".to_string()),
            inst_type: None,
            inst_id: Some("BTC-USDT".to_string()),
        }])
        .to_text()
        .unwrap();
        assert_eq!(
            text,
            r#"{"op":"subscribe","args":[{"channel":"tickers","instId":"BTC-USDT"}]}"#
        );
    }
}
