//! JSON hub protocol framing.
//!
//! Every message is a JSON object followed by the record separator `0x1E`;
//! one WebSocket text frame may carry several. The connection starts with a
//! handshake request (`{"protocol":"json","version":1}`) answered by `{}` or
//! `{"error": "..."}`.
//!
//! | `type` | Message      | Handled as                       |
//! |--------|--------------|----------------------------------|
//! | 1      | Invocation   | [`HubMessage::Invocation`]       |
//! | 6      | Ping         | [`HubMessage::Ping`]             |
//! | 7      | Close        | [`HubMessage::Close`]            |
//! | other  | Completion…  | [`HubMessage::Other`] (ignored)  |

use serde_json::{json, Value};

use crate::error::ParseError;

/// Record separator terminating every message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u64 = 1;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    Other(u64),
}

impl HubMessage {
    /// Fire-and-forget invocation (no invocation id, no completion expected).
    pub fn invoke(target: &str, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            target: target.to_string(),
            arguments,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            HubMessage::Invocation { target, arguments } => json!({
                "type": TYPE_INVOCATION,
                "target": target,
                "arguments": arguments,
            }),
            HubMessage::Ping => json!({ "type": TYPE_PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut v = json!({ "type": TYPE_CLOSE, "allowReconnect": allow_reconnect });
                if let Some(e) = error {
                    v["error"] = json!(e);
                }
                v
            }
            HubMessage::Other(t) => json!({ "type": t }),
        }
    }

    pub fn from_json(v: &Value) -> Result<Self, ParseError> {
        let msg_type = v["type"]
            .as_u64()
            .ok_or_else(|| ParseError::new("hub.type", "missing or not a number"))?;
        Ok(match msg_type {
            TYPE_INVOCATION => {
                let target = v["target"]
                    .as_str()
                    .ok_or_else(|| ParseError::new("hub.target", "missing"))?
                    .to_string();
                let arguments = v["arguments"].as_array().cloned().unwrap_or_default();
                HubMessage::Invocation { target, arguments }
            }
            TYPE_PING => HubMessage::Ping,
            TYPE_CLOSE => HubMessage::Close {
                error: v["error"].as_str().map(String::from),
                allow_reconnect: v["allowReconnect"].as_bool().unwrap_or(true),
            },
            other => HubMessage::Other(other),
        })
    }
}

/// Serialize a message with its trailing record separator.
pub fn encode(msg: &HubMessage) -> String {
    let mut text = msg.to_json().to_string();
    text.push(RECORD_SEPARATOR);
    text
}

/// Split a text frame into its messages. A malformed record is returned as
/// an error in place; the others still decode.
pub fn decode_frame(text: &str) -> Vec<Result<HubMessage, ParseError>> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            serde_json::from_str::<Value>(record)
                .map_err(|e| ParseError::new("hub.frame", e.to_string()))
                .and_then(|v| HubMessage::from_json(&v))
        })
        .collect()
}

/// The handshake request sent right after the socket opens.
pub fn handshake_request() -> String {
    let mut text = json!({ "protocol": "json", "version": 1 }).to_string();
    text.push(RECORD_SEPARATOR);
    text
}

/// Parse the handshake response. `Err` carries the server's reason.
///
/// Returns the remainder of the frame: servers may pack the first messages
/// into the same frame as the handshake response.
pub fn parse_handshake_response(text: &str) -> Result<&str, String> {
    let (head, rest) = text
        .split_once(RECORD_SEPARATOR)
        .ok_or_else(|| "handshake response not terminated".to_string())?;
    let v: Value =
        serde_json::from_str(head).map_err(|e| format!("invalid handshake response: {e}"))?;
    match v.get("error").and_then(Value::as_str) {
        Some(err) => Err(err.to_string()),
        None => Ok(rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_encodes_with_separator() {
        let text = encode(&HubMessage::invoke("JoinRunGroup", vec![json!("42")]));
        assert!(text.ends_with(RECORD_SEPARATOR));
        let v: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(v["type"], 1);
        assert_eq!(v["target"], "JoinRunGroup");
        assert_eq!(v["arguments"][0], "42");
    }

    #[test]
    fn frame_with_several_records() {
        let frame = format!(
            "{}{}{}",
            encode(&HubMessage::Ping),
            encode(&HubMessage::invoke("ReceiveLog", vec![json!("line")])),
            "{\"type\":3,\"invocationId\":\"1\"}\u{1e}"
        );
        let msgs: Vec<_> = decode_frame(&frame).into_iter().map(Result::unwrap).collect();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], HubMessage::Ping);
        assert!(matches!(&msgs[1], HubMessage::Invocation { target, .. } if target == "ReceiveLog"));
        assert_eq!(msgs[2], HubMessage::Other(3));
    }

    #[test]
    fn malformed_record_does_not_poison_the_frame() {
        let frame = format!("{{oops\u{1e}{}", encode(&HubMessage::Ping));
        let msgs = decode_frame(&frame);
        assert!(msgs[0].is_err());
        assert_eq!(msgs[1], Ok(HubMessage::Ping));
    }

    #[test]
    fn close_defaults_to_reconnect_allowed() {
        let msgs = decode_frame("{\"type\":7}\u{1e}");
        assert_eq!(
            msgs[0],
            Ok(HubMessage::Close {
                error: None,
                allow_reconnect: true
            })
        );
    }

    #[test]
    fn handshake_response_variants() {
        assert_eq!(parse_handshake_response("{}\u{1e}"), Ok(""));
        assert_eq!(
            parse_handshake_response("{}\u{1e}{\"type\":6}\u{1e}"),
            Ok("{\"type\":6}\u{1e}")
        );
        assert_eq!(
            parse_handshake_response("{\"error\":\"unsupported protocol\"}\u{1e}"),
            Err("unsupported protocol".to_string())
        );
        assert!(parse_handshake_response("{}").is_err());
    }
}
