//! Pure envelope packing and unpacking. No I/O, no side effects.
//!
//! Encoding is a JSON mapping; any self-describing mapping/array encoder
//! would do, and nothing outside this module assumes JSON. The decode path
//! never panics: every malformed input comes back as a descriptive error
//! string so the connection layer can log it and tear the connection down.

use serde_json::Value;

use crate::{Message, MsgKind, Result};

/// Which end of the connection is decoding. Each side accepts only the kinds
/// the other side is allowed to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn accepts(self, kind: MsgKind) -> bool {
        match self {
            Side::Client => matches!(kind, MsgKind::Reply | MsgKind::Unsubscribe),
            Side::Server => matches!(
                kind,
                MsgKind::Call | MsgKind::Subscribe | MsgKind::Unsubscribe
            ),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

/// Serialize a [`Message`] for the wire.
pub fn msg_pack(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode and shape-check one frame.
///
/// Returns an error string instead of a message when the payload does not
/// decode to a mapping, lacks `call_id` or `msg_kind`, carries a
/// non-positive or non-integer `call_id`, or carries a kind invalid for
/// `side`. Never panics.
pub fn msg_unpack(frame: &[u8], side: Side) -> std::result::Result<Message, String> {
    let v: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => return Err(format!("msg decode error={}", e)),
    };
    let map = match v.as_object() {
        Some(m) => m,
        None => return Err(format!("msg not a mapping json_type={}", json_type(&v))),
    };
    let call_id = positive_int(map, "call_id")?;
    let kind_raw = positive_int(map, "msg_kind")?;
    let msg_kind = match MsgKind::from_wire(kind_raw) {
        Some(k) => k,
        None => return Err(format!("msg_kind={} not a valid kind", kind_raw)),
    };
    if !side.accepts(msg_kind) {
        return Err(format!("{:?} invalid for {}", msg_kind, side.name()));
    }
    let api_name = match map.get("api_name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(format!(
                "msg api_name non-string json_type={}",
                json_type(other)
            ))
        }
    };
    let api_error = match map.get("api_error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(format!(
                "msg api_error non-string json_type={}",
                json_type(other)
            ))
        }
    };
    Ok(Message {
        call_id,
        msg_kind,
        api_name,
        api_args: non_null(map.get("api_args")),
        api_result: non_null(map.get("api_result")),
        api_error,
    })
}

fn positive_int(
    map: &serde_json::Map<String, Value>,
    field: &str,
) -> std::result::Result<u64, String> {
    let v = match map.get(field) {
        Some(v) => v,
        None => {
            let keys: Vec<&String> = map.keys().collect();
            return Err(format!("msg missing {} keys={:?}", field, keys));
        }
    };
    match v.as_u64() {
        Some(i) if i > 0 => Ok(i),
        Some(_) => Err(format!("msg {} non-positive int={}", field, v)),
        None => Err(format!("msg {} non-integer json_type={}", field, json_type(v))),
    }
}

fn non_null(v: Option<&Value>) -> Option<Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(other) => Some(other.clone()),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
