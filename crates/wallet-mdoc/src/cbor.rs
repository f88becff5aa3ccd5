//! CBOR helpers over `ciborium::Value`.

use crate::error::{MdocError, MdocResult};
use ciborium::value::Value;
use serde_json::{Map, Number};
use wallet_core::b64u_encode;

/// Tag for embedded CBOR data items (`#6.24(bstr .cbor T)`).
pub const TAG_ENCODED_CBOR: u64 = 24;
const TAG_FULL_DATE: u64 = 1004;
const TAG_TDATE: u64 = 0;

pub fn encode(value: &Value) -> MdocResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| MdocError::Cbor(format!("encode failed: {}", e)))?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> MdocResult<Value> {
    ciborium::de::from_reader(bytes).map_err(|e| MdocError::Cbor(format!("decode failed: {}", e)))
}

/// Wrap already-encoded CBOR bytes as `#6.24(bstr)`.
pub fn embed_bytes(encoded: Vec<u8>) -> Value {
    Value::Tag(TAG_ENCODED_CBOR, Box::new(Value::Bytes(encoded)))
}

pub fn embed(value: &Value) -> MdocResult<Value> {
    Ok(embed_bytes(encode(value)?))
}

/// The inner bytes of a `#6.24(bstr)` item.
pub fn embedded_bytes(value: &Value) -> MdocResult<&[u8]> {
    match value {
        Value::Tag(TAG_ENCODED_CBOR, inner) => match inner.as_ref() {
            Value::Bytes(b) => Ok(b),
            _ => Err(MdocError::Cbor("tag 24 does not wrap a byte string".into())),
        },
        _ => Err(MdocError::Cbor("expected an embedded CBOR item (tag 24)".into())),
    }
}

pub fn unembed(value: &Value) -> MdocResult<Value> {
    decode(embedded_bytes(value)?)
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    wallet_keystore::cose::map_get_text(map, key)
}

pub fn require<'a>(map: &'a Value, key: &str) -> MdocResult<&'a Value> {
    map_get(map, key).ok_or_else(|| MdocError::Cbor(format!("missing '{}'", key)))
}

pub fn as_text(value: &Value) -> Option<&str> {
    match value {
        Value::Text(t) => Some(t),
        _ => None,
    }
}

pub fn as_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

pub fn as_map(value: &Value) -> MdocResult<&[(Value, Value)]> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(MdocError::Cbor("expected a map".into())),
    }
}

pub fn as_array(value: &Value) -> MdocResult<&[Value]> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(MdocError::Cbor("expected an array".into())),
    }
}

/// Convert a CBOR value into JSON for display and claim matching.
///
/// Byte strings become base64url text; date tags become their text content.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                serde_json::Value::Number(v.into())
            } else if let Ok(v) = u64::try_from(n) {
                serde_json::Value::Number(v.into())
            } else {
                serde_json::Value::String(n.to_string())
            }
        }
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(t) => serde_json::Value::String(t.clone()),
        Value::Bytes(b) => serde_json::Value::String(b64u_encode(b)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                let key = match k {
                    Value::Text(t) => t.clone(),
                    other => to_json(other).to_string(),
                };
                out.insert(key, to_json(v));
            }
            serde_json::Value::Object(out)
        }
        Value::Tag(TAG_FULL_DATE | TAG_TDATE, inner) => to_json(inner),
        Value::Tag(TAG_ENCODED_CBOR, inner) => match inner.as_ref() {
            Value::Bytes(b) => decode(b).map(|v| to_json(&v)).unwrap_or(serde_json::Value::Null),
            other => to_json(other),
        },
        Value::Tag(_, inner) => to_json(inner),
        _ => serde_json::Value::Null,
    }
}
