//! Dynamically typed argument values and their binary encoding.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Nested lists/maps deeper than this are rejected on decode.
const MAX_NESTING: usize = 64;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;
const TAG_CUSTOM: u8 = 9;

/// A single typed argument or return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An application type registered by name; the payload is opaque here.
    Custom { type_name: String, data: Vec<u8> },
}

impl Value {
    /// The type tag this value is checked against in a signature.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Custom { type_name, .. } => type_name,
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Signed view of an integer value of either signedness.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned view of an integer value of either signedness.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Render as JSON for logs and diagnostics.
    ///
    /// Bytes become arrays of numbers, custom values become
    /// `{"$type": name, "data": [..]}`, and non-finite doubles become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(v) => Json::from(*v),
            Value::UInt(v) => Json::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(data) => Json::from(data.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Custom { type_name, data } => serde_json::json!({
                "$type": type_name,
                "data": data,
            }),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else if let Some(v) = n.as_u64() {
                    Value::UInt(v)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Append an argument list: `u32 count` followed by each value.
pub fn encode_args(args: &[Value], dst: &mut BytesMut) -> Result<()> {
    put_len(dst, args.len(), "argument list")?;
    for arg in args {
        put_value(dst, arg)?;
    }
    Ok(())
}

/// Read an argument list written by [`encode_args`].
pub fn decode_args(src: &mut &[u8]) -> Result<Vec<Value>> {
    let count = get_len(src, "argument count")?;
    let mut args = Vec::with_capacity(count.min(src.remaining()));
    for _ in 0..count {
        args.push(get_value(src, 0)?);
    }
    Ok(args)
}

pub(crate) fn put_value(dst: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Bool(b) => {
            dst.put_u8(TAG_BOOL);
            dst.put_u8(u8::from(*b));
        }
        Value::Int(v) => {
            dst.put_u8(TAG_INT);
            dst.put_i64(*v);
        }
        Value::UInt(v) => {
            dst.put_u8(TAG_UINT);
            dst.put_u64(*v);
        }
        Value::Double(v) => {
            dst.put_u8(TAG_DOUBLE);
            dst.put_f64(*v);
        }
        Value::Str(s) => {
            dst.put_u8(TAG_STRING);
            put_string(dst, s)?;
        }
        Value::Bytes(data) => {
            dst.put_u8(TAG_BYTES);
            put_blob(dst, data)?;
        }
        Value::List(items) => {
            dst.put_u8(TAG_LIST);
            put_len(dst, items.len(), "list")?;
            for item in items {
                put_value(dst, item)?;
            }
        }
        Value::Map(entries) => {
            dst.put_u8(TAG_MAP);
            put_len(dst, entries.len(), "map")?;
            for (key, item) in entries {
                put_string(dst, key)?;
                put_value(dst, item)?;
            }
        }
        Value::Custom { type_name, data } => {
            dst.put_u8(TAG_CUSTOM);
            put_string(dst, type_name)?;
            put_blob(dst, data)?;
        }
    }
    Ok(())
}

pub(crate) fn get_value(src: &mut &[u8], depth: usize) -> Result<Value> {
    if depth > MAX_NESTING {
        return Err(FrameError::Malformed(format!(
            "values nested deeper than {MAX_NESTING} levels"
        )));
    }
    need(src, 1, "value tag")?;
    let value = match src.get_u8() {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            need(src, 1, "bool")?;
            Value::Bool(src.get_u8() != 0)
        }
        TAG_INT => {
            need(src, 8, "int")?;
            Value::Int(src.get_i64())
        }
        TAG_UINT => {
            need(src, 8, "uint")?;
            Value::UInt(src.get_u64())
        }
        TAG_DOUBLE => {
            need(src, 8, "double")?;
            Value::Double(src.get_f64())
        }
        TAG_STRING => Value::Str(get_string(src)?),
        TAG_BYTES => Value::Bytes(get_blob(src)?),
        TAG_LIST => {
            let count = get_len(src, "list length")?;
            let mut items = Vec::with_capacity(count.min(src.remaining()));
            for _ in 0..count {
                items.push(get_value(src, depth + 1)?);
            }
            Value::List(items)
        }
        TAG_MAP => {
            let count = get_len(src, "map length")?;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = get_string(src)?;
                let item = get_value(src, depth + 1)?;
                entries.insert(key, item);
            }
            Value::Map(entries)
        }
        TAG_CUSTOM => {
            let type_name = get_string(src)?;
            let data = get_blob(src)?;
            Value::Custom { type_name, data }
        }
        other => {
            return Err(FrameError::Malformed(format!("unknown value tag {other}")));
        }
    };
    Ok(value)
}

pub(crate) fn put_string(dst: &mut BytesMut, s: &str) -> Result<()> {
    put_blob(dst, s.as_bytes())
}

pub(crate) fn get_string(src: &mut &[u8]) -> Result<String> {
    let raw = get_blob(src)?;
    String::from_utf8(raw).map_err(|_| FrameError::Malformed("string is not valid UTF-8".into()))
}

fn put_blob(dst: &mut BytesMut, data: &[u8]) -> Result<()> {
    put_len(dst, data.len(), "blob")?;
    dst.put_slice(data);
    Ok(())
}

fn get_blob(src: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_len(src, "blob length")?;
    need(src, len, "blob")?;
    let data = src[..len].to_vec();
    src.advance(len);
    Ok(data)
}

fn put_len(dst: &mut BytesMut, len: usize, what: &str) -> Result<()> {
    let Ok(len) = u32::try_from(len) else {
        return Err(FrameError::Malformed(format!(
            "{what} of {len} entries does not fit a u32 length"
        )));
    };
    dst.put_u32(len);
    Ok(())
}

fn get_len(src: &mut &[u8], what: &str) -> Result<usize> {
    need(src, 4, what)?;
    Ok(src.get_u32() as usize)
}

pub(crate) fn need(src: &[u8], n: usize, what: &str) -> Result<()> {
    if src.len() < n {
        return Err(FrameError::Malformed(format!(
            "truncated {what} (need {n} bytes, have {})",
            src.len()
        )));
    }
    Ok(())
}
