use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::value::{get_string, get_value, need, put_string, put_value, Value};

/// Conventional error levels. The protocol does not enforce them.
pub mod level {
    pub const WARNING: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const FATAL: i32 = 2;
}

/// Code used when a legacy return frame carries no arguments at all.
pub const LEGACY_DECODE_FAILED: i32 = 100;

const TAG_VALUE: u8 = 0;
const TAG_ERROR: u8 = 1;
const TAG_SERVICE: u8 = 2;
const TAG_PENDING: u8 = 3;

/// Result of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Value(Value),
    Error { code: i32, message: String },
    /// Opaque id of a remote object; resolving it is up to the session layer.
    ServiceHandle(u32),
    /// Accepted; the concrete outcome follows later under the same call id.
    Pending,
}

impl Outcome {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Outcome::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn error_code(&self) -> Option<i32> {
        match self {
            Outcome::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Outcome::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn service_handle(&self) -> Option<u32> {
        match self {
            Outcome::ServiceHandle(id) => Some(*id),
            _ => None,
        }
    }

    /// Argument-list form used by version-0 return frames.
    pub(crate) fn to_legacy_args(&self) -> Result<Vec<Value>> {
        match self {
            Outcome::Value(v) => Ok(vec![v.clone()]),
            Outcome::Error { code, message } => {
                Ok(vec![Value::Int((*code).into()), Value::Str(message.clone())])
            }
            Outcome::ServiceHandle(id) => Ok(vec![Value::UInt((*id).into())]),
            Outcome::Pending => Err(FrameError::Unrepresentable {
                version: 0,
                reason: "pending outcomes need protocol version 1".into(),
            }),
        }
    }

    /// Inverse of [`Outcome::to_legacy_args`]; never fails.
    pub(crate) fn from_legacy_args(mut args: Vec<Value>) -> Self {
        match args.len() {
            0 => Outcome::error(LEGACY_DECODE_FAILED, "failed to decode the return value"),
            1 => Outcome::Value(args.remove(0)),
            _ => {
                let code = args[0]
                    .as_i64()
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(level::ERROR);
                let message = match &args[1] {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                };
                Outcome::Error { code, message }
            }
        }
    }
}

impl From<Value> for Outcome {
    fn from(v: Value) -> Self {
        Outcome::Value(v)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => write!(f, "{v}"),
            Outcome::Error { code, message } => write!(f, "error {code}: {message}"),
            Outcome::ServiceHandle(id) => write!(f, "service #{id}"),
            Outcome::Pending => f.write_str("pending"),
        }
    }
}

pub(crate) fn put_outcome(dst: &mut BytesMut, outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Value(v) => {
            dst.put_u8(TAG_VALUE);
            put_value(dst, v)?;
        }
        Outcome::Error { code, message } => {
            dst.put_u8(TAG_ERROR);
            dst.put_i32(*code);
            put_string(dst, message)?;
        }
        Outcome::ServiceHandle(id) => {
            dst.put_u8(TAG_SERVICE);
            dst.put_u32(*id);
        }
        Outcome::Pending => dst.put_u8(TAG_PENDING),
    }
    Ok(())
}

pub(crate) fn get_outcome(src: &mut &[u8]) -> Result<Outcome> {
    need(src, 1, "outcome tag")?;
    match src.get_u8() {
        TAG_VALUE => Ok(Outcome::Value(get_value(src, 0)?)),
        TAG_ERROR => {
            need(src, 4, "error code")?;
            let code = src.get_i32();
            let message = get_string(src)?;
            Ok(Outcome::Error { code, message })
        }
        TAG_SERVICE => {
            need(src, 4, "service handle")?;
            Ok(Outcome::ServiceHandle(src.get_u32()))
        }
        TAG_PENDING => Ok(Outcome::Pending),
        other => Err(FrameError::Malformed(format!("unknown outcome tag {other}"))),
    }
}
