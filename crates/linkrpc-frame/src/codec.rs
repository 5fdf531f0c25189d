use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::outcome::{get_outcome, put_outcome, Outcome};
use crate::signature::CallSignature;
use crate::value::{decode_args, encode_args, get_string, need, put_string, Value};

/// Length prefix in front of every frame body.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Stream-sanity marker at the start of every version-2 body.
pub const MAGIC: u32 = 0x1234_ABCD;

/// Default maximum body size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// On-wire format generation, fixed per connection during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Legacy: no service ids, no magic, returns carried as argument lists.
    V0 = 0,
    /// Typed kind tag first, per-frame service id on functions and events.
    V1 = 1,
    /// V1 plus a leading magic number.
    V2 = 2,
}

impl ProtocolVersion {
    /// Newest version this build speaks.
    pub const CURRENT: Self = ProtocolVersion::V2;

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::V0),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Highest known version not above `v`.
    pub fn clamp(v: u32) -> Self {
        Self::from_u32(v).unwrap_or(Self::CURRENT)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn has_magic(self) -> bool {
        self >= Self::V2
    }

    pub fn has_service_ids(self) -> bool {
        self >= Self::V1
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

/// Frame kind tag as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Function = 0,
    Control = 1,
    Event = 2,
    Return = 3,
    Invalid = 4,
}

impl FrameKind {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Function,
            1 => Self::Control,
            2 => Self::Event,
            3 => Self::Return,
            _ => Self::Invalid,
        }
    }
}

/// Body of a function, control or event frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: u32,
    /// Target service. Always 0 on version-0 connections.
    pub service_id: u32,
    pub signature: CallSignature,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(id: u32, service_id: u32, signature: CallSignature, args: Vec<Value>) -> Self {
        Self {
            id,
            service_id,
            signature,
            args,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Function(Call),
    Control(Call),
    Event(Call),
    Return { id: u32, outcome: Outcome },
    /// Unknown kind or failed magic check; the body was skipped.
    Invalid,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Function(_) => FrameKind::Function,
            Frame::Control(_) => FrameKind::Control,
            Frame::Event(_) => FrameKind::Event,
            Frame::Return { .. } => FrameKind::Return,
            Frame::Invalid => FrameKind::Invalid,
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            Frame::Function(call) | Frame::Control(call) | Frame::Event(call) => Some(call.id),
            Frame::Return { id, .. } => Some(*id),
            Frame::Invalid => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Frame::Invalid)
    }
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum body size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to transports by [`crate::FrameReader::for_transport`].
    pub read_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
        }
    }
}

/// Append `frame` encoded at `version`.
///
/// ```text
/// v2: u32 len | u32 magic | u32 kind | [u32 service] | u32 id | sig | args
/// v1: u32 len |             u32 kind | [u32 service] | u32 id | sig | args
///     u32 len | [u32 magic] u32 kind | u32 id | outcome          (returns)
/// v0: u32 len | u32 id | u32 kind | sig | args                   (all kinds)
/// ```
///
/// `[u32 service]` is present for functions and events only. All integers are
/// big-endian and `len` counts the bytes that follow it.
pub fn encode_frame(frame: &Frame, version: ProtocolVersion, dst: &mut BytesMut) -> Result<()> {
    if frame.is_invalid() {
        return Err(FrameError::Unrepresentable {
            version: version.as_u32(),
            reason: "invalid frames are never sent".into(),
        });
    }

    let start = dst.len();
    dst.put_u32(0);

    let written = if version == ProtocolVersion::V0 {
        encode_legacy_body(frame, dst)
    } else {
        encode_body(frame, version, dst)
    };
    if let Err(err) = written {
        dst.truncate(start);
        return Err(err);
    }

    let body_len = dst.len() - start - LENGTH_PREFIX_SIZE;
    let Ok(body_len) = u32::try_from(body_len) else {
        dst.truncate(start);
        return Err(FrameError::PayloadTooLarge {
            size: body_len,
            max: u32::MAX as usize,
        });
    };
    dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

fn encode_body(frame: &Frame, version: ProtocolVersion, dst: &mut BytesMut) -> Result<()> {
    if version.has_magic() {
        dst.put_u32(MAGIC);
    }
    dst.put_u32(frame.kind() as u32);
    match frame {
        Frame::Function(call) | Frame::Event(call) => {
            dst.put_u32(call.service_id);
            put_call(call, dst)
        }
        Frame::Control(call) => put_call(call, dst),
        Frame::Return { id, outcome } => {
            dst.put_u32(*id);
            put_outcome(dst, outcome)
        }
        Frame::Invalid => Ok(()),
    }
}

fn encode_legacy_body(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    match frame {
        Frame::Function(call) | Frame::Control(call) | Frame::Event(call) => {
            dst.put_u32(call.id);
            dst.put_u32(frame.kind() as u32);
            put_string(dst, &call.signature.to_string())?;
            encode_args(&call.args, dst)
        }
        Frame::Return { id, outcome } => {
            let args = outcome.to_legacy_args()?;
            dst.put_u32(*id);
            dst.put_u32(FrameKind::Return as u32);
            put_string(dst, "")?;
            encode_args(&args, dst)
        }
        Frame::Invalid => Ok(()),
    }
}

fn put_call(call: &Call, dst: &mut BytesMut) -> Result<()> {
    dst.put_u32(call.id);
    put_string(dst, &call.signature.to_string())?;
    encode_args(&call.args, dst)
}

/// Split one complete body off the front of `src`.
///
/// Returns `Ok(None)` until the whole body is buffered. Nothing is consumed
/// in that case.
pub fn split_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
    let body_len = u32::from_be_bytes(prefix) as usize;

    if body_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: body_len,
            max: max_payload,
        });
    }
    if src.len() < LENGTH_PREFIX_SIZE + body_len {
        src.reserve(LENGTH_PREFIX_SIZE + body_len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(src.split_to(body_len).freeze()))
}

/// Parse a body produced by [`split_frame`] as `version`.
///
/// A wrong magic number or unknown kind yields [`Frame::Invalid`] so the
/// caller may retry at another version. Truncated or inconsistent bodies are
/// [`FrameError::Malformed`].
pub fn parse_body(body: &[u8], version: ProtocolVersion) -> Result<Frame> {
    let mut src = body;
    let frame = if version == ProtocolVersion::V0 {
        parse_legacy_body(&mut src)?
    } else {
        parse_versioned_body(&mut src, version)?
    };
    if !frame.is_invalid() && !src.is_empty() {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes after {:?} frame",
            src.len(),
            frame.kind()
        )));
    }
    Ok(frame)
}

/// [`split_frame`] followed by [`parse_body`].
pub fn decode_frame(
    src: &mut BytesMut,
    version: ProtocolVersion,
    max_payload: usize,
) -> Result<Option<Frame>> {
    match split_frame(src, max_payload)? {
        Some(body) => parse_body(&body, version).map(Some),
        None => Ok(None),
    }
}

fn parse_versioned_body(src: &mut &[u8], version: ProtocolVersion) -> Result<Frame> {
    if version.has_magic() {
        need(src, 4, "magic")?;
        if src.get_u32() != MAGIC {
            return Ok(Frame::Invalid);
        }
    }
    need(src, 4, "frame kind")?;
    match FrameKind::from_u32(src.get_u32()) {
        FrameKind::Function => {
            need(src, 4, "service id")?;
            let service_id = src.get_u32();
            Ok(Frame::Function(get_call(src, service_id)?))
        }
        FrameKind::Event => {
            need(src, 4, "service id")?;
            let service_id = src.get_u32();
            Ok(Frame::Event(get_call(src, service_id)?))
        }
        FrameKind::Control => Ok(Frame::Control(get_call(src, 0)?)),
        FrameKind::Return => {
            need(src, 4, "call id")?;
            let id = src.get_u32();
            let outcome = get_outcome(src)?;
            Ok(Frame::Return { id, outcome })
        }
        FrameKind::Invalid => Ok(Frame::Invalid),
    }
}

fn parse_legacy_body(src: &mut &[u8]) -> Result<Frame> {
    need(src, 8, "legacy header")?;
    let id = src.get_u32();
    let kind = FrameKind::from_u32(src.get_u32());
    match kind {
        FrameKind::Return => {
            let _ = get_string(src)?;
            let args = decode_args(src)?;
            Ok(Frame::Return {
                id,
                outcome: Outcome::from_legacy_args(args),
            })
        }
        FrameKind::Invalid => Ok(Frame::Invalid),
        _ => {
            let signature = get_signature(src)?;
            let call = Call::new(id, 0, signature, decode_args(src)?);
            Ok(match kind {
                FrameKind::Function => Frame::Function(call),
                FrameKind::Event => Frame::Event(call),
                _ => Frame::Control(call),
            })
        }
    }
}

fn get_call(src: &mut &[u8], service_id: u32) -> Result<Call> {
    need(src, 4, "call id")?;
    let id = src.get_u32();
    let signature = get_signature(src)?;
    let args = decode_args(src)?;
    Ok(Call::new(id, service_id, signature, args))
}

fn get_signature(src: &mut &[u8]) -> Result<CallSignature> {
    let text = get_string(src)?;
    CallSignature::parse(&text).map_err(|err| FrameError::Malformed(err.to_string()))
}
