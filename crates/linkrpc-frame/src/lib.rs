//! Versioned wire codec for linkrpc.
//!
//! Every frame is a big-endian `u32` body length followed by a body whose
//! layout depends on the protocol version negotiated for the connection
//! (see [`encode_frame`]). Bodies carry a call signature such as
//! `add(int,int)` and a list of typed [`Value`]s, or a call id and an
//! [`Outcome`].

pub mod codec;
pub mod error;
pub mod outcome;
pub mod reader;
pub mod signature;
pub mod types;
pub mod value;
pub mod writer;

#[cfg(feature = "async")]
pub mod tokio_codec;

pub use codec::{
    decode_frame, encode_frame, parse_body, split_frame, Call, Frame, FrameConfig, FrameKind,
    ProtocolVersion, DEFAULT_MAX_PAYLOAD, LENGTH_PREFIX_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use outcome::{level, Outcome};
pub use reader::FrameReader;
pub use signature::{CallSignature, Mismatch, SignatureError};
pub use types::{TypeRegistry, ANY};
pub use value::{decode_args, encode_args, Value};
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use tokio_codec::WireCodec;
