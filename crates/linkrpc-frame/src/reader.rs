use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use linkrpc_transport::Transport;

use crate::codec::{parse_body, split_frame, Frame, FrameConfig, ProtocolVersion};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Partial reads are buffered internally. A read timeout on the underlying
/// stream surfaces as `FrameError::Io` with `WouldBlock`/`TimedOut` and keeps
/// any partially buffered frame for the next call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    version: ProtocolVersion,
}

impl<T: Read> FrameReader<T> {
    /// Reader at version 0, the format used until negotiation fixes one.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            version: ProtocolVersion::V0,
        }
    }

    /// Read the next complete body without parsing it.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at EOF.
    pub fn read_body(&mut self) -> Result<Bytes> {
        loop {
            if let Some(body) = split_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(body);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read and parse the next frame at the reader's current version.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let body = self.read_body()?;
        parse_body(&body, self.version)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl<T: Transport> FrameReader<T> {
    /// Reader over a transport with `config.read_timeout` applied to it.
    pub fn for_transport(inner: T, config: FrameConfig) -> Result<Self> {
        inner
            .set_stream_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: linkrpc_transport::TransportError) -> FrameError {
    match err {
        linkrpc_transport::TransportError::Io(io)
        | linkrpc_transport::TransportError::Accept(io) => FrameError::Io(io),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
