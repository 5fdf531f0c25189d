use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{
    encode_frame, parse_body, split_frame, Frame, ProtocolVersion, DEFAULT_MAX_PAYLOAD,
};
use crate::error::FrameError;

/// `tokio_util` codec speaking the wire format at a settable version.
#[derive(Debug, Clone)]
pub struct WireCodec {
    version: ProtocolVersion,
    max_payload_size: usize,
}

impl WireCodec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Takes effect for the next frame in either direction.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(ProtocolVersion::V0)
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match split_frame(src, self.max_payload_size)? {
            Some(body) => parse_body(&body, self.version).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, self.version, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::codec::Call;
    use crate::outcome::Outcome;
    use crate::signature::CallSignature;
    use crate::value::Value;

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sink = FramedWrite::new(client, WireCodec::new(ProtocolVersion::V2));
        let mut stream = FramedRead::new(server, WireCodec::new(ProtocolVersion::V2));

        let call = Frame::Function(Call::new(
            1,
            3,
            CallSignature::parse("echo(string)").unwrap(),
            vec![Value::from("hi")],
        ));
        let reply = Frame::Return {
            id: 1,
            outcome: Outcome::Value(Value::from("hi")),
        };

        sink.send(call.clone()).await.unwrap();
        sink.send(reply.clone()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), call);
        assert_eq!(stream.next().await.unwrap().unwrap(), reply);
    }

    #[tokio::test]
    async fn version_mismatch_decodes_as_invalid() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sink = FramedWrite::new(client, WireCodec::default());
        let mut stream = FramedRead::new(server, WireCodec::new(ProtocolVersion::V2));

        let ping = Frame::Control(Call::new(
            0,
            0,
            CallSignature::parse("ping()").unwrap(),
            vec![],
        ));
        sink.send(ping).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Frame::Invalid);
    }

    #[test]
    fn decoder_waits_for_more_bytes() {
        let mut codec = WireCodec::new(ProtocolVersion::V1).with_max_payload_size(64);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.version(), ProtocolVersion::V1);
    }
}
