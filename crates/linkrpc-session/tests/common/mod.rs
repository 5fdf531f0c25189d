#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use linkrpc_frame::{
    Call, CallSignature, Frame, FrameReader, FrameWriter, Outcome, ProtocolVersion, Value,
};
use linkrpc_session::{
    ClientConfig, Connection, ControlMessage, Invocation, OperationTable, ServerConfig,
    ServerConnection, ServiceDirectory,
};

/// A hand-driven peer speaking raw frames, for playing either end.
pub struct Raw {
    pub reader: FrameReader<UnixStream>,
    pub writer: FrameWriter<UnixStream>,
}

impl Raw {
    pub fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout should be settable");
        Self {
            reader: FrameReader::new(stream.try_clone().expect("stream should clone")),
            writer: FrameWriter::new(stream),
        }
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.reader.set_version(version);
        self.writer.set_version(version);
    }

    pub fn frame(&mut self) -> Frame {
        self.reader.read_frame().expect("frame should arrive")
    }

    pub fn write(&mut self, frame: Frame) {
        self.writer.write_frame(&frame).expect("frame should be written");
    }

    pub fn send(&mut self, id: u32, msg: ControlMessage) {
        let frame = msg.to_frame(id).expect("control should encode");
        self.write(frame);
    }

    /// Next control message with its call id, skipping pings.
    pub fn control(&mut self) -> (u32, ControlMessage) {
        loop {
            match self.frame() {
                Frame::Control(call) => {
                    let msg = ControlMessage::parse(&call);
                    if msg != ControlMessage::Ping {
                        return (call.id, msg);
                    }
                }
                other => panic!("expected a control frame, got {other:?}"),
            }
        }
    }

    pub fn function(&mut self) -> Call {
        match self.frame() {
            Frame::Function(call) => call,
            other => panic!("expected a function frame, got {other:?}"),
        }
    }

    pub fn ret(&mut self) -> (u32, Outcome) {
        match self.frame() {
            Frame::Return { id, outcome } => (id, outcome),
            other => panic!("expected a return frame, got {other:?}"),
        }
    }

    pub fn call(
        &mut self,
        id: u32,
        service_id: u32,
        sig: &str,
        args: Vec<Value>,
    ) -> (u32, Outcome) {
        let signature = CallSignature::parse(sig).expect("signature should parse");
        self.write(Frame::Function(Call::new(id, service_id, signature, args)));
        self.ret()
    }

    /// Play the server side of negotiation at `version`.
    pub fn serve_negotiation(&mut self, version: ProtocolVersion) {
        self.send(0, ControlMessage::Welcome { max_version: Some(version.as_u32()) });
        let (id, requested) = self.control();
        assert_eq!(requested, ControlMessage::SetProtocolVersion(version.as_u32()));
        self.send(id, ControlMessage::SetProtocolVersion(version.as_u32()));
        self.set_version(version);
        assert_eq!(self.control().1, ControlMessage::SetSsl(false));
        self.send(0, ControlMessage::StateChanged(1));
    }

    /// Answer a version-1+ selection with `service_id` and accept the
    /// follow-up authentication.
    pub fn serve_selection(&mut self, service_id: u32, announce_ready: bool) {
        let (id, msg) = self.control();
        assert!(matches!(msg, ControlMessage::SelectService { .. }), "got {msg:?}");
        self.write(Frame::Return { id, outcome: Outcome::ServiceHandle(service_id) });
        if announce_ready {
            self.send(0, ControlMessage::StateChanged(2));
        }
        let auth = self.function();
        assert_eq!(auth.signature.name(), "auth");
        assert_eq!(auth.service_id, service_id);
        self.write(Frame::Return { id: auth.id, outcome: Outcome::Value(Value::Bool(true)) });
    }

    /// Play the client side of negotiation at `version`.
    pub fn negotiate(&mut self, version: ProtocolVersion) {
        assert!(matches!(self.control().1, ControlMessage::Welcome { .. }));
        self.send(0, ControlMessage::SetProtocolVersion(version.as_u32()));
        assert_eq!(self.control().1, ControlMessage::SetProtocolVersion(version.as_u32()));
        self.set_version(version);
        self.send(0, ControlMessage::SetSsl(false));
        assert_eq!(self.control().1, ControlMessage::StateChanged(1));
    }
}

/// A `calc` service with `add(int,int)` and `echo(int)`, declaring an
/// `overflow(int)` event and a `confirm(int)` callback.
pub fn calc() -> ServiceDirectory {
    ServiceDirectory::new().with_service("calc", || {
        OperationTable::new()
            .operation("add(int,int)", |call: &Invocation<'_>| {
                let a = call.args[0].as_i64().unwrap_or_default();
                let b = call.args[1].as_i64().unwrap_or_default();
                Value::Int(a + b)
            })
            .expect("add should register")
            .operation("echo(int)", |call: &Invocation<'_>| call.args[0].clone())
            .expect("echo should register")
            .event("overflow(int)")
            .expect("overflow should declare")
            .callback("confirm(int)")
            .expect("confirm should declare")
            .into_service()
    })
}

/// A connected client/server pair over a socket pair.
pub fn pair(
    provider: ServiceDirectory,
    server: ServerConfig,
    client: ClientConfig,
) -> (ServerConnection, linkrpc_session::Result<Connection>) {
    let (a, b) = UnixStream::pair().expect("socket pair");
    let server = ServerConnection::accept(a, Arc::new(provider), server, "server")
        .expect("server should start");
    let client = Connection::connect(b, client);
    (server, client)
}
