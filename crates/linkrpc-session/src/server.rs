//! Server end of a connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use linkrpc_frame::{level, Call, CallSignature, Frame, FrameError, Outcome, ProtocolVersion, Value};
use linkrpc_transport::{Transport, TransportUpgrade};
use tracing::{debug, info, warn};

use crate::auth::AuthToken;
use crate::codes;
use crate::config::ServerConfig;
use crate::control::ControlMessage;
use crate::dispatch::{Dispatch, Invocation, Reply, ServiceProvider};
use crate::error::{Result, SessionError};
use crate::link::{spawn_io, FrameHandler, Link, Side};
use crate::multiplexer::CallSink;
use crate::negotiation::{apply, ServerNegotiator};
use crate::state::ConnectionState;

/// Name of the per-service authentication operation.
pub const AUTH_OPERATION: &str = "auth";

struct ServiceEntry {
    object: Arc<dyn Dispatch>,
    needs_auth: bool,
}

/// Live service objects of one connection, by id.
#[derive(Default)]
struct ServerRegistry {
    services: BTreeMap<u32, ServiceEntry>,
    next_id: u32,
    default_token: Option<AuthToken>,
}

impl ServerRegistry {
    /// Register `object`, reusing the id it already has on this connection.
    fn insert(&mut self, object: Arc<dyn Dispatch>, needs_auth: bool) -> u32 {
        let existing = self
            .services
            .iter()
            .find(|(_, entry)| std::ptr::addr_eq(Arc::as_ptr(&entry.object), Arc::as_ptr(&object)))
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.services.insert(id, ServiceEntry { object, needs_auth });
        id
    }

    /// Id 0 addresses the first registered service.
    fn resolve(&self, service_id: u32) -> Option<(u32, &ServiceEntry)> {
        if service_id == 0 {
            return self.services.iter().next().map(|(id, entry)| (*id, entry));
        }
        self.services.get(&service_id).map(|entry| (service_id, entry))
    }
}

pub(crate) struct ServerShared {
    link: Arc<Link>,
    provider: Arc<dyn ServiceProvider>,
    upgrader: Option<Arc<dyn TransportUpgrade>>,
    registry: Mutex<ServerRegistry>,
}

impl ServerShared {
    fn registry(&self) -> MutexGuard<'_, ServerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply(&self, id: u32, outcome: Outcome) {
        if let Err(err) = self.link.send(&Frame::Return { id, outcome }) {
            warn!(connection = self.link.label(), id, error = %err, "reply not sent");
        }
    }

    fn fatal(&self, message: &str) {
        let msg = ControlMessage::Error {
            level: level::FATAL,
            message: message.to_string(),
        };
        if let Err(err) = self.link.send_control(0, &msg) {
            debug!(connection = self.link.label(), error = %err, "fatal error not delivered");
        }
        self.link.close(message);
    }

    fn announce_ready(&self) {
        if self.link.advance(ConnectionState::Ready) {
            let msg = ControlMessage::StateChanged(ConnectionState::Ready.as_wire());
            if let Err(err) = self.link.send_control(0, &msg) {
                warn!(connection = self.link.label(), error = %err, "state change not sent");
            }
        }
    }

    /// Signature list of the service registered as `name`.
    fn describe<F>(&self, name: &str, list: F) -> Outcome
    where
        F: FnOnce(&dyn Dispatch) -> Vec<CallSignature>,
    {
        match self.provider.open(name) {
            Ok(object) => Outcome::Value(Value::List(
                list(object.as_ref())
                    .iter()
                    .map(|sig| Value::Str(sig.to_string()))
                    .collect(),
            )),
            Err(outcome) => outcome,
        }
    }

    fn not_ready(&self) -> Outcome {
        Outcome::error(
            codes::NOT_READY,
            format!("connection is {}", self.link.state()),
        )
    }
}

/// Per-call view handed to [`Dispatch::invoke`].
pub struct CallContext {
    call_id: u32,
    service_id: u32,
    peer: ServerPeer,
    deferred: AtomicBool,
}

impl CallContext {
    /// A context bound to no connection, for exercising dispatch code
    /// directly.
    pub fn detached(call_id: u32, service_id: u32) -> Self {
        Self {
            call_id,
            service_id,
            peer: ServerPeer {
                shared: Weak::new(),
            },
            deferred: AtomicBool::new(false),
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn peer(&self) -> &ServerPeer {
        &self.peer
    }

    /// Answer this call later. Return [`Outcome::Pending`] from the
    /// dispatch and complete the returned handle when the result is known.
    pub fn defer(&self) -> DeferredReply {
        self.deferred.store(true, Ordering::Release);
        DeferredReply {
            peer: self.peer.clone(),
            call_id: self.call_id,
            done: false,
        }
    }

    fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }
}

/// The outstanding reply of a deferred call.
///
/// Dropping it without completing sends an error in its place.
pub struct DeferredReply {
    peer: ServerPeer,
    call_id: u32,
    done: bool,
}

impl DeferredReply {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn complete(mut self, outcome: impl Into<Outcome>) -> Result<()> {
        self.done = true;
        let outcome = outcome.into();
        if outcome.is_pending() {
            return Err(SessionError::Protocol(
                "a deferred reply needs a concrete outcome".into(),
            ));
        }
        self.peer.send_return(self.call_id, outcome)
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let outcome = Outcome::error(level::ERROR, "deferred reply dropped");
        if let Err(err) = self.peer.send_return(self.call_id, outcome) {
            debug!(call_id = self.call_id, error = %err, "dropped deferred reply not reported");
        }
    }
}

/// Handle for talking back to the client from service code.
///
/// Holds the connection weakly; every operation fails once it is gone.
#[derive(Clone)]
pub struct ServerPeer {
    shared: Weak<ServerShared>,
}

impl ServerPeer {
    fn upgrade(&self) -> Result<Arc<ServerShared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| SessionError::Disconnected("connection dropped".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.link.is_closed())
    }

    pub fn label(&self) -> Option<String> {
        self.shared
            .upgrade()
            .map(|shared| shared.link.label().to_string())
    }

    /// Broadcast an event to every proxy bound to `service_id`.
    pub fn emit_event(&self, service_id: u32, signature: &str, args: Vec<Value>) -> Result<()> {
        let signature = CallSignature::parse(signature)?;
        let shared = self.upgrade()?;
        shared
            .link
            .send(&Frame::Event(Call::new(0, service_id, signature, args)))
    }

    /// Invoke a callback on the primary proxy of `service_id` and wait.
    ///
    /// Refused from the connection's I/O thread, which must stay free to
    /// read the reply.
    pub fn call_callback(
        &self,
        service_id: u32,
        signature: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Outcome {
        let shared = match self.upgrade() {
            Ok(shared) => shared,
            Err(err) => return codes::disconnected(&err.to_string()),
        };
        if shared.link.on_io_thread() {
            return Outcome::error(
                level::ERROR,
                "blocking callbacks cannot run on the I/O thread; use call_callback_async",
            );
        }
        let signature = match CallSignature::parse(signature) {
            Ok(sig) => sig,
            Err(err) => return Outcome::error(codes::SIGNATURE_MISMATCH, err.to_string()),
        };
        let mux = shared.link.mux();
        let ticket = match mux.register_blocking(timeout) {
            Ok(ticket) => ticket,
            Err(outcome) => return outcome,
        };
        let frame = Frame::Function(Call::new(ticket.id, service_id, signature, args));
        if let Err(err) = shared.link.send(&frame) {
            mux.abandon(ticket.id);
            return codes::disconnected(&err.to_string());
        }
        mux.wait(ticket)
    }

    /// Invoke a callback; the outcome goes to `sink`. Safe from any thread.
    pub fn call_callback_async(
        &self,
        service_id: u32,
        signature: &str,
        args: Vec<Value>,
        timeout: Duration,
        sink: Arc<dyn CallSink>,
    ) -> std::result::Result<u32, Outcome> {
        let shared = self
            .upgrade()
            .map_err(|err| codes::disconnected(&err.to_string()))?;
        let signature = CallSignature::parse(signature)
            .map_err(|err| Outcome::error(codes::SIGNATURE_MISMATCH, err.to_string()))?;
        let mux = shared.link.mux();
        let id = mux.register_async(timeout, sink)?;
        if let Err(err) = shared
            .link
            .send(&Frame::Function(Call::new(id, service_id, signature, args)))
        {
            mux.abandon(id);
            return Err(codes::disconnected(&err.to_string()));
        }
        Ok(id)
    }

    pub(crate) fn send_return(&self, id: u32, outcome: Outcome) -> Result<()> {
        self.upgrade()?.link.send(&Frame::Return { id, outcome })
    }
}

struct ServerHandler {
    shared: Arc<ServerShared>,
    negotiator: ServerNegotiator,
}

impl ServerHandler {
    fn on_control(&mut self, call: Call) {
        let msg = ControlMessage::parse(&call);
        let actions = self.negotiator.on_control(call.id, msg);
        let delegated = apply(&self.shared.link, actions, self.shared.upgrader.as_ref());
        for (id, msg) in delegated {
            self.on_service_request(id, msg);
        }
    }

    fn on_service_request(&mut self, id: u32, msg: ControlMessage) {
        let shared = &self.shared;
        if shared.link.state() < ConnectionState::NegotiatingService {
            debug!(
                connection = shared.link.label(),
                control = msg.name(),
                "request before negotiation finished"
            );
            shared.reply(id, shared.not_ready());
            return;
        }
        match msg {
            ControlMessage::SelectService { name, credentials } => {
                if shared.link.version() == ProtocolVersion::V0 {
                    self.select_legacy(id, &name, credentials);
                } else {
                    self.select(id, &name, credentials);
                }
            }
            ControlMessage::SetDefaultToken(token) => {
                debug!(connection = shared.link.label(), ?token, "default token set");
                shared.registry().default_token = Some(token);
            }
            ControlMessage::ListServices => {
                let names = shared
                    .provider
                    .service_names()
                    .into_iter()
                    .map(Value::Str)
                    .collect();
                shared.reply(id, Outcome::Value(Value::List(names)));
            }
            ControlMessage::ListFunctions(name) => {
                shared.reply(id, shared.describe(&name, |object| object.operations()));
            }
            ControlMessage::ListEvents(name) => {
                shared.reply(id, shared.describe(&name, |object| object.events()));
            }
            ControlMessage::ListCallbacks(name) => {
                shared.reply(id, shared.describe(&name, |object| object.callbacks()));
            }
            ControlMessage::DestroyService(service_id) => {
                let removed = shared.registry().services.remove(&service_id).is_some();
                debug!(connection = shared.link.label(), service_id, removed, "service released");
            }
            other => warn!(
                connection = shared.link.label(),
                control = other.name(),
                "unhandled request"
            ),
        }
    }

    /// Version-0 selection: credentials inline, answered with `ready`.
    fn select_legacy(&mut self, id: u32, name: &str, credentials: Option<(String, String)>) {
        let shared = &self.shared;
        let object = match shared.provider.open(name) {
            Ok(object) => object,
            Err(outcome) => {
                shared.fatal(&format!("cannot select {name:?}: {outcome}"));
                return;
            }
        };
        let token = match credentials {
            Some((user, pass)) => AuthToken::new(user, pass),
            None => shared.registry().default_token.clone().unwrap_or_default(),
        };
        let verdict = object.authenticate(&token);
        if verdict.is_error() {
            shared.fatal(&format!("authentication failed for {name:?}: {verdict}"));
            return;
        }
        let service_id = shared.registry().insert(object, false);
        info!(connection = shared.link.label(), service = name, service_id, "service selected");
        let ready = ControlMessage::Ready(Value::UInt(service_id.into()));
        if let Err(err) = shared.link.send_control(id, &ready) {
            warn!(connection = shared.link.label(), error = %err, "ready not sent");
            return;
        }
        shared.announce_ready();
    }

    fn select(&mut self, id: u32, name: &str, credentials: Option<(String, String)>) {
        let shared = &self.shared;
        let object = match shared.provider.open(name) {
            Ok(object) => object,
            Err(outcome) => {
                debug!(
                    connection = shared.link.label(),
                    service = name,
                    %outcome,
                    "selection refused"
                );
                shared.reply(id, outcome);
                return;
            }
        };
        let mut needs_auth = true;
        if let Some((user, pass)) = credentials {
            let verdict = object.authenticate(&AuthToken::new(user, pass));
            if verdict.is_error() {
                shared.reply(id, verdict);
                return;
            }
            needs_auth = false;
        }
        let service_id = shared.registry().insert(object, needs_auth);
        info!(connection = shared.link.label(), service = name, service_id, "service selected");
        shared.reply(id, Outcome::ServiceHandle(service_id));
        shared.announce_ready();
    }

    fn on_function(&mut self, call: Call) {
        let shared = &self.shared;
        let outcome = self.resolve_function(&call);
        if let Some(outcome) = outcome {
            shared.reply(call.id, outcome);
        }
    }

    /// Outcome to send for `call`, or `None` when nothing is sent now.
    fn resolve_function(&self, call: &Call) -> Option<Outcome> {
        let shared = &self.shared;
        if shared.link.state() != ConnectionState::Ready {
            debug!(
                connection = shared.link.label(),
                id = call.id,
                signature = %call.signature,
                "call before ready"
            );
            return Some(shared.not_ready());
        }

        let (service_id, object, needs_auth) = {
            let registry = shared.registry();
            match registry.resolve(call.service_id) {
                Some((service_id, entry)) => {
                    (service_id, Arc::clone(&entry.object), entry.needs_auth)
                }
                None => {
                    return Some(Outcome::error(
                        codes::UNKNOWN_SERVICE,
                        format!("no service with id {}", call.service_id),
                    ))
                }
            }
        };

        if call.signature.name() == AUTH_OPERATION {
            return Some(self.authenticate(service_id, &object, call));
        }
        if needs_auth {
            return Some(Outcome::error(
                codes::AUTH_REQUIRED,
                format!("service {service_id} requires authentication"),
            ));
        }

        let context = CallContext {
            call_id: call.id,
            service_id,
            peer: ServerPeer {
                shared: Arc::downgrade(shared),
            },
            deferred: AtomicBool::new(false),
        };
        let reply = object.invoke(&Invocation {
            signature: &call.signature,
            args: &call.args,
            context: &context,
        });
        match reply {
            Reply::Service(child) => {
                let child_id = shared.registry().insert(child, false);
                debug!(
                    connection = shared.link.label(),
                    service_id,
                    child_id,
                    "service object returned"
                );
                Some(Outcome::ServiceHandle(child_id))
            }
            Reply::Done(Outcome::Pending) if context.is_deferred() => {
                (shared.link.version() >= ProtocolVersion::V1).then_some(Outcome::Pending)
            }
            Reply::Done(Outcome::Pending) => Some(Outcome::error(
                level::ERROR,
                format!("{} returned pending without deferring", call.signature),
            )),
            Reply::Done(outcome) => Some(outcome),
        }
    }

    fn authenticate(&self, service_id: u32, object: &Arc<dyn Dispatch>, call: &Call) -> Outcome {
        let shared = &self.shared;
        let token = match call.args.first().map(AuthToken::from_value) {
            Some(Ok(token)) => token,
            Some(Err(err)) => return Outcome::error(codes::SIGNATURE_MISMATCH, err.to_string()),
            None => AuthToken::default(),
        };
        let token = if token.is_empty() {
            shared.registry().default_token.clone().unwrap_or(token)
        } else {
            token
        };
        let verdict = object.authenticate(&token);
        if !verdict.is_error() {
            if let Some(entry) = shared.registry().services.get_mut(&service_id) {
                entry.needs_auth = false;
            }
            info!(
                connection = shared.link.label(),
                service_id,
                user = %token.username,
                "authenticated"
            );
        } else {
            warn!(
                connection = shared.link.label(),
                service_id,
                user = %token.username,
                "authentication failed"
            );
        }
        verdict
    }
}

impl FrameHandler for ServerHandler {
    fn on_start(&mut self, link: &Arc<Link>) {
        apply(link, self.negotiator.start(), self.shared.upgrader.as_ref());
    }

    fn on_frame(&mut self, link: &Arc<Link>, frame: Frame) {
        match frame {
            Frame::Control(call) => self.on_control(call),
            Frame::Function(call) => self.on_function(call),
            Frame::Return { id, outcome } => {
                link.mux().complete(id, outcome);
            }
            Frame::Event(call) => {
                debug!(
                    connection = link.label(),
                    signature = %call.signature,
                    "ignoring event from client"
                );
            }
            Frame::Invalid => {
                self.on_protocol_error(link, FrameError::Malformed("invalid frame".into()))
            }
        }
    }

    fn on_protocol_error(&mut self, link: &Arc<Link>, err: FrameError) {
        warn!(connection = link.label(), error = %err, "protocol error");
        self.shared.fatal(&format!("protocol error: {err}"));
    }

    fn on_closed(&mut self, link: &Arc<Link>, reason: &str) {
        let released = {
            let mut registry = self.shared.registry();
            let count = registry.services.len();
            registry.services.clear();
            count
        };
        info!(connection = link.label(), reason, released, "server connection finished");
    }
}

/// The server end of one accepted connection.
///
/// Negotiation and dispatch run on the connection's own I/O thread.
/// Dropping this handle does not close the connection; it ends when the
/// client leaves or [`ServerConnection::close`] is called.
pub struct ServerConnection {
    shared: Arc<ServerShared>,
}

impl ServerConnection {
    pub fn accept<T: Transport>(
        transport: T,
        provider: Arc<dyn ServiceProvider>,
        config: ServerConfig,
        label: &str,
    ) -> Result<Self> {
        let (link, reader) = Link::open(
            transport,
            Side::Server,
            label,
            config.frame.clone(),
            config.poll_interval,
        )?;
        let shared = Arc::new(ServerShared {
            link: Arc::clone(&link),
            provider,
            upgrader: config.upgrader.clone(),
            registry: Mutex::new(ServerRegistry::default()),
        });
        let handler = ServerHandler {
            shared: Arc::clone(&shared),
            negotiator: ServerNegotiator::new(
                config.max_version,
                config.upgrade_policy,
                config.upgrader.is_some(),
                config.keepalive,
            ),
        };
        spawn_io(link, reader, handler, false)?;
        debug!(connection = label, ?config, "server connection started");
        Ok(Self { shared })
    }

    pub fn label(&self) -> &str {
        self.shared.link.label()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.state()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.shared.link.version()
    }

    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.shared.link.wait_for_state(target, timeout)
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.link.is_closed()
    }

    pub fn peer(&self) -> ServerPeer {
        ServerPeer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of live service objects on this connection.
    pub fn service_count(&self) -> usize {
        self.shared.registry().services.len()
    }

    pub fn close(&self) {
        self.shared.link.close("closed by server");
    }

    /// Wait for the connection to end.
    pub fn join(&self) {
        self.shared.link.join();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use linkrpc_frame::{FrameReader, FrameWriter};

    use super::*;
    use crate::dispatch::{OperationTable, ServiceDirectory};

    struct Raw {
        reader: FrameReader<UnixStream>,
        writer: FrameWriter<UnixStream>,
    }

    impl Raw {
        fn new(stream: UnixStream) -> Self {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            Self {
                reader: FrameReader::new(stream.try_clone().unwrap()),
                writer: FrameWriter::new(stream),
            }
        }

        fn set_version(&mut self, version: ProtocolVersion) {
            self.reader.set_version(version);
            self.writer.set_version(version);
        }

        fn send(&mut self, id: u32, msg: ControlMessage) {
            self.writer.write_frame(&msg.to_frame(id).unwrap()).unwrap();
        }

        fn control(&mut self) -> ControlMessage {
            match self.reader.read_frame().unwrap() {
                Frame::Control(call) => ControlMessage::parse(&call),
                other => panic!("expected control, got {other:?}"),
            }
        }

        fn ret(&mut self) -> (u32, Outcome) {
            match self.reader.read_frame().unwrap() {
                Frame::Return { id, outcome } => (id, outcome),
                other => panic!("expected return, got {other:?}"),
            }
        }

        fn call(
            &mut self,
            id: u32,
            service_id: u32,
            sig: &str,
            args: Vec<Value>,
        ) -> (u32, Outcome) {
            let sig = CallSignature::parse(sig).unwrap();
            let frame = Frame::Function(Call::new(id, service_id, sig, args));
            self.writer.write_frame(&frame).unwrap();
            self.ret()
        }

        /// Drive negotiation up to NegotiatingService at `version`.
        fn negotiate(&mut self, version: ProtocolVersion) {
            assert!(matches!(self.control(), ControlMessage::Welcome { .. }));
            self.send(0, ControlMessage::SetProtocolVersion(version.as_u32()));
            assert_eq!(self.control(), ControlMessage::SetProtocolVersion(version.as_u32()));
            self.set_version(version);
            self.send(0, ControlMessage::SetSsl(false));
            assert_eq!(self.control(), ControlMessage::StateChanged(1));
        }
    }

    fn serve(provider: ServiceDirectory, config: ServerConfig) -> (ServerConnection, Raw) {
        let (a, b) = UnixStream::pair().unwrap();
        let server =
            ServerConnection::accept(a, Arc::new(provider), config, "test-server").unwrap();
        (server, Raw::new(b))
    }

    fn calc() -> ServiceDirectory {
        ServiceDirectory::new().with_service("calc", || {
            OperationTable::new()
                .operation("add(int,int)", |call: &Invocation<'_>| {
                    Value::Int(call.args[0].as_i64().unwrap() + call.args[1].as_i64().unwrap())
                })
                .unwrap()
                .authenticator(|token: &AuthToken| {
                    if token.password == "pw" {
                        Outcome::Value(Value::Bool(true))
                    } else {
                        Outcome::error(level::ERROR, "bad credentials")
                    }
                })
                .into_service()
        })
    }

    fn auth(raw: &mut Raw, id: u32, service_id: u32, password: &str) -> Outcome {
        let token = AuthToken::new("u", password).to_value().unwrap();
        raw.call(id, service_id, "auth(AuthToken)", vec![token]).1
    }

    #[test]
    fn select_auth_and_call_on_v2() {
        let (server, mut raw) = serve(calc(), ServerConfig::default());
        raw.negotiate(ProtocolVersion::V2);
        raw.send(5, ControlMessage::SelectService { name: "calc".into(), credentials: None });
        assert_eq!(raw.ret(), (5, Outcome::ServiceHandle(1)));
        assert_eq!(raw.control(), ControlMessage::StateChanged(2));
        assert!(server.wait_for_state(ConnectionState::Ready, Duration::from_secs(1)));

        let (_, denied) = raw.call(6, 1, "add(int,int)", vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(denied.error_code(), Some(codes::AUTH_REQUIRED));

        assert!(auth(&mut raw, 7, 1, "wrong").is_error());
        assert!(!auth(&mut raw, 8, 1, "pw").is_error());

        let (id, sum) = raw.call(9, 1, "add(int,int)", vec![Value::Int(1), Value::Int(2)]);
        assert_eq!((id, sum), (9, Outcome::Value(Value::Int(3))));
        assert_eq!(server.version(), ProtocolVersion::V2);
    }

    #[test]
    fn call_errors_keep_the_connection() {
        let (server, mut raw) = serve(calc(), ServerConfig::default());
        raw.negotiate(ProtocolVersion::V1);
        raw.send(2, ControlMessage::SelectService {
            name: "calc".into(),
            credentials: Some(("u".into(), "pw".into())),
        });
        assert_eq!(raw.ret(), (2, Outcome::ServiceHandle(1)));
        raw.control();

        let (_, unknown) = raw.call(3, 9, "add(int,int)", vec![]);
        assert_eq!(unknown.error_code(), Some(codes::UNKNOWN_SERVICE));
        let (_, missing) = raw.call(4, 1, "mul(int,int)", vec![]);
        assert_eq!(missing.error_code(), Some(codes::NOT_FOUND));
        let (_, mismatch) = raw.call(5, 1, "add(int,int)", vec![Value::Int(1)]);
        assert_eq!(mismatch.error_code(), Some(codes::SIGNATURE_MISMATCH));
        let (_, by_default) = raw.call(6, 0, "add(int,int)", vec![Value::Int(4), Value::Int(4)]);
        assert_eq!(by_default, Outcome::Value(Value::Int(8)));
        assert!(server.is_connected());
    }

    #[test]
    fn unknown_service_name_is_a_call_error() {
        let (server, mut raw) = serve(calc(), ServerConfig::default());
        raw.negotiate(ProtocolVersion::V2);
        raw.send(2, ControlMessage::SelectService { name: "nope".into(), credentials: None });
        let (_, outcome) = raw.ret();
        assert_eq!(outcome.error_code(), Some(codes::UNKNOWN_SERVICE));
        assert_eq!(server.state(), ConnectionState::NegotiatingService);
    }

    #[test]
    fn legacy_selection_replies_with_ready() {
        let config = ServerConfig::default().with_max_version(ProtocolVersion::V0);
        let (server, mut raw) = serve(calc(), config);
        assert_eq!(raw.control(), ControlMessage::Welcome { max_version: Some(0) });
        raw.send(0, ControlMessage::SetProtocolVersion(0));
        raw.control();
        raw.send(0, ControlMessage::SetSsl(false));
        raw.control();
        raw.send(3, ControlMessage::SelectService {
            name: "calc".into(),
            credentials: Some(("u".into(), "pw".into())),
        });
        let ready = match raw.reader.read_frame().unwrap() {
            Frame::Control(call) => {
                assert_eq!(call.id, 3);
                ControlMessage::parse(&call)
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ready, ControlMessage::Ready(Value::UInt(1)));
        assert_eq!(raw.control(), ControlMessage::StateChanged(2));

        let (_, sum) = raw.call(4, 0, "add(int,int)", vec![Value::Int(2), Value::Int(2)]);
        assert_eq!(sum, Outcome::Value(Value::Int(4)));
        assert_eq!(server.version(), ProtocolVersion::V0);
    }

    #[test]
    fn legacy_selection_failure_is_fatal() {
        let config = ServerConfig::default().with_max_version(ProtocolVersion::V0);
        let (server, mut raw) = serve(calc(), config);
        raw.control();
        raw.send(0, ControlMessage::SetProtocolVersion(0));
        raw.control();
        raw.send(0, ControlMessage::SetSsl(false));
        raw.control();
        raw.send(3, ControlMessage::SelectService {
            name: "calc".into(),
            credentials: Some(("u".into(), "wrong".into())),
        });
        assert!(matches!(raw.control(), ControlMessage::Error { level: 2, .. }));
        server.join();
        assert!(!server.is_connected());
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let config = ServerConfig::default().with_max_version(ProtocolVersion::V1);
        let (server, mut raw) = serve(calc(), config);
        raw.control();
        raw.send(0, ControlMessage::SetProtocolVersion(2));
        assert!(matches!(raw.control(), ControlMessage::Error { level: 2, .. }));
        server.join();
        assert!(!server.is_connected());
    }

    #[test]
    fn listing_and_destroying_services() {
        let (server, mut raw) = serve(calc(), ServerConfig::default());
        raw.negotiate(ProtocolVersion::V2);
        raw.send(2, ControlMessage::ListServices);
        assert_eq!(raw.ret().1, Outcome::Value(Value::List(vec![Value::from("calc")])));
        raw.send(3, ControlMessage::ListFunctions("calc".into()));
        assert_eq!(raw.ret().1, Outcome::Value(Value::List(vec![Value::from("add(int,int)")])));

        raw.send(4, ControlMessage::SelectService { name: "calc".into(), credentials: None });
        raw.ret();
        raw.control();
        assert_eq!(server.service_count(), 1);
        raw.send(0, ControlMessage::DestroyService(1));
        raw.send(5, ControlMessage::ListServices);
        raw.ret();
        assert_eq!(server.service_count(), 0);
    }

    #[test]
    fn default_token_stands_in_for_an_empty_one() {
        let (_server, mut raw) = serve(calc(), ServerConfig::default());
        raw.negotiate(ProtocolVersion::V2);
        raw.send(0, ControlMessage::SetDefaultToken(AuthToken::new("svc", "pw")));
        raw.send(2, ControlMessage::SelectService { name: "calc".into(), credentials: None });
        raw.ret();
        raw.control();
        let empty = AuthToken::default().to_value().unwrap();
        assert!(!raw.call(3, 1, "auth(AuthToken)", vec![empty]).1.is_error());
        let (_, sum) = raw.call(4, 1, "add(int,int)", vec![Value::Int(1), Value::Int(1)]);
        assert_eq!(sum, Outcome::Value(Value::Int(2)));
    }

    #[test]
    fn requests_before_negotiation_are_refused() {
        let (_server, mut raw) = serve(calc(), ServerConfig::default());
        raw.control();
        raw.send(1, ControlMessage::ListServices);
        assert_eq!(raw.ret().1.error_code(), Some(codes::NOT_READY));
    }

    #[test]
    fn peer_operations_fail_once_detached() {
        let context = CallContext::detached(1, 0);
        assert!(!context.peer().is_connected());
        assert!(context.peer().emit_event(1, "changed()", vec![]).is_err());
        assert!(codes::is_disconnect(&context.peer().call_callback(
            1,
            "cb()",
            vec![],
            Duration::from_millis(10)
        )));
    }
}
