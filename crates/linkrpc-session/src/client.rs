//! Client end of a connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use linkrpc_frame::{CallSignature, Frame, FrameError, Outcome, ProtocolVersion, Value};
use linkrpc_transport::{Transport, TransportUpgrade};
use tracing::{debug, info, warn};

use crate::auth::AuthToken;
use crate::codes;
use crate::config::ClientConfig;
use crate::control::ControlMessage;
use crate::error::{Result, SessionError};
use crate::link::{spawn_io, FrameHandler, Link, Side};
use crate::negotiation::{apply, ClientNegotiator};
use crate::proxy::Proxy;
use crate::registry::{Binding, ProxyHandler, ServiceRegistry};
use crate::server::AUTH_OPERATION;
use crate::state::ConnectionState;

pub(crate) struct ClientShared {
    link: Arc<Link>,
    registry: Arc<ServiceRegistry>,
    config: ClientConfig,
}

impl ClientShared {
    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub(crate) fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a control request under a fresh call id and wait for its reply.
    fn request(&self, msg: &ControlMessage, timeout: Duration) -> Result<Outcome> {
        let mux = self.link.mux();
        let ticket = mux.register_blocking(timeout).map_err(|o| outcome_error(o, timeout))?;
        if let Err(err) = self.link.send_control(ticket.id, msg) {
            mux.abandon(ticket.id);
            return Err(err);
        }
        Ok(mux.wait(ticket))
    }

    pub(crate) fn outcome_error(&self, outcome: Outcome) -> SessionError {
        outcome_error(outcome, self.config.call_timeout)
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.link.close("connection released");
    }
}

/// Map a failed outcome onto the matching connection-level error.
fn outcome_error(outcome: Outcome, timeout: Duration) -> SessionError {
    if codes::is_timeout(&outcome) {
        SessionError::Timeout(timeout)
    } else if codes::is_disconnect(&outcome) {
        SessionError::Disconnected(outcome.error_message().unwrap_or_default().to_string())
    } else {
        SessionError::from_outcome(outcome)
    }
}

struct ClientHandler {
    negotiator: ClientNegotiator,
    registry: Arc<ServiceRegistry>,
    upgrader: Option<Arc<dyn TransportUpgrade>>,
}

impl ClientHandler {
    fn on_event(
        &self,
        link: &Arc<Link>,
        service_id: u32,
        signature: CallSignature,
        args: Vec<Value>,
    ) {
        let Some(binding) = self.registry.route(service_id, link.version()) else {
            debug!(
                connection = link.label(),
                service_id,
                %signature,
                "event for unknown service dropped"
            );
            return;
        };
        let handlers = binding.handlers();
        drop(binding);
        link.queue().submit(move || {
            for handler in handlers {
                handler.on_event(&signature, &args);
            }
        });
    }

    fn on_callback(
        &self,
        link: &Arc<Link>,
        id: u32,
        service_id: u32,
        signature: CallSignature,
        args: Vec<Value>,
    ) {
        let primary = self
            .registry
            .route(service_id, link.version())
            .and_then(|binding| binding.primary());
        let Some(primary) = primary else {
            debug!(connection = link.label(), service_id, %signature, "callback without a proxy");
            let outcome = Outcome::error(
                codes::NOT_FOUND,
                format!("no proxy for service {service_id}"),
            );
            if let Err(err) = link.send(&Frame::Return { id, outcome }) {
                warn!(connection = link.label(), error = %err, "callback reply not sent");
            }
            return;
        };
        let reply_link = Arc::clone(link);
        link.queue().submit(move || {
            let mut outcome = primary.on_callback(&signature, &args);
            if outcome.is_pending() {
                outcome = Outcome::error(
                    codes::ERROR,
                    format!("{signature} cannot be deferred by a client"),
                );
            }
            if let Err(err) = reply_link.send(&Frame::Return { id, outcome }) {
                warn!(connection = reply_link.label(), error = %err, "callback reply not sent");
            }
        });
    }
}

impl FrameHandler for ClientHandler {
    fn on_frame(&mut self, link: &Arc<Link>, frame: Frame) {
        match frame {
            Frame::Control(call) => {
                let msg = ControlMessage::parse(&call);
                let actions = self.negotiator.on_control(call.id, msg);
                apply(link, actions, self.upgrader.as_ref());
            }
            Frame::Return { id, outcome } => {
                link.mux().complete(id, outcome);
            }
            Frame::Event(call) => self.on_event(link, call.service_id, call.signature, call.args),
            Frame::Function(call) => {
                self.on_callback(link, call.id, call.service_id, call.signature, call.args)
            }
            Frame::Invalid => {
                self.on_protocol_error(link, FrameError::Malformed("invalid frame".into()))
            }
        }
    }

    fn on_protocol_error(&mut self, link: &Arc<Link>, err: FrameError) {
        warn!(connection = link.label(), error = %err, "dropping unreadable frame");
    }

    fn on_closed(&mut self, link: &Arc<Link>, reason: &str) {
        let bindings = self.registry.live();
        let mut notify = Vec::new();
        for binding in &bindings {
            notify.extend(binding.mark_disconnected());
        }
        drop(bindings);
        if notify.is_empty() {
            return;
        }
        let reason = reason.to_string();
        link.queue().submit(move || {
            for handler in notify {
                handler.on_disconnected(&reason);
            }
        });
    }
}

/// The client end of a connection.
///
/// Cheap to clone. The connection stays open while any clone or any
/// [`Proxy`] obtained from it is alive, or until [`Connection::close`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ClientShared>,
}

impl Connection {
    /// Negotiate over `transport` and return once the server is ready for
    /// service selection.
    pub fn connect<T: Transport>(transport: T, config: ClientConfig) -> Result<Self> {
        Self::connect_with_label(transport, config, "client")
    }

    pub fn connect_with_label<T: Transport>(
        transport: T,
        config: ClientConfig,
        label: &str,
    ) -> Result<Self> {
        let (link, reader) = Link::open(
            transport,
            Side::Client,
            label,
            config.frame.clone(),
            config.poll_interval,
        )?;
        let ticket = link
            .mux()
            .register_blocking(config.connect_timeout)
            .map_err(|o| outcome_error(o, config.connect_timeout))?;
        let registry = Arc::new(ServiceRegistry::new());
        let handler = ClientHandler {
            negotiator: ClientNegotiator::new(
                config.max_version,
                config.request_upgrade,
                config.upgrader.is_some(),
                ticket.id,
            ),
            registry: Arc::clone(&registry),
            upgrader: config.upgrader.clone(),
        };
        spawn_io(Arc::clone(&link), reader, handler, true)?;
        let shared = Arc::new(ClientShared {
            link,
            registry,
            config,
        });

        let outcome = shared.link.mux().wait(ticket);
        if outcome.is_error() {
            let timeout = shared.config.connect_timeout;
            return Err(match outcome_error(outcome, timeout) {
                SessionError::Timeout(d) => SessionError::Timeout(d),
                SessionError::Disconnected(reason) => SessionError::HandshakeFailed(reason),
                other => SessionError::HandshakeFailed(other.to_string()),
            });
        }

        let conn = Self { shared };
        info!(connection = label, version = %conn.version(), "connected");
        if let Some(token) = conn.shared.config.default_token.clone() {
            if conn.version() >= ProtocolVersion::V1 {
                conn.set_default_token(token)?;
            }
        }
        Ok(conn)
    }

    pub(crate) fn from_shared(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    pub fn label(&self) -> &str {
        self.shared.link.label()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.shared.link.version()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.state()
    }

    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.shared.link.wait_for_state(target, timeout)
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.link.is_closed()
    }

    /// Number of live service bindings.
    pub fn binding_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Bind to the service `name` and return a proxy for it.
    ///
    /// `token` (or the configured default token) authenticates the new
    /// binding. Selecting a service the server shares returns a proxy on
    /// the already existing binding.
    pub fn select_service(
        &self,
        name: &str,
        token: Option<AuthToken>,
        handler: impl ProxyHandler,
    ) -> Result<Proxy> {
        let handler: Arc<dyn ProxyHandler> = Arc::new(handler);
        let token = token.or_else(|| self.shared.config.default_token.clone());
        let timeout = self.shared.config.connect_timeout;

        if self.version() == ProtocolVersion::V0 {
            let token = token.unwrap_or_default();
            let msg = ControlMessage::SelectService {
                name: name.to_string(),
                credentials: Some((token.username, token.password)),
            };
            let outcome = self.shared.request(&msg, timeout)?;
            if outcome.is_error() {
                return Err(outcome_error(outcome, timeout));
            }
            debug!(
                connection = self.label(),
                service = name,
                handle = %outcome,
                "legacy service selected"
            );
            let binding = self
                .shared
                .registry
                .get_or_insert(0, || Binding::new(0, Arc::clone(&self.shared)));
            return Ok(Proxy::attach(binding, handler));
        }

        let msg = ControlMessage::SelectService {
            name: name.to_string(),
            credentials: None,
        };
        let service_id = match self.shared.request(&msg, timeout)? {
            Outcome::ServiceHandle(id) => id,
            other if other.is_error() => return Err(outcome_error(other, timeout)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "selectService answered with {other}"
                )))
            }
        };
        let binding = self
            .shared
            .registry
            .get_or_insert(service_id, || Binding::new(service_id, Arc::clone(&self.shared)));

        let token_value = token.unwrap_or_default().to_value()?;
        let verdict = Proxy::call_binding(
            &binding,
            &format!("{AUTH_OPERATION}(AuthToken)"),
            vec![token_value],
            timeout,
        );
        if verdict.is_error() {
            warn!(
                connection = self.label(),
                service = name,
                service_id,
                %verdict,
                "authentication failed"
            );
            return Err(outcome_error(verdict, timeout));
        }
        info!(connection = self.label(), service = name, service_id, "service bound");
        Ok(Proxy::attach(binding, handler))
    }

    /// Names of the services the server offers.
    pub fn list_services(&self) -> Result<Vec<String>> {
        let timeout = self.shared.config.call_timeout;
        let outcome = self.shared.request(&ControlMessage::ListServices, timeout)?;
        strings(outcome, timeout)
    }

    /// Operation signatures of the service `name`.
    pub fn list_operations(&self, name: &str) -> Result<Vec<CallSignature>> {
        self.signatures(&ControlMessage::ListFunctions(name.to_string()))
    }

    /// Signatures of the events the service `name` may emit.
    pub fn list_events(&self, name: &str) -> Result<Vec<CallSignature>> {
        self.signatures(&ControlMessage::ListEvents(name.to_string()))
    }

    /// Signatures of the callbacks the service `name` may invoke on its
    /// primary proxy.
    pub fn list_callbacks(&self, name: &str) -> Result<Vec<CallSignature>> {
        self.signatures(&ControlMessage::ListCallbacks(name.to_string()))
    }

    fn signatures(&self, msg: &ControlMessage) -> Result<Vec<CallSignature>> {
        let timeout = self.shared.config.call_timeout;
        let outcome = self.shared.request(msg, timeout)?;
        strings(outcome, timeout)?
            .iter()
            .map(|text| CallSignature::parse(text).map_err(SessionError::from))
            .collect()
    }

    /// Attach a proxy to the remote object behind `service_id`, a handle
    /// returned by an earlier call.
    ///
    /// Proxies for the same handle share one binding. The remote object is
    /// released once the last of them is dropped.
    pub fn attach_service(&self, service_id: u32, handler: impl ProxyHandler) -> Proxy {
        let binding = self
            .shared
            .registry
            .get_or_insert(service_id, || Binding::new(service_id, Arc::clone(&self.shared)));
        debug!(connection = self.label(), service_id, "returned service bound");
        Proxy::attach(binding, Arc::new(handler))
    }

    /// Token the server uses when `auth` is called with an empty one.
    pub fn set_default_token(&self, token: AuthToken) -> Result<()> {
        self.shared
            .link
            .send_control(0, &ControlMessage::SetDefaultToken(token))
    }

    /// Close the connection. Outstanding calls fail with a disconnect
    /// error and every proxy is notified.
    pub fn close(&self) {
        self.shared.link.close("closed by client");
    }

    /// Wait for the I/O thread to finish after a close.
    pub fn join(&self) {
        self.shared.link.join();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

/// Client state over a stream nobody reads, for registry tests.
#[cfg(test)]
pub(crate) fn unattached_shared() -> Arc<ClientShared> {
    let (stream, _) = std::os::unix::net::UnixStream::pair().expect("socket pair");
    let config = ClientConfig::default();
    let (link, _reader) = Link::open(
        stream,
        Side::Client,
        "unattached",
        config.frame.clone(),
        config.poll_interval,
    )
    .expect("link");
    Arc::new(ClientShared {
        link,
        registry: Arc::new(ServiceRegistry::new()),
        config,
    })
}

fn strings(outcome: Outcome, timeout: Duration) -> Result<Vec<String>> {
    match outcome {
        Outcome::Value(Value::List(items)) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Str(s) => Some(s),
                _ => None,
            })
            .collect()),
        other if other.is_error() => Err(outcome_error(other, timeout)),
        other => Err(SessionError::Protocol(format!("expected a list, got {other}"))),
    }
}
