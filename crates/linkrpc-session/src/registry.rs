//! Client-side service bindings and the per-connection registry.
//!
//! A binding owns its connection; the registry only points at bindings
//! weakly. The connection therefore lives exactly as long as some proxy
//! (or the [`crate::Connection`] handle itself) needs it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use linkrpc_frame::{CallSignature, Outcome, ProtocolVersion, Value};
use tracing::{debug, trace};

use crate::client::ClientShared;
use crate::codes;
use crate::control::ControlMessage;

/// Receives what the server pushes to a proxy.
///
/// Every method runs on the connection's delivery thread.
pub trait ProxyHandler: Send + Sync + 'static {
    /// An event for the proxy's service. Every attached proxy sees it.
    fn on_event(&self, _signature: &CallSignature, _args: &[Value]) {}

    /// A callback from the server. Only the primary proxy is asked.
    fn on_callback(&self, signature: &CallSignature, _args: &[Value]) -> Outcome {
        Outcome::error(codes::NOT_FOUND, format!("no callback {signature}"))
    }

    fn on_disconnected(&self, _reason: &str) {}
}

impl ProxyHandler for () {}

type EventFn = Box<dyn Fn(&CallSignature, &[Value]) + Send + Sync>;
type CallbackFn = Box<dyn Fn(&CallSignature, &[Value]) -> Outcome + Send + Sync>;
type DisconnectFn = Box<dyn Fn(&str) + Send + Sync>;

/// Closure-backed [`ProxyHandler`].
#[derive(Default)]
pub struct Handlers {
    event: Option<EventFn>,
    callback: Option<CallbackFn>,
    disconnect: Option<DisconnectFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallSignature, &[Value]) + Send + Sync + 'static,
    {
        self.event = Some(Box::new(f));
        self
    }

    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallSignature, &[Value]) -> Outcome + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn with_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.disconnect = Some(Box::new(f));
        self
    }
}

impl ProxyHandler for Handlers {
    fn on_event(&self, signature: &CallSignature, args: &[Value]) {
        if let Some(f) = &self.event {
            f(signature, args);
        }
    }

    fn on_callback(&self, signature: &CallSignature, args: &[Value]) -> Outcome {
        match &self.callback {
            Some(f) => f(signature, args),
            None => Outcome::error(codes::NOT_FOUND, format!("no callback {signature}")),
        }
    }

    fn on_disconnected(&self, reason: &str) {
        if let Some(f) = &self.disconnect {
            f(reason);
        }
    }
}

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Members {
    /// In attachment order; the first entry is the primary.
    proxies: Vec<(u64, Arc<dyn ProxyHandler>)>,
    orphaned: bool,
    disconnected: bool,
}

/// One remote object as seen by this client, shared by its proxies.
pub(crate) struct Binding {
    service_id: u32,
    conn: Arc<ClientShared>,
    members: Mutex<Members>,
}

impl Binding {
    pub(crate) fn new(service_id: u32, conn: Arc<ClientShared>) -> Self {
        Self {
            service_id,
            conn,
            members: Mutex::new(Members::default()),
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn service_id(&self) -> u32 {
        self.service_id
    }

    pub(crate) fn conn(&self) -> &Arc<ClientShared> {
        &self.conn
    }

    pub(crate) fn attach(&self, handler: Arc<dyn ProxyHandler>) -> u64 {
        let id = NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed);
        let mut members = self.members();
        members.proxies.push((id, handler));
        members.orphaned = false;
        trace!(
            service_id = self.service_id,
            proxy = id,
            count = members.proxies.len(),
            "proxy attached"
        );
        id
    }

    /// Remove proxy `id`. The next in attachment order becomes primary;
    /// with none left the binding is orphaned.
    pub(crate) fn detach(&self, id: u64) {
        let mut members = self.members();
        let Some(position) = members.proxies.iter().position(|(pid, _)| *pid == id) else {
            return;
        };
        members.proxies.remove(position);
        if members.proxies.is_empty() {
            members.orphaned = true;
            debug!(service_id = self.service_id, "binding orphaned");
        } else if position == 0 {
            debug!(
                service_id = self.service_id,
                primary = members.proxies[0].0,
                "primary proxy replaced"
            );
        }
    }

    pub(crate) fn is_primary(&self, id: u64) -> bool {
        self.members().proxies.first().is_some_and(|(pid, _)| *pid == id)
    }

    pub(crate) fn primary(&self) -> Option<Arc<dyn ProxyHandler>> {
        self.members()
            .proxies
            .first()
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn ProxyHandler>> {
        self.members()
            .proxies
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    pub(crate) fn proxy_count(&self) -> usize {
        self.members().proxies.len()
    }

    pub(crate) fn is_valid(&self) -> bool {
        let members = self.members();
        !members.orphaned && !members.disconnected && !self.conn.link().is_closed()
    }

    /// Mark dead and return the handlers to notify.
    pub(crate) fn mark_disconnected(&self) -> Vec<Arc<dyn ProxyHandler>> {
        let mut members = self.members();
        if members.disconnected {
            return Vec::new();
        }
        members.disconnected = true;
        members
            .proxies
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let link = self.conn.link();
        if !link.is_closed() && link.version() >= ProtocolVersion::V1 {
            let release = ControlMessage::DestroyService(self.service_id);
            if let Err(err) = link.send_control(0, &release) {
                debug!(service_id = self.service_id, error = %err, "release not sent");
            }
        }
        self.conn.registry().remove_if_dead(self.service_id);
        trace!(service_id = self.service_id, "binding released");
    }
}

/// Service id to binding, weakly held.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    bindings: Mutex<HashMap<u32, Weak<Binding>>>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<u32, Weak<Binding>>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lookup(&self, service_id: u32) -> Option<Arc<Binding>> {
        self.bindings().get(&service_id).and_then(Weak::upgrade)
    }

    /// The live binding for `service_id`, or a new one from `make`.
    pub(crate) fn get_or_insert(
        &self,
        service_id: u32,
        make: impl FnOnce() -> Binding,
    ) -> Arc<Binding> {
        let mut bindings = self.bindings();
        if let Some(existing) = bindings.get(&service_id).and_then(Weak::upgrade) {
            return existing;
        }
        let binding = Arc::new(make());
        bindings.insert(service_id, Arc::downgrade(&binding));
        bindings.retain(|_, weak| weak.strong_count() > 0);
        binding
    }

    /// Drop the entry for `service_id` if nothing holds it any more.
    pub(crate) fn remove_if_dead(&self, service_id: u32) {
        let mut bindings = self.bindings();
        if bindings
            .get(&service_id)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            bindings.remove(&service_id);
        }
    }

    pub(crate) fn live(&self) -> Vec<Arc<Binding>> {
        self.bindings().values().filter_map(Weak::upgrade).collect()
    }

    /// Binding a frame for `service_id` belongs to. Version 0 has a single
    /// implicit service.
    pub(crate) fn route(&self, service_id: u32, version: ProtocolVersion) -> Option<Arc<Binding>> {
        if version == ProtocolVersion::V0 {
            return self.live().into_iter().next();
        }
        self.lookup(service_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
