use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use linkrpc_frame::{Call, CallSignature, Frame, Outcome, ProtocolVersion, Value};
use tracing::trace;

use crate::client::Connection;
use crate::codes;
use crate::error::{Result, SessionError};
use crate::multiplexer::CallSink;
use crate::registry::{Binding, ProxyHandler};

/// A local handle on a remote service object.
///
/// Several proxies may share one binding; the first attached is the
/// primary and alone receives callbacks. Dropping a proxy detaches it.
pub struct Proxy {
    binding: Arc<Binding>,
    id: u64,
}

impl Proxy {
    pub(crate) fn attach(binding: Arc<Binding>, handler: Arc<dyn ProxyHandler>) -> Self {
        let id = binding.attach(handler);
        Self { binding, id }
    }

    pub fn service_id(&self) -> u32 {
        self.binding.service_id()
    }

    pub fn is_primary(&self) -> bool {
        self.binding.is_primary(self.id)
    }

    /// False once the connection is gone.
    pub fn is_valid(&self) -> bool {
        self.binding.is_valid()
    }

    /// Proxies attached to this proxy's binding, this one included.
    pub fn proxy_count(&self) -> usize {
        self.binding.proxy_count()
    }

    pub fn connection(&self) -> Connection {
        Connection::from_shared(Arc::clone(self.binding.conn()))
    }

    /// Attach another proxy to the same remote object.
    pub fn share(&self, handler: impl ProxyHandler) -> Proxy {
        Proxy::attach(Arc::clone(&self.binding), Arc::new(handler))
    }

    /// Blocking call with the connection's default timeout.
    pub fn call(&self, signature: &str, args: Vec<Value>) -> Outcome {
        let timeout = self.binding.conn().config().call_timeout;
        self.call_with_timeout(signature, args, timeout)
    }

    pub fn call_with_timeout(
        &self,
        signature: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Outcome {
        Self::call_binding(&self.binding, signature, args, timeout)
    }

    /// Call an operation that returns a remote object and attach `handler`
    /// to it as a new proxy.
    ///
    /// Fails if the call errors or returns anything but a service handle.
    pub fn call_service(
        &self,
        signature: &str,
        args: Vec<Value>,
        handler: impl ProxyHandler,
    ) -> Result<Proxy> {
        let conn = self.binding.conn();
        let service_id = match self.call(signature, args) {
            Outcome::ServiceHandle(id) => id,
            // Version 0 carries the handle as a plain number.
            Outcome::Value(value) if conn.link().version() == ProtocolVersion::V0 => value
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| {
                    SessionError::Protocol(format!("{signature} returned {value:?}"))
                })?,
            other if other.is_error() => return Err(conn.outcome_error(other)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "{signature} returned {other}, not a service"
                )))
            }
        };
        Ok(self.connection().attach_service(service_id, handler))
    }

    /// Start a call and return its id; the outcome goes to `sink` on the
    /// connection's delivery thread.
    pub fn call_async(
        &self,
        signature: &str,
        args: Vec<Value>,
        sink: Arc<dyn CallSink>,
    ) -> std::result::Result<u32, Outcome> {
        let call_sig = prepare(signature, &args)?;
        let conn = self.binding.conn();
        let link = conn.link();
        let mux = link.mux();
        let id = mux.register_async(conn.config().call_timeout, sink)?;
        let frame = Frame::Function(Call::new(id, self.service_id(), call_sig, args));
        if let Err(err) = link.send(&frame) {
            mux.abandon(id);
            return Err(codes::disconnected(&err.to_string()));
        }
        trace!(id, service_id = self.service_id(), "async call sent");
        Ok(id)
    }

    /// Await a call's outcome.
    #[cfg(feature = "async")]
    pub async fn call_future(&self, signature: &str, args: Vec<Value>) -> Outcome {
        use std::sync::{Mutex, PoisonError};

        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let sink = move |_id: u32, outcome: Outcome| {
            let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(tx) = tx {
                let _ = tx.send(outcome);
            }
        };
        match self.call_async(signature, args, Arc::new(sink)) {
            Ok(_) => rx
                .await
                .unwrap_or_else(|_| codes::disconnected("reply channel closed")),
            Err(outcome) => outcome,
        }
    }

    /// Events travel from server to client only.
    pub fn emit(&self, signature: &str, _args: Vec<Value>) -> Result<()> {
        Err(SessionError::Protocol(format!(
            "cannot emit {signature}: events flow from server to client"
        )))
    }

    pub(crate) fn call_binding(
        binding: &Binding,
        signature: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Outcome {
        let call_sig = match prepare(signature, &args) {
            Ok(sig) => sig,
            Err(outcome) => return outcome,
        };
        let link = binding.conn().link();
        if link.on_io_thread() {
            return Outcome::error(codes::ERROR, "blocking call on the connection's I/O thread");
        }
        let mux = link.mux();
        let ticket = match mux.register_blocking(timeout) {
            Ok(ticket) => ticket,
            Err(outcome) => return outcome,
        };
        let frame = Frame::Function(Call::new(ticket.id, binding.service_id(), call_sig, args));
        if let Err(err) = link.send(&frame) {
            mux.abandon(ticket.id);
            return codes::disconnected(&err.to_string());
        }
        mux.wait(ticket)
    }
}

/// Parse `signature` and check `args` against it before anything is sent.
fn prepare(signature: &str, args: &[Value]) -> std::result::Result<CallSignature, Outcome> {
    let sig = CallSignature::parse(signature)
        .map_err(|err| Outcome::error(codes::SIGNATURE_MISMATCH, err.to_string()))?;
    sig.test(args).map_err(|mismatch| {
        Outcome::error(codes::SIGNATURE_MISMATCH, format!("{sig}: {mismatch}"))
    })?;
    Ok(sig)
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.binding.detach(self.id);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service_id", &self.service_id())
            .field("primary", &self.is_primary())
            .field("valid", &self.is_valid())
            .finish()
    }
}
