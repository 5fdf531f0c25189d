//! Server-side seam between the protocol engine and application objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use linkrpc_frame::{CallSignature, Outcome, SignatureError, TypeRegistry, Value};
use tracing::debug;

use crate::auth::{session_types, AuthToken};
use crate::codes;
use crate::server::CallContext;

/// One incoming call as seen by a [`Dispatch`] implementation.
pub struct Invocation<'a> {
    pub signature: &'a CallSignature,
    pub args: &'a [Value],
    pub context: &'a CallContext,
}

/// What a dispatched call produces.
pub enum Reply {
    Done(Outcome),
    /// A new remote object; the caller receives a service handle for it.
    Service(Arc<dyn Dispatch>),
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Self {
        Reply::Done(outcome)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Done(Outcome::Value(value))
    }
}

/// A remote object: resolves calls by signature at runtime.
pub trait Dispatch: Send + Sync + 'static {
    fn invoke(&self, call: &Invocation<'_>) -> Reply;

    fn operations(&self) -> Vec<CallSignature>;

    /// Events this object may emit.
    fn events(&self) -> Vec<CallSignature> {
        Vec::new()
    }

    /// Callbacks this object may invoke on its primary proxy.
    fn callbacks(&self) -> Vec<CallSignature> {
        Vec::new()
    }

    /// Check credentials presented through `auth`. Accepts everyone unless
    /// overridden.
    fn authenticate(&self, _token: &AuthToken) -> Outcome {
        Outcome::Value(Value::Bool(true))
    }
}

type Operation = Box<dyn Fn(&Invocation<'_>) -> Reply + Send + Sync>;
type Authenticator = Box<dyn Fn(&AuthToken) -> Outcome + Send + Sync>;

/// Closure-backed [`Dispatch`] keyed by exact signature.
///
/// Arguments are checked against the declared signature before the
/// closure runs.
pub struct OperationTable {
    operations: Vec<(CallSignature, Operation)>,
    events: Vec<CallSignature>,
    callbacks: Vec<CallSignature>,
    authenticator: Option<Authenticator>,
    types: TypeRegistry,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::with_types(session_types())
    }

    /// Table whose signatures may use the types in `types`.
    pub fn with_types(types: TypeRegistry) -> Self {
        Self {
            operations: Vec::new(),
            events: Vec::new(),
            callbacks: Vec::new(),
            authenticator: None,
            types,
        }
    }

    /// Register `signature`, replacing an earlier registration of it.
    pub fn operation<F, R>(mut self, signature: &str, f: F) -> Result<Self, SignatureError>
    where
        F: Fn(&Invocation<'_>) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        let signature = CallSignature::parse(signature)?;
        signature.validate(&self.types)?;
        self.operations.retain(|(existing, _)| *existing != signature);
        self.operations
            .push((signature, Box::new(move |call: &Invocation<'_>| -> Reply { f(call).into() })));
        Ok(self)
    }

    pub fn event(mut self, signature: &str) -> Result<Self, SignatureError> {
        let signature = self.declare(signature)?;
        if !self.events.contains(&signature) {
            self.events.push(signature);
        }
        Ok(self)
    }

    /// Declare a callback this object invokes through
    /// [`ServerPeer`](crate::ServerPeer).
    pub fn callback(mut self, signature: &str) -> Result<Self, SignatureError> {
        let signature = self.declare(signature)?;
        if !self.callbacks.contains(&signature) {
            self.callbacks.push(signature);
        }
        Ok(self)
    }

    fn declare(&self, signature: &str) -> Result<CallSignature, SignatureError> {
        let signature = CallSignature::parse(signature)?;
        signature.validate(&self.types)?;
        Ok(signature)
    }

    pub fn authenticator<F>(mut self, f: F) -> Self
    where
        F: Fn(&AuthToken) -> Outcome + Send + Sync + 'static,
    {
        self.authenticator = Some(Box::new(f));
        self
    }

    pub fn into_service(self) -> Arc<dyn Dispatch> {
        Arc::new(self)
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for OperationTable {
    fn invoke(&self, call: &Invocation<'_>) -> Reply {
        let Some((declared, operation)) = self
            .operations
            .iter()
            .find(|(declared, _)| declared == call.signature)
        else {
            debug!(signature = %call.signature, "no such operation");
            return Outcome::error(
                codes::NOT_FOUND,
                format!("no operation {}", call.signature),
            )
            .into();
        };
        if let Err(mismatch) = declared.test(call.args) {
            return Outcome::error(
                codes::SIGNATURE_MISMATCH,
                format!("{declared}: {mismatch}"),
            )
            .into();
        }
        operation(call)
    }

    fn operations(&self) -> Vec<CallSignature> {
        self.operations.iter().map(|(sig, _)| sig.clone()).collect()
    }

    fn events(&self) -> Vec<CallSignature> {
        self.events.clone()
    }

    fn callbacks(&self) -> Vec<CallSignature> {
        self.callbacks.clone()
    }

    fn authenticate(&self, token: &AuthToken) -> Outcome {
        match &self.authenticator {
            Some(check) => check(token),
            None => Outcome::Value(Value::Bool(true)),
        }
    }
}

/// Resolves service names to root objects for `selectService`.
pub trait ServiceProvider: Send + Sync + 'static {
    fn open(&self, name: &str) -> Result<Arc<dyn Dispatch>, Outcome>;

    fn service_names(&self) -> Vec<String>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn Dispatch> + Send + Sync>;

/// Map-backed [`ServiceProvider`].
#[derive(Clone, Default)]
pub struct ServiceDirectory {
    services: BTreeMap<String, Factory>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh object for every selection.
    pub fn with_service<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Dispatch> + Send + Sync + 'static,
    {
        self.services.insert(name.into(), Arc::new(factory));
        self
    }

    /// One object shared by every selection. Selecting it twice on one
    /// connection yields the same service id.
    pub fn with_shared(mut self, name: impl Into<String>, service: Arc<dyn Dispatch>) -> Self {
        self.services
            .insert(name.into(), Arc::new(move || Arc::clone(&service)));
        self
    }
}

impl ServiceProvider for ServiceDirectory {
    fn open(&self, name: &str) -> Result<Arc<dyn Dispatch>, Outcome> {
        self.services
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                Outcome::error(codes::UNKNOWN_SERVICE, format!("no service named {name:?}"))
            })
    }

    fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> OperationTable {
        OperationTable::new()
            .operation("add(int,int)", |call: &Invocation<'_>| {
                let a = call.args[0].as_i64().unwrap_or_default();
                let b = call.args[1].as_i64().unwrap_or_default();
                Value::Int(a + b)
            })
            .unwrap()
            .operation("echo(any)", |call: &Invocation<'_>| call.args[0].clone())
            .unwrap()
            .event("changed(string)")
            .unwrap()
            .callback("confirm(string)")
            .unwrap()
    }

    fn invoke(table: &OperationTable, sig: &str, args: Vec<Value>) -> Outcome {
        let context = CallContext::detached(1, 0);
        let signature = CallSignature::parse(sig).unwrap();
        match table.invoke(&Invocation {
            signature: &signature,
            args: &args,
            context: &context,
        }) {
            Reply::Done(outcome) => outcome,
            Reply::Service(_) => panic!("unexpected service"),
        }
    }

    #[test]
    fn dispatches_by_exact_signature() {
        let table = table();
        assert_eq!(
            invoke(&table, "add(int,int)", vec![Value::Int(2), Value::Int(3)]),
            Outcome::Value(Value::Int(5))
        );
        assert_eq!(
            invoke(&table, "add(int)", vec![Value::Int(2)]).error_code(),
            Some(codes::NOT_FOUND)
        );
    }

    #[test]
    fn argument_mismatch_never_reaches_the_operation() {
        let table = table();
        let outcome = invoke(&table, "add(int,int)", vec![Value::Int(2), Value::from("x")]);
        assert_eq!(outcome.error_code(), Some(codes::SIGNATURE_MISMATCH));
        assert!(outcome
            .error_message()
            .unwrap()
            .contains("argument 1 is string, it should be int"));
    }

    #[test]
    fn signatures_are_validated_on_registration() {
        let null = |_: &Invocation<'_>| Value::Null;
        assert!(OperationTable::new().operation("f(Point)", null).is_err());
        assert!(OperationTable::new().operation("f(int", null).is_err());
        assert!(OperationTable::new().callback("g(Point)").is_err());
        let table = OperationTable::with_types(TypeRegistry::new().with("Point"))
            .operation("f(Point)", |_: &Invocation<'_>| Value::Null);
        assert!(table.is_ok());
    }

    #[test]
    fn lists_operations_events_and_callbacks() {
        let table = table().callback("confirm(string)").unwrap();
        let names: Vec<String> = table.operations().iter().map(ToString::to_string).collect();
        assert_eq!(names, ["add(int,int)", "echo(any)"]);
        assert_eq!(table.events()[0].to_string(), "changed(string)");
        let callbacks: Vec<String> = table.callbacks().iter().map(ToString::to_string).collect();
        assert_eq!(callbacks, ["confirm(string)"]);
    }

    #[test]
    fn authenticator_decides() {
        let table = table().authenticator(|token: &AuthToken| {
            if token.password == "open sesame" {
                Outcome::Value(Value::Bool(true))
            } else {
                Outcome::error(codes::ERROR, "bad password")
            }
        });
        assert!(table.authenticate(&AuthToken::new("a", "nope")).is_error());
        assert!(!table.authenticate(&AuthToken::new("a", "open sesame")).is_error());
        assert!(!OperationTable::new().authenticate(&AuthToken::default()).is_error());
    }

    #[test]
    fn directory_resolves_names() {
        let shared = table().into_service();
        let directory = ServiceDirectory::new()
            .with_shared("calc", Arc::clone(&shared))
            .with_service("fresh", || OperationTable::new().into_service());
        assert_eq!(directory.service_names(), ["calc", "fresh"]);

        let a = directory.open("calc").ok().unwrap();
        let b = directory.open("calc").ok().unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&a), Arc::as_ptr(&b)));
        let c = directory.open("fresh").ok().unwrap();
        let d = directory.open("fresh").ok().unwrap();
        assert!(!std::ptr::addr_eq(Arc::as_ptr(&c), Arc::as_ptr(&d)));

        let missing = directory.open("nope").err().unwrap();
        assert_eq!(missing.error_code(), Some(codes::UNKNOWN_SERVICE));
    }
}
