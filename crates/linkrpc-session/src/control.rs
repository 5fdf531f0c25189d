use linkrpc_frame::{Call, CallSignature, Frame, Value};
use tracing::debug;

use crate::auth::AuthToken;

/// Server greeting carrying its highest protocol version.
pub const CONTROL_WELCOME: &str = "welcome";
/// Version request from the client, echoed by the server once accepted.
pub const CONTROL_SET_PROTOCOL_VERSION: &str = "setProtocolVersion";
/// Client's transport-upgrade wish.
pub const CONTROL_SET_SSL: &str = "setSsl";
/// Server's go-ahead for the transport upgrade.
pub const CONTROL_ENABLE_SSL: &str = "enableSsl";
pub const CONTROL_SELECT_SERVICE: &str = "selectService";
pub const CONTROL_ERROR: &str = "error";
pub const CONTROL_STATE_CHANGED: &str = "stateChanged";
/// Legacy reply to a version-0 `selectService`.
pub const CONTROL_READY: &str = "ready";
pub const CONTROL_PING: &str = "ping";
pub const CONTROL_ENABLE_TIMEOUT: &str = "enableTimeout";
pub const CONTROL_DISABLE_TIMEOUT: &str = "disableTimeout";
pub const CONTROL_DESTROY_SERVICE: &str = "destroyService";
pub const CONTROL_SET_DEFAULT_TOKEN: &str = "setDefaultToken";
pub const CONTROL_LIST_SERVICES: &str = "listServices";
pub const CONTROL_LIST_FUNCTIONS: &str = "listFunctions";
pub const CONTROL_LIST_EVENTS: &str = "listEvents";
pub const CONTROL_LIST_CALLBACKS: &str = "listCallbacks";

/// A decoded protocol-control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// `None` for legacy servers that greet without a version.
    Welcome { max_version: Option<u32> },
    SetProtocolVersion(u32),
    SetSsl(bool),
    EnableSsl,
    /// Version 0 carries credentials inline; later versions use `auth`.
    SelectService {
        name: String,
        credentials: Option<(String, String)>,
    },
    Error { level: i32, message: String },
    StateChanged(i64),
    Ready(Value),
    Ping,
    /// Keepalive window in milliseconds.
    EnableTimeout(u64),
    DisableTimeout,
    DestroyService(u32),
    SetDefaultToken(AuthToken),
    ListServices,
    ListFunctions(String),
    ListEvents(String),
    ListCallbacks(String),
    /// Anything else; kept so it can be logged.
    Other {
        signature: CallSignature,
        args: Vec<Value>,
    },
}

impl ControlMessage {
    /// Interpret a control frame body. Unknown names or argument shapes
    /// become [`ControlMessage::Other`].
    pub fn parse(call: &Call) -> Self {
        Self::from_parts(&call.signature, &call.args).unwrap_or_else(|| {
            debug!(signature = %call.signature, "unrecognised control message");
            ControlMessage::Other {
                signature: call.signature.clone(),
                args: call.args.clone(),
            }
        })
    }

    fn from_parts(signature: &CallSignature, args: &[Value]) -> Option<Self> {
        let u32_arg = |i: usize| args.get(i)?.as_u64().and_then(|v| u32::try_from(v).ok());
        let str_arg = |i: usize| args.get(i)?.as_str().map(str::to_string);

        let msg = match (signature.name(), args.len()) {
            (CONTROL_WELCOME, 0) => ControlMessage::Welcome { max_version: None },
            (CONTROL_WELCOME, 1) => ControlMessage::Welcome {
                max_version: Some(u32_arg(0)?),
            },
            (CONTROL_SET_PROTOCOL_VERSION, 1) => ControlMessage::SetProtocolVersion(u32_arg(0)?),
            (CONTROL_SET_SSL, 1) => ControlMessage::SetSsl(args[0].as_bool()?),
            (CONTROL_ENABLE_SSL, 0) => ControlMessage::EnableSsl,
            (CONTROL_SELECT_SERVICE, 1) => ControlMessage::SelectService {
                name: str_arg(0)?,
                credentials: None,
            },
            (CONTROL_SELECT_SERVICE, 3) => ControlMessage::SelectService {
                name: str_arg(0)?,
                credentials: Some((str_arg(1)?, str_arg(2)?)),
            },
            (CONTROL_ERROR, 2) => ControlMessage::Error {
                level: i32::try_from(args[0].as_i64()?).ok()?,
                message: str_arg(1)?,
            },
            (CONTROL_STATE_CHANGED, 1) => ControlMessage::StateChanged(args[0].as_i64()?),
            (CONTROL_READY, 1) => ControlMessage::Ready(args[0].clone()),
            (CONTROL_PING, 0) => ControlMessage::Ping,
            (CONTROL_ENABLE_TIMEOUT, 1) => ControlMessage::EnableTimeout(args[0].as_u64()?),
            (CONTROL_DISABLE_TIMEOUT, 0) => ControlMessage::DisableTimeout,
            (CONTROL_DESTROY_SERVICE, 1) => ControlMessage::DestroyService(u32_arg(0)?),
            (CONTROL_SET_DEFAULT_TOKEN, 1) => {
                ControlMessage::SetDefaultToken(AuthToken::from_value(&args[0]).ok()?)
            }
            (CONTROL_LIST_SERVICES, 0) => ControlMessage::ListServices,
            (CONTROL_LIST_FUNCTIONS, 1) => ControlMessage::ListFunctions(str_arg(0)?),
            (CONTROL_LIST_EVENTS, 1) => ControlMessage::ListEvents(str_arg(0)?),
            (CONTROL_LIST_CALLBACKS, 1) => ControlMessage::ListCallbacks(str_arg(0)?),
            _ => return None,
        };
        Some(msg)
    }

    pub fn name(&self) -> &str {
        match self {
            ControlMessage::Welcome { .. } => CONTROL_WELCOME,
            ControlMessage::SetProtocolVersion(_) => CONTROL_SET_PROTOCOL_VERSION,
            ControlMessage::SetSsl(_) => CONTROL_SET_SSL,
            ControlMessage::EnableSsl => CONTROL_ENABLE_SSL,
            ControlMessage::SelectService { .. } => CONTROL_SELECT_SERVICE,
            ControlMessage::Error { .. } => CONTROL_ERROR,
            ControlMessage::StateChanged(_) => CONTROL_STATE_CHANGED,
            ControlMessage::Ready(_) => CONTROL_READY,
            ControlMessage::Ping => CONTROL_PING,
            ControlMessage::EnableTimeout(_) => CONTROL_ENABLE_TIMEOUT,
            ControlMessage::DisableTimeout => CONTROL_DISABLE_TIMEOUT,
            ControlMessage::DestroyService(_) => CONTROL_DESTROY_SERVICE,
            ControlMessage::SetDefaultToken(_) => CONTROL_SET_DEFAULT_TOKEN,
            ControlMessage::ListServices => CONTROL_LIST_SERVICES,
            ControlMessage::ListFunctions(_) => CONTROL_LIST_FUNCTIONS,
            ControlMessage::ListEvents(_) => CONTROL_LIST_EVENTS,
            ControlMessage::ListCallbacks(_) => CONTROL_LIST_CALLBACKS,
            ControlMessage::Other { signature, .. } => signature.name(),
        }
    }

    /// Signature and arguments as they go on the wire.
    pub fn to_parts(&self) -> crate::Result<(CallSignature, Vec<Value>)> {
        let sig = |types: &[&str]| CallSignature::new(self.name(), types.iter().copied());
        let parts = match self {
            ControlMessage::Welcome { max_version: None } => (sig(&[]), vec![]),
            ControlMessage::Welcome {
                max_version: Some(v),
            } => (sig(&["uint"]), vec![Value::from(*v)]),
            ControlMessage::SetProtocolVersion(v) => (sig(&["uint"]), vec![Value::from(*v)]),
            ControlMessage::SetSsl(on) => (sig(&["bool"]), vec![Value::Bool(*on)]),
            ControlMessage::SelectService {
                name,
                credentials: None,
            } => (sig(&["string"]), vec![Value::from(name.as_str())]),
            ControlMessage::SelectService {
                name,
                credentials: Some((user, pass)),
            } => (
                sig(&["string", "string", "string"]),
                vec![
                    Value::from(name.as_str()),
                    Value::from(user.as_str()),
                    Value::from(pass.as_str()),
                ],
            ),
            ControlMessage::Error { level, message } => (
                sig(&["int", "string"]),
                vec![Value::from(*level), Value::from(message.as_str())],
            ),
            ControlMessage::StateChanged(state) => (sig(&["int"]), vec![Value::Int(*state)]),
            ControlMessage::Ready(value) => (sig(&["any"]), vec![value.clone()]),
            ControlMessage::EnableTimeout(ms) => (
                sig(&["int"]),
                vec![Value::Int(i64::try_from(*ms).unwrap_or(i64::MAX))],
            ),
            ControlMessage::DestroyService(id) => (sig(&["uint"]), vec![Value::from(*id)]),
            ControlMessage::SetDefaultToken(token) => {
                (sig(&[crate::auth::AUTH_TOKEN_TYPE]), vec![token.to_value()?])
            }
            ControlMessage::ListFunctions(name)
            | ControlMessage::ListEvents(name)
            | ControlMessage::ListCallbacks(name) => {
                (sig(&["string"]), vec![Value::from(name.as_str())])
            }
            ControlMessage::EnableSsl
            | ControlMessage::Ping
            | ControlMessage::DisableTimeout
            | ControlMessage::ListServices => (sig(&[]), vec![]),
            ControlMessage::Other { signature, args } => (signature.clone(), args.clone()),
        };
        Ok(parts)
    }

    /// Build the control frame carrying this message under call id `id`.
    pub fn to_frame(&self, id: u32) -> crate::Result<Frame> {
        let (signature, args) = self.to_parts()?;
        Ok(Frame::Control(Call::new(id, 0, signature, args)))
    }
}
