//! Negotiation state machines for both ends of a connection.
//!
//! Both machines are pure: they consume control messages and return the
//! [`Action`]s the connection must carry out, in order. Frames exchanged
//! before the version is fixed use the version-0 layout.

use std::sync::Arc;
use std::time::Duration;

use linkrpc_frame::{level, Outcome, ProtocolVersion, Value};
use linkrpc_transport::{TransportUpgrade, UpgradeSide};
use tracing::{debug, error, warn};

use crate::config::UpgradePolicy;
use crate::control::ControlMessage;
use crate::link::{Link, Side};
use crate::state::ConnectionState;

/// A step the connection must perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send { id: u32, msg: ControlMessage },
    FixVersion(ProtocolVersion),
    Advance(ConnectionState),
    /// Run the installed [`TransportUpgrade`] hook now.
    Upgrade,
    EnableKeepalive(Duration),
    DisableKeepalive,
    /// Resolve a pending call (the connect wait or a legacy selection).
    Complete { id: u32, outcome: Outcome },
    Close(String),
    /// A service-level request the connection handles itself.
    Delegate { id: u32, msg: ControlMessage },
}

fn log_remote_error(level_value: i32, message: &str) -> Vec<Action> {
    match level_value {
        l if l >= level::FATAL => {
            error!(level = l, message, "fatal error from peer");
            vec![Action::Close(format!("peer reported a fatal error: {message}"))]
        }
        level::ERROR => {
            error!(message, "error from peer");
            Vec::new()
        }
        l => {
            warn!(level = l, message, "warning from peer");
            Vec::new()
        }
    }
}

fn fatal(message: String) -> Vec<Action> {
    vec![
        Action::Send {
            id: 0,
            msg: ControlMessage::Error {
                level: level::FATAL,
                message: message.clone(),
            },
        },
        Action::Close(message),
    ]
}

/// Client end: answers the greeting, fixes the version and waits for the
/// server to move the connection forward.
#[derive(Debug)]
pub struct ClientNegotiator {
    max_version: ProtocolVersion,
    request_upgrade: bool,
    can_upgrade: bool,
    connect_id: u32,
    requested: Option<ProtocolVersion>,
    fixed: Option<ProtocolVersion>,
}

impl ClientNegotiator {
    /// `connect_id` is the pending call completed once the server reports
    /// NegotiatingService.
    pub fn new(
        max_version: ProtocolVersion,
        request_upgrade: bool,
        can_upgrade: bool,
        connect_id: u32,
    ) -> Self {
        Self {
            max_version,
            request_upgrade,
            can_upgrade,
            connect_id,
            requested: None,
            fixed: None,
        }
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.fixed
    }

    pub fn on_control(&mut self, id: u32, msg: ControlMessage) -> Vec<Action> {
        match msg {
            ControlMessage::Welcome { max_version } if self.requested.is_none() => {
                let Some(server_max) = max_version else {
                    debug!("legacy greeting; using version 0");
                    self.requested = Some(ProtocolVersion::V0);
                    self.fixed = Some(ProtocolVersion::V0);
                    return vec![
                        Action::FixVersion(ProtocolVersion::V0),
                        Action::Advance(ConnectionState::NegotiatingService),
                        Action::Complete {
                            id: self.connect_id,
                            outcome: Outcome::Value(Value::Bool(true)),
                        },
                    ];
                };
                let chosen = self.max_version.min(ProtocolVersion::clamp(server_max));
                debug!(server_max, %chosen, "server greeting");
                self.requested = Some(chosen);
                vec![Action::Send {
                    id: 0,
                    msg: ControlMessage::SetProtocolVersion(chosen.as_u32()),
                }]
            }
            ControlMessage::SetProtocolVersion(v) if self.fixed.is_none() => {
                match (self.requested, ProtocolVersion::from_u32(v)) {
                    (Some(requested), Some(version)) if requested == version => {
                        self.fixed = Some(version);
                        vec![
                            Action::FixVersion(version),
                            Action::Send {
                                id: 0,
                                msg: ControlMessage::SetSsl(self.request_upgrade),
                            },
                        ]
                    }
                    (requested, _) => vec![Action::Close(format!(
                        "server fixed version {v}, requested {requested:?}"
                    ))],
                }
            }
            ControlMessage::EnableSsl => {
                if self.request_upgrade && self.can_upgrade {
                    vec![Action::Upgrade]
                } else {
                    vec![Action::Close(
                        "server started a transport upgrade that was not requested".into(),
                    )]
                }
            }
            ControlMessage::StateChanged(raw) => match ConnectionState::from_wire(raw) {
                Some(ConnectionState::NegotiatingService) => vec![
                    Action::Advance(ConnectionState::NegotiatingService),
                    Action::Complete {
                        id: self.connect_id,
                        outcome: Outcome::Value(Value::Bool(true)),
                    },
                ],
                Some(state) => vec![Action::Advance(state)],
                None => {
                    warn!(state = raw, "unknown connection state from server");
                    Vec::new()
                }
            },
            ControlMessage::Ready(handle) => vec![Action::Complete {
                id,
                outcome: Outcome::Value(handle),
            }],
            ControlMessage::Error { level, message } => log_remote_error(level, &message),
            ControlMessage::EnableTimeout(ms) => {
                vec![Action::EnableKeepalive(Duration::from_millis(ms))]
            }
            ControlMessage::DisableTimeout => vec![Action::DisableKeepalive],
            ControlMessage::Ping => Vec::new(),
            other => {
                debug!(control = other.name(), "ignoring control message");
                Vec::new()
            }
        }
    }
}

/// Server end: greets, validates the requested version, settles the
/// transport upgrade and hands service-level requests to the connection.
#[derive(Debug)]
pub struct ServerNegotiator {
    max_version: ProtocolVersion,
    policy: UpgradePolicy,
    can_upgrade: bool,
    keepalive: Option<Duration>,
    fixed: Option<ProtocolVersion>,
    connected: bool,
}

impl ServerNegotiator {
    pub fn new(
        max_version: ProtocolVersion,
        policy: UpgradePolicy,
        can_upgrade: bool,
        keepalive: Option<Duration>,
    ) -> Self {
        Self {
            max_version,
            policy,
            can_upgrade,
            keepalive,
            fixed: None,
            connected: false,
        }
    }

    /// Actions to run as soon as the transport is up.
    pub fn start(&self) -> Vec<Action> {
        vec![Action::Send {
            id: 0,
            msg: ControlMessage::Welcome {
                max_version: Some(self.max_version.as_u32()),
            },
        }]
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.fixed
    }

    pub fn on_control(&mut self, id: u32, msg: ControlMessage) -> Vec<Action> {
        match msg {
            ControlMessage::SetProtocolVersion(v) => {
                if self.fixed.is_some() {
                    warn!(requested = v, "protocol version already fixed; ignoring");
                    return Vec::new();
                }
                match ProtocolVersion::from_u32(v).filter(|pv| *pv <= self.max_version) {
                    Some(version) => {
                        self.fixed = Some(version);
                        vec![
                            Action::Send {
                                id,
                                msg: ControlMessage::SetProtocolVersion(v),
                            },
                            Action::FixVersion(version),
                        ]
                    }
                    None => fatal(format!(
                        "unsupported protocol version {v} (max {})",
                        self.max_version
                    )),
                }
            }
            ControlMessage::SetSsl(requested) => {
                if self.fixed.is_none() {
                    return fatal("transport upgrade requested before version negotiation".into());
                }
                if self.connected {
                    warn!("transport upgrade already settled; ignoring");
                    return Vec::new();
                }
                let available = self.can_upgrade && self.policy != UpgradePolicy::Disabled;
                match (requested, available, self.policy) {
                    (true, true, _) => {
                        let mut actions = vec![
                            Action::Send {
                                id: 0,
                                msg: ControlMessage::EnableSsl,
                            },
                            Action::Upgrade,
                        ];
                        actions.extend(self.connected());
                        actions
                    }
                    (true, false, _) => fatal("transport upgrade not available".into()),
                    (false, _, UpgradePolicy::Required) => {
                        fatal("transport upgrade required".into())
                    }
                    (false, _, _) => self.connected(),
                }
            }
            ControlMessage::Error { level, message } => log_remote_error(level, &message),
            ControlMessage::EnableTimeout(ms) => {
                vec![Action::EnableKeepalive(Duration::from_millis(ms))]
            }
            ControlMessage::DisableTimeout => vec![Action::DisableKeepalive],
            ControlMessage::Ping => Vec::new(),
            msg @ (ControlMessage::SelectService { .. }
            | ControlMessage::SetDefaultToken(_)
            | ControlMessage::ListServices
            | ControlMessage::ListFunctions(_)
            | ControlMessage::ListEvents(_)
            | ControlMessage::ListCallbacks(_)
            | ControlMessage::DestroyService(_)) => vec![Action::Delegate { id, msg }],
            other => {
                warn!(control = other.name(), "unexpected control message from client");
                Vec::new()
            }
        }
    }

    fn connected(&mut self) -> Vec<Action> {
        self.connected = true;
        let mut actions = vec![
            Action::Advance(ConnectionState::NegotiatingService),
            Action::Send {
                id: 0,
                msg: ControlMessage::StateChanged(ConnectionState::NegotiatingService.as_wire()),
            },
        ];
        if let Some(window) = self.keepalive {
            let ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
            actions.push(Action::Send {
                id: 0,
                msg: ControlMessage::EnableTimeout(ms),
            });
            actions.push(Action::EnableKeepalive(window));
        }
        actions
    }
}

/// Carry out `actions` on `link`, returning the delegated requests.
///
/// Stops at the first `Close`.
pub(crate) fn apply(
    link: &Link,
    actions: Vec<Action>,
    upgrader: Option<&Arc<dyn TransportUpgrade>>,
) -> Vec<(u32, ControlMessage)> {
    let mut delegated = Vec::new();
    for action in actions {
        match action {
            Action::Send { id, msg } => {
                if let Err(err) = link.send_control(id, &msg) {
                    warn!(
                        connection = link.label(),
                        control = msg.name(),
                        error = %err,
                        "control send failed"
                    );
                }
            }
            Action::FixVersion(version) => {
                link.fix_version(version);
            }
            Action::Advance(state) => {
                link.advance(state);
            }
            Action::Upgrade => {
                let side = match link.side() {
                    Side::Client => UpgradeSide::Client,
                    Side::Server => UpgradeSide::Server,
                };
                let result = match upgrader {
                    Some(hook) => hook.upgrade(side),
                    None => Err(linkrpc_transport::TransportError::Upgrade(
                        "no upgrade hook installed".into(),
                    )),
                };
                if let Err(err) = result {
                    link.close(&format!("transport upgrade failed: {err}"));
                    break;
                }
                debug!(connection = link.label(), "transport upgraded");
            }
            Action::EnableKeepalive(window) => link.enable_keepalive(window),
            Action::DisableKeepalive => link.disable_keepalive(),
            Action::Complete { id, outcome } => {
                link.mux().complete(id, outcome);
            }
            Action::Close(reason) => {
                link.close(&reason);
                break;
            }
            Action::Delegate { id, msg } => delegated.push((id, msg)),
        }
    }
    delegated
}
