use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use linkrpc_frame::{FrameConfig, ProtocolVersion};
use linkrpc_transport::TransportUpgrade;

use crate::auth::AuthToken;

/// How a server answers a client's `setSsl` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradePolicy {
    /// Never upgrade; a client that asks is refused.
    Disabled,
    /// Upgrade when the client asks and a hook is installed.
    #[default]
    Optional,
    /// Refuse clients that do not ask.
    Required,
}

/// Client-side connection settings.
#[derive(Clone)]
pub struct ClientConfig {
    /// Highest protocol version this client speaks.
    pub max_version: ProtocolVersion,
    /// Bound on reaching NegotiatingService and on each selection step.
    pub connect_timeout: Duration,
    /// Default deadline for blocking calls.
    pub call_timeout: Duration,
    /// How often the I/O thread wakes to check deadlines and keepalive.
    pub poll_interval: Duration,
    /// Ask the server for a transport upgrade.
    pub request_upgrade: bool,
    /// Runs the client half of the upgrade after `enableSsl`.
    pub upgrader: Option<Arc<dyn TransportUpgrade>>,
    /// Sent with `setDefaultToken` after connecting (version 1 and later).
    pub default_token: Option<AuthToken>,
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::CURRENT,
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            request_upgrade: false,
            upgrader: None,
            default_token: None,
            frame: FrameConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Request a transport upgrade, performed by `upgrader`.
    pub fn with_upgrade(mut self, upgrader: Arc<dyn TransportUpgrade>) -> Self {
        self.request_upgrade = true;
        self.upgrader = Some(upgrader);
        self
    }

    pub fn with_default_token(mut self, token: AuthToken) -> Self {
        self.default_token = Some(token);
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("ClientConfig");
        dbg.field("max_version", &self.max_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("request_upgrade", &self.request_upgrade)
            .field("upgrader", &self.upgrader.is_some());
        if let Some(token) = &self.default_token {
            dbg.field(
                "default_token",
                &format_args!("<redacted:{} bytes>", token.password.len()),
            );
        } else {
            dbg.field("default_token", &Option::<AuthToken>::None);
        }
        dbg.field("frame", &self.frame).finish()
    }
}

/// Server-side connection settings.
#[derive(Clone)]
pub struct ServerConfig {
    pub max_version: ProtocolVersion,
    pub upgrade_policy: UpgradePolicy,
    /// Runs the server half of the upgrade after `enableSsl` is sent.
    pub upgrader: Option<Arc<dyn TransportUpgrade>>,
    /// Announce `enableTimeout` with this window once negotiation passes.
    pub keepalive: Option<Duration>,
    pub poll_interval: Duration,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::CURRENT,
            upgrade_policy: UpgradePolicy::default(),
            upgrader: None,
            keepalive: None,
            poll_interval: Duration::from_millis(50),
            frame: FrameConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    pub fn with_upgrade_policy(mut self, policy: UpgradePolicy) -> Self {
        self.upgrade_policy = policy;
        self
    }

    pub fn with_upgrader(mut self, upgrader: Arc<dyn TransportUpgrade>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn with_keepalive(mut self, timeout: Duration) -> Self {
        self.keepalive = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_version", &self.max_version)
            .field("upgrade_policy", &self.upgrade_policy)
            .field("upgrader", &self.upgrader.is_some())
            .field("keepalive", &self.keepalive)
            .field("poll_interval", &self.poll_interval)
            .field("frame", &self.frame)
            .finish()
    }
}
