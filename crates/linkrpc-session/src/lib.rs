//! Session engine for linkrpc.
//!
//! A connection starts with a negotiation exchange that fixes the wire
//! version, optionally upgrades the transport and lets the client bind to
//! named services. Afterwards calls are multiplexed over the single stream
//! by call id, and each bound service may be shared by several local
//! proxies.
//!
//! Each connection runs one I/O thread that owns reading and decoding,
//! plus one delivery thread on which async outcomes, events, callbacks and
//! disconnect notices reach user code.

pub mod auth;
pub mod client;
pub mod codes;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod negotiation;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod state;

mod delivery;
mod link;
mod multiplexer;

#[cfg(unix)]
pub mod connector;
#[cfg(unix)]
pub mod listener;

pub use auth::{session_types, AuthToken, AUTH_TOKEN_TYPE};
pub use client::Connection;
pub use config::{ClientConfig, ServerConfig, UpgradePolicy};
pub use control::ControlMessage;
pub use dispatch::{Dispatch, Invocation, OperationTable, Reply, ServiceDirectory, ServiceProvider};
pub use error::{Result, SessionError};
pub use multiplexer::CallSink;
pub use negotiation::{Action, ClientNegotiator, ServerNegotiator};
pub use proxy::Proxy;
pub use registry::{Handlers, ProxyHandler};
pub use server::{CallContext, DeferredReply, ServerConnection, ServerPeer, AUTH_OPERATION};
pub use state::ConnectionState;

#[cfg(unix)]
pub use connector::connect;
#[cfg(unix)]
pub use listener::SessionListener;
