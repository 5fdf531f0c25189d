//! Typed RPC sessions over any ordered byte stream.
//!
//! A client invokes named, typed operations on services a server exposes,
//! and the server may push events and callbacks back. Several local proxies
//! can share one remote service object.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream abstraction, Unix domain sockets and TCP
//! - [`frame`]: versioned wire codec, typed values and call signatures
//! - [`session`]: negotiation, call multiplexing, service sharing, client and server ends
//! - [`logging`]: `tracing-subscriber` setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use linkrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use linkrpc_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use linkrpc_session::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use linkrpc_frame::{CallSignature, Outcome, ProtocolVersion, Value};
pub use linkrpc_session::{
    ClientConfig, Connection, Proxy, ServerConfig, ServerConnection, SessionError,
};

#[cfg(unix)]
pub use linkrpc_session::{connect, SessionListener};
