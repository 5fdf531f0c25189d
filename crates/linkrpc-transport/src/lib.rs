//! Byte-stream transports for linkrpc.
//!
//! The session engine only needs an ordered, reliable byte stream that can be
//! split into a read half and a write half and closed from a third handle.
//! The [`Transport`] trait captures exactly that; this crate implements it for
//! Unix domain sockets (via [`IpcStream`]) and TCP.

pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use tcp::connect_tcp;
pub use traits::{IpcStream, Transport, TransportUpgrade, UpgradeSide};

#[cfg(unix)]
pub use uds::UdsListener;
