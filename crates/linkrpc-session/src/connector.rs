use std::path::Path;

use linkrpc_transport::UdsListener;

use crate::client::Connection;
use crate::config::ClientConfig;
use crate::error::Result;

/// Connect to a [`crate::SessionListener`] at `path`.
pub fn connect(path: impl AsRef<Path>, config: ClientConfig) -> Result<Connection> {
    let path = path.as_ref();
    let stream = UdsListener::connect(path)?;
    Connection::connect_with_label(stream, config, &path.display().to_string())
}
