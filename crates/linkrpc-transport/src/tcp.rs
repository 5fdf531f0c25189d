use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::Transport;

impl Transport for TcpStream {
    fn try_clone_stream(&self) -> Result<Self> {
        Ok(self.try_clone()?)
    }

    fn shutdown_stream(&self) -> Result<()> {
        match self.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout).map_err(Into::into)
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Connect a TCP stream with Nagle disabled, which suits small request frames.
pub fn connect_tcp(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<TcpStream> {
    let stream = TcpStream::connect(&addr).map_err(|e| TransportError::Connect {
        path: format!("{addr:?}").into(),
        source: e,
    })?;
    stream.set_nodelay(true)?;
    debug!(?addr, "connected over tcp");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn tcp_stream_round_trips_through_clone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let client = connect_tcp(addr).unwrap();
        let mut writer = client.try_clone_stream().unwrap();
        let mut reader = client;
        writer.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(reader.transport_name(), "tcp");

        server.join().unwrap();
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_tcp(addr).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
