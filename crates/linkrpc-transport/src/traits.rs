use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::Duration;

use crate::error::Result;

/// An ordered, reliable, bidirectional byte stream.
///
/// The session layer clones a transport into independent handles: one is
/// owned by the connection's I/O thread for reading, one sits behind the
/// writer lock, and one is kept aside so the connection can be closed while
/// the other two are busy. The close handle is shared between threads, hence
/// `Sync`.
pub trait Transport: Read + Write + Send + Sync + 'static {
    /// Create another handle to the same underlying stream.
    fn try_clone_stream(&self) -> Result<Self>
    where
        Self: Sized;

    /// Close both directions. Blocked readers observe EOF.
    fn shutdown_stream(&self) -> Result<()>;

    /// Bound blocking reads. The I/O thread uses this as its tick.
    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Short name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

/// Which end of the connection an upgrade runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeSide {
    Client,
    Server,
}

/// Hook that switches an established stream to a secured mode (for example
/// TLS) in the middle of negotiation.
///
/// The concrete mechanism is up to the implementor; the session engine only
/// calls it between frames, from the connection's I/O thread.
pub trait TransportUpgrade: Send + Sync {
    fn upgrade(&self, side: UpgradeSide) -> Result<()>;
}

/// A connected local IPC stream.
///
/// On Unix this wraps a Unix domain socket stream.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    /// A connected in-process pair, mostly useful for tests.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(a), Self::from_unix(b)))
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Credentials of the connected peer as `(uid, gid, pid)` (Linux only).
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Credentials of the connected peer; unavailable on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl Transport for IpcStream {
    fn try_clone_stream(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    fn shutdown_stream(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown_stream(),
        }
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_stream_read_timeout(timeout),
        }
    }

    fn transport_name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> Result<Self> {
        Ok(self.try_clone()?)
    }

    fn shutdown_stream(&self) -> Result<()> {
        match self.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already closed by the peer.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout).map_err(Into::into)
    }

    fn transport_name(&self) -> &'static str {
        "unix-stream"
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => f.debug_struct("IpcStream").field("type", &"unix").finish(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn pair_is_connected_both_ways() {
        let (mut a, mut b) = IpcStream::pair().unwrap();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    fn shared_closer<T: Transport>(stream: T) -> std::sync::Arc<dyn Fn() + Send + Sync> {
        std::sync::Arc::new(move || {
            let _ = stream.shutdown_stream();
        })
    }

    #[test]
    fn close_handle_can_be_shared_across_threads() {
        let (a, _b) = IpcStream::pair().unwrap();
        let mut reader = a.try_clone_stream().unwrap();
        let close = shared_closer(a);

        let remote = std::sync::Arc::clone(&close);
        std::thread::spawn(move || remote()).join().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        close();

        let (tcp_listener, tcp_addr) = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = l.local_addr().unwrap();
            (l, addr)
        };
        let tcp = std::net::TcpStream::connect(tcp_addr).unwrap();
        let _accepted = tcp_listener.accept().unwrap();
        shared_closer(tcp)();
    }

    #[test]
    fn shutdown_from_clone_unblocks_reader() {
        let (a, _b) = IpcStream::pair().unwrap();
        let closer = a.try_clone_stream().unwrap();
        let mut reader = a;

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        closer.shutdown_stream().unwrap();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn read_timeout_surfaces_as_would_block() {
        let (mut a, _b) = IpcStream::pair().unwrap();
        a.set_stream_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = a.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.shutdown_stream().unwrap();
        a.shutdown_stream().unwrap();
        assert_eq!(a.transport_name(), "unix-stream");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_credentials_report_own_process() {
        let (a, _b) = IpcStream::pair().unwrap();
        let (_, _, pid) = a.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
