//! One live byte stream and the per-connection state both ends share.
//!
//! A dedicated I/O thread owns the read half and all frame decoding.
//! Writers from any thread serialize on the writer lock, which is never
//! held while waiting on the multiplexer.

use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use linkrpc_frame::{
    parse_body, Frame, FrameConfig, FrameError, FrameReader, FrameWriter, ProtocolVersion,
};
use linkrpc_transport::Transport;
use tracing::{debug, info, trace, warn};

use crate::control::ControlMessage;
use crate::delivery::DeliveryQueue;
use crate::error::{Result, SessionError};
use crate::multiplexer::Multiplexer;
use crate::state::{ConnectionState, StateCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

pub(crate) enum KeepaliveTick {
    Idle,
    Ping,
    Expired,
}

/// Liveness window announced with `enableTimeout`.
pub(crate) struct Keepalive {
    timeout: Option<Duration>,
    last_heard: Instant,
    last_ping: Instant,
}

impl Keepalive {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            timeout: None,
            last_heard: now,
            last_ping: now,
        }
    }

    pub(crate) fn enable(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.timeout = Some(timeout);
        self.last_heard = now;
        self.last_ping = now;
    }

    pub(crate) fn disable(&mut self) {
        self.timeout = None;
    }

    pub(crate) fn heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Ping every quarter window; expire after a full window of silence.
    pub(crate) fn poll(&mut self, now: Instant) -> KeepaliveTick {
        let Some(timeout) = self.timeout else {
            return KeepaliveTick::Idle;
        };
        if now.saturating_duration_since(self.last_heard) >= timeout {
            return KeepaliveTick::Expired;
        }
        if now.saturating_duration_since(self.last_ping) >= timeout / 4 {
            self.last_ping = now;
            return KeepaliveTick::Ping;
        }
        KeepaliveTick::Idle
    }
}

type Closer = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Link {
    side: Side,
    label: String,
    version: AtomicU32,
    version_fixed: AtomicBool,
    state: StateCell,
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    closer: Closer,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    mux: Multiplexer,
    queue: DeliveryQueue,
    io_thread: OnceLock<ThreadId>,
    io_handle: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Keepalive>,
    poll_interval: Duration,
}

impl Link {
    /// Split `transport` into a link (write half plus closer) and the read
    /// half for the I/O thread.
    pub(crate) fn open<T: Transport>(
        transport: T,
        side: Side,
        label: &str,
        frame: FrameConfig,
        poll_interval: Duration,
    ) -> Result<(Arc<Self>, FrameReader<T>)> {
        let write_half = transport.try_clone_stream()?;
        let close_half = transport.try_clone_stream()?;
        transport.set_stream_read_timeout(Some(poll_interval))?;
        debug!(
            connection = label,
            transport = transport.transport_name(),
            ?side,
            "opening link"
        );

        let queue = DeliveryQueue::spawn(label)?;
        let writer: Box<dyn Write + Send> = Box::new(write_half);
        let link = Arc::new(Self {
            side,
            label: label.to_string(),
            version: AtomicU32::new(ProtocolVersion::V0.as_u32()),
            version_fixed: AtomicBool::new(false),
            state: StateCell::new(),
            writer: Mutex::new(FrameWriter::with_config(writer, frame.clone())),
            closer: Box::new(move || {
                if let Err(err) = close_half.shutdown_stream() {
                    trace!(error = %err, "shutdown after close");
                }
            }),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            mux: Multiplexer::new(queue.clone()),
            queue,
            io_thread: OnceLock::new(),
            io_handle: Mutex::new(None),
            keepalive: Mutex::new(Keepalive::new()),
            poll_interval,
        });
        Ok((link, FrameReader::with_config(transport, frame)))
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }

    pub(crate) fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub(crate) fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        ProtocolVersion::clamp(self.version.load(Ordering::Acquire))
    }

    #[cfg(test)]
    fn is_version_fixed(&self) -> bool {
        self.version_fixed.load(Ordering::Acquire)
    }

    /// Fix the protocol version. Later attempts are ignored.
    pub(crate) fn fix_version(&self, version: ProtocolVersion) -> bool {
        if self.version_fixed.swap(true, Ordering::AcqRel) {
            warn!(connection = %self.label, %version, "protocol version already fixed");
            return false;
        }
        self.version.store(version.as_u32(), Ordering::Release);
        info!(connection = %self.label, %version, "protocol version fixed");
        true
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        let moved = self.state.advance(to);
        if moved {
            debug!(connection = %self.label, state = %to, "state advanced");
        }
        moved
    }

    pub(crate) fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.state.wait_for(target, timeout)
    }

    pub(crate) fn enable_keepalive(&self, timeout: Duration) {
        debug!(connection = %self.label, ?timeout, "keepalive enabled");
        self.keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enable(timeout);
    }

    pub(crate) fn disable_keepalive(&self) {
        debug!(connection = %self.label, "keepalive disabled");
        self.keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disable();
    }

    /// Encode `frame` at the current version and write it.
    ///
    /// Stream failures close the link; encode failures (an outcome the
    /// version cannot carry, an oversized body) only fail this send.
    pub(crate) fn send(&self, frame: &Frame) -> Result<()> {
        if let Some(reason) = self.close_reason() {
            return Err(SessionError::Disconnected(reason));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.set_version(self.version());
        match writer.write_frame(frame) {
            Ok(()) => {
                trace!(
                    connection = %self.label,
                    kind = ?frame.kind(),
                    id = ?frame.id(),
                    "frame sent"
                );
                Ok(())
            }
            Err(err @ (FrameError::Io(_) | FrameError::ConnectionClosed)) => {
                drop(writer);
                let reason = format!("write failed: {err}");
                self.close(&reason);
                Err(SessionError::Disconnected(reason))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn send_control(&self, id: u32, msg: &ControlMessage) -> Result<()> {
        trace!(connection = %self.label, id, control = msg.name(), "control out");
        self.send(&msg.to_frame(id)?)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear the connection down. Only the first call has any effect.
    pub(crate) fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        info!(connection = %self.label, reason, "connection closed");
        (self.closer)();
        self.state.close();
        self.mux.flush(reason);
        true
    }

    pub(crate) fn on_io_thread(&self) -> bool {
        self.io_thread.get() == Some(&thread::current().id())
    }

    /// Wait for the I/O thread to finish. No-op from the I/O thread itself.
    pub(crate) fn join(&self) {
        if self.on_io_thread() {
            return;
        }
        let handle = self
            .io_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(connection = %self.label, "I/O thread panicked");
            }
        }
    }

    fn tick(&self, now: Instant) {
        self.mux.expire_overdue(now);
        let tick = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll(now);
        match tick {
            KeepaliveTick::Idle => {}
            KeepaliveTick::Ping => {
                if let Err(err) = self.send_control(0, &ControlMessage::Ping) {
                    debug!(connection = %self.label, error = %err, "ping failed");
                }
            }
            KeepaliveTick::Expired => {
                warn!(connection = %self.label, "nothing heard within the keepalive window");
                self.close("keepalive expired");
            }
        }
    }

    fn heard(&self) {
        self.keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heard(Instant::now());
    }
}

/// Per-side frame processing run on the I/O thread.
pub(crate) trait FrameHandler: Send + 'static {
    fn on_start(&mut self, _link: &Arc<Link>) {}

    fn on_frame(&mut self, link: &Arc<Link>, frame: Frame);

    /// A body that could not be turned into a usable frame.
    fn on_protocol_error(&mut self, link: &Arc<Link>, err: FrameError);

    fn on_closed(&mut self, _link: &Arc<Link>, _reason: &str) {}
}

/// Parse `body` at the link's version, falling back once to the legacy
/// layout when `legacy_retry` is set.
fn decode(
    body: &[u8],
    version: ProtocolVersion,
    legacy_retry: bool,
) -> linkrpc_frame::Result<Frame> {
    let first = match parse_body(body, version) {
        Ok(Frame::Invalid) => Err(FrameError::Malformed("frame flagged invalid".into())),
        other => other,
    };
    match first {
        Ok(frame) => Ok(frame),
        Err(err) if legacy_retry && version != ProtocolVersion::V0 => {
            match parse_body(body, ProtocolVersion::V0) {
                Ok(frame) if !frame.is_invalid() => {
                    debug!(%version, error = %err, "frame recovered with the legacy layout");
                    Ok(frame)
                }
                _ => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Start the I/O thread for `link`.
pub(crate) fn spawn_io<T, H>(
    link: Arc<Link>,
    mut reader: FrameReader<T>,
    mut handler: H,
    legacy_retry: bool,
) -> Result<()>
where
    T: Transport,
    H: FrameHandler,
{
    let thread_link = Arc::clone(&link);
    let handle = thread::Builder::new()
        .name(format!("linkrpc-io-{}", link.label))
        .spawn(move || {
            let link = thread_link;
            let _ = link.io_thread.set(thread::current().id());
            handler.on_start(&link);
            let mut last_tick = Instant::now();

            while !link.is_closed() {
                match reader.read_body() {
                    Ok(body) => {
                        link.heard();
                        match decode(&body, link.version(), legacy_retry) {
                            Ok(frame) => handler.on_frame(&link, frame),
                            Err(err) => handler.on_protocol_error(&link, err),
                        }
                    }
                    Err(FrameError::Io(err))
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(FrameError::ConnectionClosed) => {
                        link.close("peer closed the connection");
                    }
                    Err(FrameError::Io(err)) => {
                        link.close(&format!("read failed: {err}"));
                    }
                    Err(err) => {
                        let reason = format!("unreadable stream: {err}");
                        handler.on_protocol_error(&link, err);
                        link.close(&reason);
                    }
                }

                let now = Instant::now();
                if now.duration_since(last_tick) >= link.poll_interval {
                    last_tick = now;
                    link.tick(now);
                }
            }

            let reason = link
                .close_reason()
                .unwrap_or_else(|| "connection closed".to_string());
            handler.on_closed(&link, &reason);
            debug!(connection = %link.label, "I/O thread finished");
        })?;
    *link.io_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    Ok(())
}
