use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Negotiation progress of one connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Connecting = 0,
    NegotiatingService = 1,
    Ready = 2,
}

impl ConnectionState {
    /// Value carried by the `stateChanged(int)` control message.
    pub fn as_wire(self) -> i64 {
        self as i64
    }

    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Connecting),
            1 => Some(Self::NegotiatingService),
            2 => Some(Self::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::NegotiatingService => "negotiating-service",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

struct Slot {
    state: ConnectionState,
    closed: bool,
}

/// Forward-only state holder other threads can wait on.
pub(crate) struct StateCell {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: ConnectionState::Connecting,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Move to `to` if that is forward. Returns whether the state changed.
    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed || to <= slot.state {
            return false;
        }
        slot.state = to;
        self.changed.notify_all();
        true
    }

    /// The connection is gone; release every waiter.
    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.closed = true;
        self.changed.notify_all();
    }

    /// Block until the state is at least `target`. Returns false on
    /// timeout or when the connection closes first.
    pub(crate) fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        while slot.state < target {
            let now = Instant::now();
            if slot.closed || now >= deadline {
                return false;
            }
            slot = self
                .changed
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
