//! Pending-call table for one connection.
//!
//! Every request that expects a `Return` is registered here under a fresh
//! id. An entry leaves the table exactly once: on a concrete reply, on its
//! deadline, or when the connection goes away. Whoever removes it delivers
//! the outcome; everyone else finds nothing and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use linkrpc_frame::Outcome;
use tracing::{debug, trace, warn};

use crate::codes;
use crate::delivery::DeliveryQueue;

/// Receives the outcome of an asynchronous call.
///
/// Invoked on the connection's delivery thread, never on the I/O thread.
pub trait CallSink: Send + Sync + 'static {
    fn deliver(&self, id: u32, outcome: Outcome);
}

impl<F> CallSink for F
where
    F: Fn(u32, Outcome) + Send + Sync + 'static,
{
    fn deliver(&self, id: u32, outcome: Outcome) {
        self(id, outcome)
    }
}

#[cfg(feature = "async")]
impl CallSink for tokio::sync::mpsc::UnboundedSender<(u32, Outcome)> {
    fn deliver(&self, id: u32, outcome: Outcome) {
        if self.send((id, outcome)).is_err() {
            trace!(id, "async call receiver dropped");
        }
    }
}

/// Handle a blocking caller holds while its call is in flight.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub(crate) id: u32,
    deadline: Instant,
    timeout: Duration,
    signal: Arc<Condvar>,
}

enum Waiter {
    Blocking(Arc<Condvar>),
    Async(Arc<dyn CallSink>),
}

struct Entry {
    deadline: Instant,
    timeout: Duration,
    waiter: Waiter,
    /// The peer answered `Pending`; a second reply is still due.
    accepted: bool,
}

struct Table {
    next_id: u32,
    pending: HashMap<u32, Entry>,
    /// Outcomes parked for blocking callers that have not woken yet.
    finished: HashMap<u32, Outcome>,
    closed: Option<String>,
}

struct Shared {
    table: Mutex<Table>,
    queue: DeliveryQueue,
}

/// Call-id allocator and pending-call table. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub(crate) fn new(queue: DeliveryQueue) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    next_id: 1,
                    pending: HashMap::new(),
                    finished: HashMap::new(),
                    closed: None,
                }),
                queue,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id for a blocking call.
    pub(crate) fn register_blocking(&self, timeout: Duration) -> Result<Ticket, Outcome> {
        let signal = Arc::new(Condvar::new());
        let deadline = Instant::now() + timeout;
        let id = self.insert(Entry {
            deadline,
            timeout,
            waiter: Waiter::Blocking(Arc::clone(&signal)),
            accepted: false,
        })?;
        Ok(Ticket {
            id,
            deadline,
            timeout,
            signal,
        })
    }

    /// Allocate an id for a call whose outcome goes to `sink`.
    pub(crate) fn register_async(
        &self,
        timeout: Duration,
        sink: Arc<dyn CallSink>,
    ) -> Result<u32, Outcome> {
        self.insert(Entry {
            deadline: Instant::now() + timeout,
            timeout,
            waiter: Waiter::Async(sink),
            accepted: false,
        })
    }

    fn insert(&self, entry: Entry) -> Result<u32, Outcome> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(codes::disconnected(reason));
        }
        let id = table.next_id;
        table.next_id = id
            .checked_add(1)
            .ok_or_else(|| Outcome::error(codes::ERROR, "call ids exhausted"))?;
        table.pending.insert(id, entry);
        trace!(id, "call registered");
        Ok(id)
    }

    /// Block until the call behind `ticket` resolves.
    ///
    /// Each wake re-checks the deadline, so a reply and a timeout racing
    /// each other resolve to whichever removes the entry first.
    pub(crate) fn wait(&self, ticket: Ticket) -> Outcome {
        let mut table = self.lock();
        loop {
            if let Some(outcome) = table.finished.remove(&ticket.id) {
                return outcome;
            }
            if !table.pending.contains_key(&ticket.id) {
                let reason = table.closed.as_deref().unwrap_or("call abandoned");
                return codes::disconnected(reason);
            }
            let now = Instant::now();
            if now >= ticket.deadline {
                table.pending.remove(&ticket.id);
                debug!(id = ticket.id, timeout = ?ticket.timeout, "call timed out");
                return codes::timed_out(ticket.timeout);
            }
            table = ticket
                .signal
                .wait_timeout(table, ticket.deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Resolve call `id`. Replies for ids no longer in the table are
    /// dropped; `Pending` marks the call accepted and keeps it waiting.
    pub(crate) fn complete(&self, id: u32, outcome: Outcome) -> bool {
        let mut table = self.lock();
        if outcome.is_pending() {
            return match table.pending.get_mut(&id) {
                Some(entry) => {
                    entry.accepted = true;
                    trace!(id, "call accepted, reply deferred");
                    true
                }
                None => false,
            };
        }
        let Some(entry) = table.pending.remove(&id) else {
            debug!(id, "discarding reply for unknown or expired call");
            return false;
        };
        match entry.waiter {
            Waiter::Blocking(signal) => {
                table.finished.insert(id, outcome);
                signal.notify_all();
            }
            Waiter::Async(sink) => {
                drop(table);
                self.deliver(sink, id, outcome);
            }
        }
        true
    }

    /// Forget a call whose request never made it onto the wire.
    pub(crate) fn abandon(&self, id: u32) {
        let mut table = self.lock();
        table.pending.remove(&id);
        table.finished.remove(&id);
    }

    /// Time out asynchronous calls past their deadline. Blocking callers
    /// time themselves out.
    pub(crate) fn expire_overdue(&self, now: Instant) -> usize {
        let mut table = self.lock();
        let overdue: Vec<u32> = table
            .pending
            .iter()
            .filter(|(_, e)| matches!(e.waiter, Waiter::Async(_)) && e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            if let Some(entry) = table.pending.remove(&id) {
                if let Waiter::Async(sink) = entry.waiter {
                    debug!(id, accepted = entry.accepted, "async call timed out");
                    expired.push((id, sink, entry.timeout));
                }
            }
        }
        drop(table);
        let count = expired.len();
        for (id, sink, timeout) in expired {
            self.deliver(sink, id, codes::timed_out(timeout));
        }
        count
    }

    /// Fail every outstanding call with a disconnect error and refuse new
    /// ones. Returns how many calls were flushed.
    pub(crate) fn flush(&self, reason: &str) -> usize {
        let mut table = self.lock();
        if table.closed.is_none() {
            table.closed = Some(reason.to_string());
        }
        let drained: Vec<(u32, Entry)> = table.pending.drain().collect();
        let mut sinks = Vec::new();
        for (id, entry) in drained {
            match entry.waiter {
                Waiter::Blocking(signal) => {
                    table.finished.insert(id, codes::disconnected(reason));
                    signal.notify_all();
                }
                Waiter::Async(sink) => sinks.push((id, sink)),
            }
        }
        drop(table);
        let count = sinks.len();
        for (id, sink) in sinks {
            self.deliver(sink, id, codes::disconnected(reason));
        }
        if count > 0 {
            debug!(count, reason, "flushed async calls");
        }
        count
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn deliver(&self, sink: Arc<dyn CallSink>, id: u32, outcome: Outcome) {
        if !self.shared.queue.submit(move || sink.deliver(id, outcome)) {
            warn!(id, "delivery thread gone; outcome dropped");
        }
    }
}
