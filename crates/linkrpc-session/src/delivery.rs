use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::thread;

use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hands work to a per-connection delivery thread.
///
/// Async call results, events, callbacks and disconnect notices all run
/// here so user code never executes on the I/O thread. The thread exits
/// once every clone of the queue is dropped.
#[derive(Clone)]
pub(crate) struct DeliveryQueue {
    tx: Sender<Job>,
}

impl DeliveryQueue {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = channel::<Job>();
        let label = name.to_string();
        thread::Builder::new()
            .name(format!("linkrpc-deliver-{name}"))
            .spawn(move || {
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(connection = %label, "delivery handler panicked");
                    }
                }
                debug!(connection = %label, "delivery thread finished");
            })?;
        Ok(Self { tx })
    }

    /// Queue `job`. Returns false when the delivery thread is gone.
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}
