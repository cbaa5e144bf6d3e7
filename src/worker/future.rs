//! Completion handle returned by [`WorkerPool::post`](super::WorkerPool::post).

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Resolves once the posted task has run (or been cancelled).
///
/// If the task panics its sender is dropped, so waiting never hangs: the
/// future resolves to "no value".
pub struct TaskFuture<R> {
    rx: Receiver<R>,
}

/// Producer half, moved into the task closure.
pub(crate) struct TaskPromise<R> {
    tx: Sender<R>,
}

pub(crate) fn task_channel<R>() -> (TaskPromise<R>, TaskFuture<R>) {
    let (tx, rx) = bounded(1);
    (TaskPromise { tx }, TaskFuture { rx })
}

impl<R> TaskPromise<R> {
    pub(crate) fn fulfil(self, value: R) {
        // The waiter may have given up already; that is fine.
        let _ = self.tx.send(value);
    }
}

impl<R> TaskFuture<R> {
    /// Block until the task resolves. `None` if it panicked.
    pub fn wait(self) -> Option<R> {
        self.rx.recv().ok()
    }

    /// Block for at most `timeout`; returns `on_timeout` if the task did not
    /// resolve in time or panicked.
    pub fn wait_or(self, timeout: Duration, on_timeout: R) -> R {
        self.wait_timeout(timeout).unwrap_or(on_timeout)
    }

    /// Block for at most `timeout`, telling a slow task apart from a dead one.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, WaitError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WaitError::Timeout,
            RecvTimeoutError::Disconnected => WaitError::Abandoned,
        })
    }
}

/// Why a [`TaskFuture`] produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The task did not finish within the budget; it may still run later.
    Timeout,
    /// The task panicked or was dropped without resolving.
    Abandoned,
}
