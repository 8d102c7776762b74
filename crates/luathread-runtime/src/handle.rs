//! WorkerHandle: the controlling side of a worker thread.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tokio::sync::watch;

use crate::error::ThreadError;
use crate::logging;
use crate::message::{Input, Message};
use crate::port::PortRef;
use crate::state::{WorkerState, WorkerStatus};

/// Handle to a spawned worker.
///
/// Every operation is fire-and-forget: effects are observed only through the
/// Result and PrintFlush messages the worker sends to its manager's port.
pub struct WorkerHandle {
    name: String,
    /// Worker's inbound port
    port: PortRef,
    /// Lifecycle state shared with the worker thread
    status: Arc<WorkerStatus>,
    /// Abrupt shutdown signal
    shutdown_tx: watch::Sender<bool>,
    thread_id: ThreadId,
    /// Thread join handle
    thread: Option<thread::JoinHandle<Result<(), ThreadError>>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        port: PortRef,
        status: Arc<WorkerStatus>,
        shutdown_tx: watch::Sender<bool>,
        thread: thread::JoinHandle<Result<(), ThreadError>>,
    ) -> Self {
        Self {
            name,
            port,
            status,
            shutdown_tx,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        }
    }

    fn ensure_open(&self) -> Result<(), ThreadError> {
        let state = self.status.state();
        if state.is_closed() {
            return Err(ThreadError::WorkerUnavailable(format!(
                "worker {} is {}",
                self.name, state
            )));
        }
        Ok(())
    }

    fn deliver(&self, message: Message) -> Result<(), ThreadError> {
        self.port.send(message).map_err(|_| {
            ThreadError::WorkerUnavailable(format!("worker {} is gone", self.name))
        })
    }

    /// Queue an input. Inputs run in the order they were submitted.
    pub fn submit(&self, input: impl Into<Input>) -> Result<(), ThreadError> {
        self.ensure_open()?;
        self.deliver(Message::Input(input.into()))
    }

    /// Request cancellation. A clean cancel lets the running input finish and
    /// flush, then tears the context down and reports `Outcome::Cancelled`. An
    /// abrupt one interrupts running code and reports nothing.
    ///
    /// Returns `false` if the worker was already cancelled.
    pub fn cancel(&self, clean: bool) -> bool {
        if !self.status.request_cancel(clean) {
            return false;
        }
        logging::debug(
            &self.name,
            format_args!("cancel requested (clean={})", clean),
        );

        // Wakes an idle worker; the status already blocks queued inputs.
        let _ = self.port.send(Message::Cancel { clean });
        if !clean {
            let _ = self.shutdown_tx.send(true);
        }
        true
    }

    /// Queue a restart behind any pending inputs.
    pub fn restart(&self) -> Result<(), ThreadError> {
        self.ensure_open()?;
        self.deliver(Message::Restart)
    }

    /// Whether the next restart drops interpreter state.
    pub fn set_reset_on_restart(&self, reset: bool) {
        self.status.set_reset_on_restart(reset);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    pub fn is_idle(&self) -> bool {
        self.status.is_idle()
    }

    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    /// Identity of the worker thread, for [`RefAccessor`](crate::RefAccessor)
    /// lookups.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the worker thread to exit. Only returns once the worker has
    /// been cancelled or has failed.
    pub fn join(mut self) -> Result<(), ThreadError> {
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| ThreadError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        let clean = self.status.clean_close();
        self.cancel(clean);
        // Never wait here: a native call can outlive the interrupt hook.
        if handle.is_finished() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("state", &self.status.state())
            .field("thread_id", &self.thread_id)
            .finish()
    }
}
