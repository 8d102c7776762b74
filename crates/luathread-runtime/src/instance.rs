//! The interpreter seam.
//!
//! A worker drives exactly one [`Instance`]. The instance is built on the
//! worker thread by an [`InstanceFactory`] and never leaves it, so it does not
//! need to be `Send`. [`WorkerContext`] is what the instance gets back from the
//! worker: its name, the shared store (when the runtime is thread-aware), the
//! output buffer and the channel back to the manager.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::RuntimeKind;
use crate::error::ThreadError;
use crate::logging::{self, LogLevel};
use crate::message::{Input, Message, Outcome};
use crate::port::PortRef;
use crate::registry::RefRegistry;
use crate::state::WorkerStatus;
use crate::store::SharedStore;

/// Capability handed to a worker at construction time, deciding what the
/// executed code may reach beyond its own interpreter.
#[derive(Clone, Default)]
pub enum RuntimeAccessor {
    /// Plain interpreter: no shared store, no thread API.
    #[default]
    Default,
    /// Thread-aware interpreter with access to `store`.
    ThreadAware { store: Arc<SharedStore> },
}

impl RuntimeAccessor {
    /// Thread-aware access to the process-wide store.
    pub fn thread_aware() -> Self {
        RuntimeAccessor::ThreadAware {
            store: SharedStore::global(),
        }
    }

    pub fn from_kind(kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::ThreadAware => Self::thread_aware(),
            RuntimeKind::Default => RuntimeAccessor::Default,
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        match self {
            RuntimeAccessor::Default => RuntimeKind::Default,
            RuntimeAccessor::ThreadAware { .. } => RuntimeKind::ThreadAware,
        }
    }

    pub fn store(&self) -> Option<&Arc<SharedStore>> {
        match self {
            RuntimeAccessor::Default => None,
            RuntimeAccessor::ThreadAware { store } => Some(store),
        }
    }
}

impl fmt::Debug for RuntimeAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuntimeAccessor").field(&self.kind()).finish()
    }
}

/// Behaviour of the interpreter context a worker hosts.
///
/// Only `start` and `execute` are required. The defaults mirror what a worker
/// does when nothing more specific is needed.
pub trait Instance {
    /// Create (or re-prepare) the interpreter context. Called once when the
    /// thread starts and again by the default `restart`.
    fn start(&mut self, ctx: &WorkerContext) -> Result<(), ThreadError>;

    /// Run one submitted input to completion.
    fn execute(&mut self, ctx: &WorkerContext, input: Input) -> Outcome;

    /// Tear down first when `reset` is set, then start again.
    fn restart(&mut self, ctx: &WorkerContext, reset: bool) -> Result<(), ThreadError> {
        if reset {
            self.teardown(ctx);
        }
        self.start(ctx)
    }

    /// Called once cancellation has been decided, before any flush or teardown.
    fn cancelled(&mut self, _ctx: &WorkerContext, _clean: bool) {}

    /// Finalize the interpreter context.
    fn teardown(&mut self, _ctx: &WorkerContext) {}

    fn log(&self, ctx: &WorkerContext, level: LogLevel, message: &str) {
        logging::log(level, ctx.name(), message);
    }
}

/// Builds the instance on the worker thread.
pub type InstanceFactory = Box<dyn FnOnce() -> Box<dyn Instance> + Send>;

struct ContextInner {
    name: String,
    manager: PortRef,
    status: Arc<WorkerStatus>,
    accessor: RuntimeAccessor,
    registry: RefRegistry,
    output: RefCell<Vec<u8>>,
}

/// Worker-thread view handed to an [`Instance`]. Cheap to clone; never leaves
/// the worker thread.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Rc<ContextInner>,
}

impl WorkerContext {
    pub(crate) fn new(
        name: String,
        manager: PortRef,
        status: Arc<WorkerStatus>,
        accessor: RuntimeAccessor,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                name,
                manager,
                status,
                accessor,
                registry: RefRegistry::current(),
                output: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn accessor(&self) -> &RuntimeAccessor {
        &self.inner.accessor
    }

    /// Shared store, if the runtime is thread-aware.
    pub fn store(&self) -> Option<&Arc<SharedStore>> {
        self.inner.accessor.store()
    }

    pub fn registry(&self) -> &RefRegistry {
        &self.inner.registry
    }

    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.inner.status
    }

    /// Abrupt cancellation has been requested; running code should stop.
    pub fn is_interrupted(&self) -> bool {
        self.inner.status.is_interrupted()
    }

    /// Append to the pending output. Nothing is sent until [`flush_output`].
    ///
    /// [`flush_output`]: WorkerContext::flush_output
    pub fn write_output(&self, bytes: &[u8]) {
        self.inner.output.borrow_mut().extend_from_slice(bytes);
    }

    pub fn pending_output(&self) -> usize {
        self.inner.output.borrow().len()
    }

    pub fn discard_output(&self) {
        self.inner.output.borrow_mut().clear();
    }

    /// Send pending output to the manager as one `PrintFlush`.
    pub fn flush_output(&self) {
        let output = std::mem::take(&mut *self.inner.output.borrow_mut());
        if output.is_empty() {
            return;
        }
        self.send(Message::PrintFlush { output });
    }

    /// Send an outcome to the manager as a `Result`.
    pub fn return_outcome(&self, outcome: Outcome) {
        self.send(Message::Result(outcome));
    }

    /// Tell the manager this worker cannot serve requests. Sent even when the
    /// worker is shutting down abruptly.
    pub(crate) fn report_unavailable(&self, reason: String) {
        self.deliver(Message::Result(Outcome::Unavailable(reason)));
    }

    fn send(&self, message: Message) {
        if self.is_interrupted() {
            logging::verbose(
                self.name(),
                format_args!("dropping {:?} after abrupt cancellation", message.kind()),
            );
            return;
        }
        self.deliver(message);
    }

    fn deliver(&self, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.inner.manager.send(message) {
            logging::error(
                self.name(),
                format_args!("unable to send {:?} to manager: {}", kind, e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessagePort;

    fn context(status: Arc<WorkerStatus>) -> (WorkerContext, MessagePort) {
        let (port, port_ref) = MessagePort::open();
        let ctx = WorkerContext::new(
            "ctx-test".to_string(),
            port_ref,
            status,
            RuntimeAccessor::Default,
        );
        (ctx, port)
    }

    #[test]
    fn test_flush_sends_one_message() {
        let (ctx, mut port) = context(Arc::new(WorkerStatus::new(false, false)));
        ctx.write_output(b"one\n");
        ctx.write_output(b"two\n");
        assert_eq!(ctx.pending_output(), 8);

        ctx.flush_output();
        ctx.flush_output();

        assert_eq!(
            port.try_recv().unwrap(),
            Some(Message::PrintFlush {
                output: b"one\ntwo\n".to_vec()
            })
        );
        assert!(port.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_nothing_sent_after_interrupt() {
        let status = Arc::new(WorkerStatus::new(false, false));
        let (ctx, mut port) = context(Arc::clone(&status));
        status.request_cancel(false);

        ctx.write_output(b"late\n");
        ctx.flush_output();
        ctx.return_outcome(Outcome::Values(vec![]));
        assert!(port.try_recv().unwrap().is_none());

        ctx.report_unavailable("gone".into());
        assert_eq!(
            port.try_recv().unwrap(),
            Some(Message::Result(Outcome::Unavailable("gone".into())))
        );
    }

    #[test]
    fn test_accessor_kinds() {
        assert!(RuntimeAccessor::Default.store().is_none());
        let aware = RuntimeAccessor::from_kind(RuntimeKind::ThreadAware);
        assert_eq!(aware.kind(), RuntimeKind::ThreadAware);
        assert!(Arc::ptr_eq(aware.store().unwrap(), &SharedStore::global()));
    }
}
