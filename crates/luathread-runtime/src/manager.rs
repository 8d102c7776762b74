//! The manager: the controlling thread's side of a manager/worker pair.
//!
//! A [`Manager`] owns a worker, the port the worker reports to, the result
//! callback and the output buffer. It never blocks on the worker. Messages are
//! dispatched when the owning thread calls [`Manager::pump`] (non-blocking) or
//! awaits [`Manager::dispatch_next`] / [`Manager::run_until_result`].

use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use dashmap::DashSet;

use crate::config::ManagerConfig;
use crate::error::ThreadError;
use crate::handle::WorkerHandle;
use crate::instance::{InstanceFactory, RuntimeAccessor};
use crate::logging::{self, MANAGER_TAG};
use crate::message::{Input, Message, MessageKind, Outcome};
use crate::port::MessagePort;
use crate::registry::{RefHandle, RefRegistry, RefTable};
use crate::spawn::Worker;
use crate::state::WorkerState;
use crate::store::SharedStore;

type ResultCallback = Box<dyn FnMut(&Outcome)>;

static NAMES: OnceLock<DashSet<String>> = OnceLock::new();

fn names() -> &'static DashSet<String> {
    NAMES.get_or_init(DashSet::new)
}

/// Claim on a manager name; released on drop.
struct NameGuard(String);

impl NameGuard {
    fn claim(name: &str) -> Result<Self, ThreadError> {
        if !names().insert(name.to_string()) {
            return Err(ThreadError::Config(format!(
                "a manager named {} already exists",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        names().remove(&self.0);
    }
}

/// Builder for a [`Manager`] and its worker.
pub struct ManagerBuilder {
    name: Option<String>,
    print_immediate: bool,
    reset_on_restart: bool,
    clean_close: bool,
    init_script: Option<String>,
    interrupt_interval: u32,
    accessor: RuntimeAccessor,
    instance: Option<InstanceFactory>,
    sink: Option<Box<dyn Write>>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

impl ManagerBuilder {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            name: config.name.clone(),
            print_immediate: config.print_immediate,
            reset_on_restart: config.reset_on_restart,
            clean_close: config.clean_close,
            init_script: config.init_script.clone(),
            interrupt_interval: config.interrupt_interval,
            accessor: RuntimeAccessor::from_kind(config.runtime),
            instance: None,
            sink: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn print_immediate(mut self, immediate: bool) -> Self {
        self.print_immediate = immediate;
        self
    }

    pub fn reset_on_restart(mut self, reset: bool) -> Self {
        self.reset_on_restart = reset;
        self
    }

    pub fn clean_close(mut self, clean: bool) -> Self {
        self.clean_close = clean;
        self
    }

    pub fn init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    pub fn interrupt_interval(mut self, interval: u32) -> Self {
        self.interrupt_interval = interval;
        self
    }

    pub fn accessor(mut self, accessor: RuntimeAccessor) -> Self {
        self.accessor = accessor;
        self
    }

    /// Host a custom instance instead of Lua.
    pub fn instance(mut self, factory: InstanceFactory) -> Self {
        self.instance = Some(factory);
        self
    }

    /// Where flushed output goes. Defaults to stdout.
    pub fn output_sink(mut self, sink: impl Write + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Spawn the worker and return its manager. The manager belongs to the
    /// calling thread.
    pub fn spawn(self) -> Result<Manager, ThreadError> {
        let name = self
            .name
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let guard = NameGuard::claim(&name)?;

        let (inbox, out_port) = MessagePort::open();
        let mut worker = Worker::new(out_port, name.clone())
            .accessor(self.accessor.clone())
            .reset_on_restart(self.reset_on_restart)
            .clean_close(self.clean_close)
            .init_script(self.init_script)
            .interrupt_interval(self.interrupt_interval);
        if let Some(factory) = self.instance {
            worker = worker.instance(factory);
        }
        let worker = worker.start()?;

        logging::debug(&name, "manager ready");

        Ok(Manager {
            worker,
            inbox,
            name,
            accessor: self.accessor,
            callbacks: RefTable::new(),
            registry: RefRegistry::current(),
            output: Vec::new(),
            sink: self.sink.unwrap_or_else(|| Box::new(io::stdout())),
            print_immediate: self.print_immediate,
            abandoned: false,
            _name: guard,
        })
    }
}

/// Controlling side of one manager/worker pair. Lives on the thread that
/// created it.
pub struct Manager {
    worker: WorkerHandle,
    inbox: MessagePort,
    name: String,
    accessor: RuntimeAccessor,
    callbacks: RefTable<ResultCallback>,
    registry: RefRegistry,
    output: Vec<u8>,
    sink: Box<dyn Write>,
    print_immediate: bool,
    /// Abruptly cancelled: whatever still arrives is dropped.
    abandoned: bool,
    _name: NameGuard,
}

impl Manager {
    /// A thread-aware Lua manager named `name`.
    pub fn create(name: impl Into<String>) -> Result<Manager, ThreadError> {
        Self::builder().name(name).spawn()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the result callback, replacing any previous one. Returns its
    /// handle in this thread's callback table.
    pub fn on_result(
        &mut self,
        callback: impl FnMut(&Outcome) + 'static,
    ) -> Result<RefHandle, ThreadError> {
        self.clear_callback()?;
        let handle = self.callbacks.insert(Box::new(callback));
        if let Err(e) = self.registry.set_ref(&self.name, MANAGER_TAG, handle) {
            self.callbacks.remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Remove the result callback. Results are then written to the output
    /// buffer as JSON lines.
    pub fn clear_callback(&mut self) -> Result<bool, ThreadError> {
        Ok(match self.registry.remove_ref(&self.name, MANAGER_TAG)? {
            Some(handle) => self.callbacks.remove(handle).is_some(),
            None => false,
        })
    }

    /// Queue code for the worker.
    pub fn send(&self, input: impl Into<Input>) -> Result<(), ThreadError> {
        self.worker.submit(input)
    }

    /// Cancel the worker. After an abrupt cancel nothing more is delivered.
    pub fn cancel(&mut self, clean: bool) -> bool {
        let requested = self.worker.cancel(clean);
        if requested && !clean {
            self.abandoned = true;
            let dropped = self.inbox.discard_pending();
            if dropped > 0 {
                logging::debug(
                    &self.name,
                    format_args!("dropped {} message(s) after abrupt cancel", dropped),
                );
            }
        }
        requested
    }

    pub fn restart(&self) -> Result<(), ThreadError> {
        self.worker.restart()
    }

    pub fn set_reset_on_restart(&self, reset: bool) {
        self.worker.set_reset_on_restart(reset);
    }

    pub fn set_print_immediate(&mut self, immediate: bool) {
        self.print_immediate = immediate;
    }

    pub fn set_output_sink(&mut self, sink: impl Write + 'static) {
        self.sink = Box::new(sink);
    }

    /// Write the buffered output to the sink and clear the buffer. Returns the
    /// number of bytes written.
    pub fn flush_output(&mut self) -> usize {
        if self.output.is_empty() {
            return 0;
        }
        let output = std::mem::take(&mut self.output);
        let result = self
            .sink
            .write_all(&output)
            .and_then(|_| self.sink.flush());
        if let Err(e) = result {
            logging::error(&self.name, format_args!("output sink failed: {}", e));
        }
        output.len()
    }

    /// Drain the buffered output without calling the sink.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Dispatch every message already queued. Never waits.
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(Some(message)) => {
                    self.dispatch(message);
                    count += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    logging::verbose(&self.name, "worker port closed");
                    break;
                }
            }
        }
        count
    }

    /// Wait for the next message and dispatch it. `None` once the worker is
    /// gone.
    pub async fn dispatch_next(&mut self) -> Option<MessageKind> {
        let message = self.inbox.recv().await?;
        let kind = message.kind();
        self.dispatch(message);
        Some(kind)
    }

    /// Dispatch messages until a Result arrives and return it. The callback
    /// sees it too. `None` once the worker is gone.
    pub async fn run_until_result(&mut self) -> Option<Outcome> {
        loop {
            let message = self.inbox.recv().await?;
            if self.abandoned {
                continue;
            }
            if let Message::Result(outcome) = &message {
                let outcome = outcome.clone();
                self.dispatch(message);
                return Some(outcome);
            }
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: Message) {
        if self.abandoned {
            logging::verbose(
                &self.name,
                format_args!("dropping {:?} from abandoned worker", message.kind()),
            );
            return;
        }

        match message {
            Message::Result(outcome) => self.deliver_result(&outcome),
            Message::PrintFlush { output } => {
                self.output.extend_from_slice(&output);
                if self.print_immediate {
                    self.flush_output();
                }
            }
            other => logging::verbose(
                &self.name,
                format_args!("ignoring unexpected {:?}", other.kind()),
            ),
        }
    }

    fn deliver_result(&mut self, outcome: &Outcome) {
        if let Outcome::Unavailable(reason) = outcome {
            logging::error(&self.name, format_args!("worker unavailable: {}", reason));
        }

        let handle = match self.registry.get_ref(&self.name, MANAGER_TAG) {
            Ok(handle) => Some(handle),
            Err(ThreadError::ReferenceNotFound { .. }) => None,
            Err(e) => {
                logging::error(&self.name, format_args!("callback lookup failed: {}", e));
                None
            }
        };
        let callback = handle.and_then(|handle| self.callbacks.get_mut(handle));
        if let Some(callback) = callback {
            callback(outcome);
            return;
        }

        let line = match outcome {
            Outcome::Values(values) => serde_json::to_string(values),
            other => serde_json::to_string(other),
        };
        match line {
            Ok(line) => {
                self.output.extend_from_slice(line.as_bytes());
                self.output.push(b'\n');
                if self.print_immediate {
                    self.flush_output();
                }
            }
            Err(e) => logging::error(&self.name, format_args!("unable to render result: {}", e)),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn is_idle(&self) -> bool {
        self.worker.is_idle()
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Shared store the worker sees, if thread-aware.
    pub fn store(&self) -> Option<&Arc<SharedStore>> {
        self.accessor.store()
    }

    /// Wait for the worker thread to exit after a cancel.
    pub fn join(self) -> Result<(), ThreadError> {
        self.worker.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RefAccessor;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    /// Output sink the test can read back.
    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn private_store() -> RuntimeAccessor {
        RuntimeAccessor::ThreadAware {
            store: Arc::new(SharedStore::new()),
        }
    }

    async fn next_result(manager: &mut Manager) -> Option<Outcome> {
        tokio::time::timeout(Duration::from_secs(10), manager.run_until_result())
            .await
            .expect("timed out waiting for a result")
    }

    async fn wait_for_state(manager: &Manager, state: WorkerState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for state");
    }

    #[tokio::test]
    async fn test_m1_two_plus_two() {
        let mut manager = Manager::create("M1").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        manager
            .on_result(move |outcome| sink.borrow_mut().push(outcome.clone()))
            .unwrap();

        manager.send("2+2").unwrap();
        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![json!(4)]))
        );
        assert_eq!(*seen.borrow(), vec![Outcome::Values(vec![json!(4)])]);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let _first = Manager::create("dup-name").unwrap();
        assert!(matches!(
            Manager::create("dup-name"),
            Err(ThreadError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_inputs_run_in_send_order() {
        let mut manager = Manager::builder()
            .name("fifo")
            .accessor(private_store())
            .spawn()
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        manager
            .on_result(move |outcome| {
                if let Some(values) = outcome.values() {
                    sink.borrow_mut().push(values.to_vec());
                }
            })
            .unwrap();

        manager.send("n = 0").unwrap();
        for _ in 0..5 {
            manager.send("n = n + 1; return n").unwrap();
        }
        for _ in 0..6 {
            next_result(&mut manager).await;
        }

        let seen = seen.borrow();
        assert_eq!(seen[0], Vec::<serde_json::Value>::new());
        let counts: Vec<_> = seen[1..].iter().map(|v| v[0].clone()).collect();
        assert_eq!(counts, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn test_clean_cancel_while_busy_delivers_final_output() {
        let captured = Captured::default();
        let mut manager = Manager::builder()
            .name("clean-cancel")
            .accessor(private_store())
            .output_sink(captured.clone())
            .spawn()
            .unwrap();

        manager
            .send("local t = os.clock() while os.clock() - t < 0.2 do end print('done') return 1")
            .unwrap();
        manager.send("print('queued')").unwrap();
        wait_for_state(&manager, WorkerState::Busy).await;

        assert!(manager.cancel(true));
        assert!(matches!(
            manager.send("1"),
            Err(ThreadError::WorkerUnavailable(_))
        ));

        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![json!(1)]))
        );
        assert_eq!(next_result(&mut manager).await, Some(Outcome::Cancelled));
        assert_eq!(next_result(&mut manager).await, None);

        // Results without a callback go to the output as JSON lines.
        manager.flush_output();
        assert_eq!(captured.text(), "done\n[1]\n{\"status\":\"cancelled\"}\n");
    }

    #[tokio::test]
    async fn test_abrupt_cancel_delivers_nothing() {
        let mut manager = Manager::builder()
            .name("abrupt-cancel")
            .accessor(private_store())
            .interrupt_interval(100)
            .spawn()
            .unwrap();
        let called = Rc::new(RefCell::new(0));
        let count = Rc::clone(&called);
        manager.on_result(move |_| *count.borrow_mut() += 1).unwrap();

        manager.send("print('never') while true do end").unwrap();
        wait_for_state(&manager, WorkerState::Busy).await;

        assert!(manager.cancel(false));
        assert_eq!(next_result(&mut manager).await, None);
        assert_eq!(*called.borrow(), 0);
        assert_eq!(manager.output_len(), 0);
        assert_eq!(manager.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_restart_with_and_without_reset() {
        let mut manager = Manager::builder()
            .name("restart")
            .accessor(private_store())
            .spawn()
            .unwrap();

        manager.send("x = 42").unwrap();
        next_result(&mut manager).await;

        manager.restart().unwrap();
        manager.send("x").unwrap();
        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![json!(42)]))
        );

        manager.set_reset_on_restart(true);
        manager.restart().unwrap();
        manager.send("x").unwrap();
        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![serde_json::Value::Null]))
        );
    }

    #[tokio::test]
    async fn test_init_script_runs_and_failure_is_unavailable() {
        let mut manager = Manager::builder()
            .name("init-ok")
            .accessor(private_store())
            .init_script("greeting = 'hi'")
            .spawn()
            .unwrap();
        manager.send("greeting").unwrap();
        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![json!("hi")]))
        );

        let mut broken = Manager::builder()
            .name("init-broken")
            .accessor(private_store())
            .init_script("error('bad init')")
            .spawn()
            .unwrap();
        match next_result(&mut broken).await {
            Some(Outcome::Unavailable(reason)) => assert!(reason.contains("bad init")),
            other => panic!("expected unavailable, got {:?}", other),
        }
        assert!(matches!(
            broken.send("1"),
            Err(ThreadError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_restart_is_fatal() {
        let mut manager = Manager::builder()
            .name("restart-fails")
            .accessor(private_store())
            .reset_on_restart(true)
            .init_script(
                "if thread.get('init-ran') then error('second start') end \
                 thread.set('init-ran', true)",
            )
            .spawn()
            .unwrap();
        manager.send("1").unwrap();
        assert_eq!(
            next_result(&mut manager).await,
            Some(Outcome::Values(vec![json!(1)]))
        );

        manager.restart().unwrap();
        match next_result(&mut manager).await {
            Some(Outcome::Unavailable(reason)) => assert!(reason.contains("second start")),
            other => panic!("expected unavailable, got {:?}", other),
        }
        assert!(manager.state().is_closed());
        assert!(matches!(
            manager.send("1"),
            Err(ThreadError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_does_not_wait_for_blocking_call() {
        let manager = Manager::builder()
            .name("drop-blocking")
            .accessor(private_store())
            .spawn()
            .unwrap();
        manager.send("os.execute('sleep 2')").unwrap();
        wait_for_state(&manager, WorkerState::Busy).await;

        let started = std::time::Instant::now();
        drop(manager);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_store_shared_with_worker() {
        let mut manager = Manager::builder()
            .name("store")
            .accessor(private_store())
            .spawn()
            .unwrap();
        let store = Arc::clone(manager.store().unwrap());

        store.set("shared", json!(5)).unwrap();
        manager.send("thread.set('back', thread.get('shared') + 1)").unwrap();
        next_result(&mut manager).await;
        assert_eq!(store.get("back").unwrap(), Some(json!(6)));
    }

    #[tokio::test]
    async fn test_default_runtime_cannot_reach_store() {
        let mut manager = Manager::builder()
            .name("no-store")
            .accessor(RuntimeAccessor::Default)
            .spawn()
            .unwrap();
        assert!(manager.store().is_none());

        manager.send("thread.get('x')").unwrap();
        assert!(next_result(&mut manager).await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_print_immediate() {
        let captured = Captured::default();
        let mut manager = Manager::builder()
            .name("immediate")
            .accessor(private_store())
            .print_immediate(true)
            .output_sink(captured.clone())
            .spawn()
            .unwrap();
        manager.on_result(|_| {}).unwrap();

        manager.send("print('now')").unwrap();
        next_result(&mut manager).await;
        assert_eq!(captured.text(), "now\n");
        assert_eq!(manager.output_len(), 0);

        manager.set_print_immediate(false);
        manager.send("print('later')").unwrap();
        next_result(&mut manager).await;
        assert_eq!(captured.text(), "now\n");
        assert_eq!(manager.take_output(), b"later\n".to_vec());
    }

    #[tokio::test]
    async fn test_callback_handles_and_cross_thread_refs() {
        let mut manager = Manager::builder()
            .name("refs")
            .accessor(private_store())
            .spawn()
            .unwrap();
        let accessor = RefAccessor::new();

        let handle = manager.on_result(|_| {}).unwrap();
        assert_eq!(
            accessor
                .get_handle("refs", MANAGER_TAG, std::thread::current().id())
                .unwrap(),
            handle
        );
        assert!(manager.clear_callback().unwrap());
        assert!(!manager.clear_callback().unwrap());

        manager.send("thread.ref('mod', 'cb', function() end)").unwrap();
        let worker_handle = match next_result(&mut manager).await {
            Some(Outcome::Values(values)) => values[0].as_i64().unwrap() as RefHandle,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            accessor
                .get_handle("cb", "mod", manager.worker().thread_id())
                .unwrap(),
            worker_handle
        );
    }

    #[tokio::test]
    async fn test_pump_never_blocks() {
        let mut manager = Manager::builder()
            .name("pump")
            .accessor(private_store())
            .spawn()
            .unwrap();
        assert_eq!(manager.pump(), 0);

        manager.send("print('p') return 1").unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.output_len() < "p\n[1]\n".len() {
                manager.pump();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.take_output(), b"p\n[1]\n".to_vec());
    }
}
