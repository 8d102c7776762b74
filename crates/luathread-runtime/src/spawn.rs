//! Worker construction.
//!
//! [`Worker`] collects the settings for one worker and [`Worker::start`] spawns
//! its dedicated thread. The thread opens the worker's inbound port, hands a
//! reference to it back to the caller, builds a current-thread tokio runtime
//! and runs the worker loop on it until the worker terminates.

use std::sync::Arc;
use std::sync::mpsc::sync_channel;
use std::thread;

use tokio::sync::watch;

use crate::error::ThreadError;
use crate::handle::WorkerHandle;
use crate::instance::{Instance, InstanceFactory, RuntimeAccessor, WorkerContext};
use crate::logging::{self, Origin};
use crate::lua::LuaInstance;
use crate::port::{MessagePort, PortRef};
use crate::state::WorkerStatus;
use crate::worker::run_worker;

/// Settings for a worker that has not been started yet.
pub struct Worker {
    name: String,
    manager: PortRef,
    accessor: RuntimeAccessor,
    reset_on_restart: bool,
    clean_close: bool,
    init_script: Option<String>,
    interrupt_interval: u32,
    factory: Option<InstanceFactory>,
}

impl Worker {
    /// A worker named `name` that reports to `out_port`. Thread-aware Lua
    /// unless configured otherwise.
    pub fn new(out_port: PortRef, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manager: out_port,
            accessor: RuntimeAccessor::thread_aware(),
            reset_on_restart: false,
            clean_close: false,
            init_script: None,
            interrupt_interval: 1000,
            factory: None,
        }
    }

    pub fn accessor(mut self, accessor: RuntimeAccessor) -> Self {
        self.accessor = accessor;
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

    /// Code the default Lua instance runs whenever it creates a fresh state:
    /// on start and on restarts that reset.
    pub fn init_script(mut self, script: Option<String>) -> Self {
        self.init_script = script;
        self
    }

    pub fn interrupt_interval(mut self, interval: u32) -> Self {
        self.interrupt_interval = interval;
        self
    }

    /// Replace the default Lua instance.
    pub fn instance(mut self, factory: InstanceFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Spawn the worker thread. Returns once the worker's port is open;
    /// interpreter start-up continues on the worker thread.
    pub fn start(self) -> Result<WorkerHandle, ThreadError> {
        let Worker {
            name,
            manager,
            accessor,
            reset_on_restart,
            clean_close,
            init_script,
            interrupt_interval,
            factory,
        } = self;

        tracing::debug!("[spawn_worker] Starting {}", name);

        let factory: InstanceFactory = match factory {
            Some(factory) => factory,
            None => {
                let accessor = accessor.clone();
                Box::new(move || -> Box<dyn Instance> {
                    Box::new(
                        LuaInstance::new(accessor)
                            .with_init_script(init_script)
                            .with_interrupt_interval(interrupt_interval),
                    )
                })
            }
        };

        let status = Arc::new(WorkerStatus::new(reset_on_restart, clean_close));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (init_tx, init_rx) = sync_channel::<PortRef>(1);

        let thread_status = Arc::clone(&status);
        let thread_name = name.clone();
        let thread_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || -> Result<(), ThreadError> {
                Origin::enter_worker();
                tracing::debug!("[spawn_worker:{}] Thread started", thread_name);

                let (inbox, port) = MessagePort::open();
                let ctx = WorkerContext::new(thread_name.clone(), manager, thread_status, accessor);
                if init_tx.send(port).is_err() {
                    return Err(ThreadError::PortClosed);
                }

                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        logging::error(&thread_name, format_args!("no runtime: {}", e));
                        ctx.status().fail();
                        ctx.report_unavailable(e.to_string());
                        ctx.status().terminate();
                        return Err(ThreadError::SpawnFailed(e));
                    }
                };

                let result = rt.block_on(run_worker(ctx, factory, inbox, shutdown_rx));

                rt.shutdown_background();
                tracing::debug!("[spawn_worker:{}] Thread exiting", thread_name);
                result
            })?;

        let port = init_rx.recv().map_err(|_| {
            ThreadError::WorkerUnavailable(format!("worker {} exited during start-up", name))
        })?;

        tracing::debug!("[spawn_worker] {} is ready", name);

        Ok(WorkerHandle::new(name, port, status, shutdown_tx, thread_handle))
    }
}
