//! Luathread Runtime
//!
//! Runs Lua code on dedicated worker threads, each controlled by a manager on
//! the thread that created it.
//!
//! # Architecture
//!
//! - Each worker runs in its own OS thread with its own current-thread tokio
//!   runtime and its own Lua state (never shared, never `Send`)
//! - Manager and worker talk only through a pair of message ports: Input,
//!   Cancel and Restart one way, Result and PrintFlush the other
//! - The only state touched by several threads is the [`SharedStore`], guarded
//!   by a mutex with a bounded wait
//! - Per-thread reference tables are reached from other threads only through
//!   [`RefAccessor`]
//!
//! ```no_run
//! use luathread_runtime::{Manager, Outcome};
//!
//! # async fn demo() -> Result<(), luathread_runtime::ThreadError> {
//! let mut manager = Manager::create("M1")?;
//! manager.on_result(|outcome: &Outcome| println!("{:?}", outcome))?;
//! manager.send("2+2")?;
//! manager.run_until_result().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod handle;
mod instance;
pub mod logging;
mod lua;
mod manager;
mod message;
mod port;
mod registry;
mod spawn;
mod state;
mod store;
mod worker;

pub use config::{ManagerConfig, RuntimeKind};
pub use error::{ThreadError, ThreadResult};
pub use handle::WorkerHandle;
pub use instance::{Instance, InstanceFactory, RuntimeAccessor, WorkerContext};
pub use logging::{LogLevel, Origin};
pub use lua::LuaInstance;
pub use manager::{Manager, ManagerBuilder};
pub use message::{Input, Message, MessageKind, Outcome};
pub use port::{MessagePort, PortId, PortRef};
pub use registry::{RefAccessor, RefHandle, RefRegistry, RefTable};
pub use spawn::Worker;
pub use state::{WorkerState, WorkerStatus};
pub use store::{LOCK_TIMEOUT, SharedStore};
