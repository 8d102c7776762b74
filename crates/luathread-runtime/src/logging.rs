//! Logging bridge.
//!
//! Every record goes through `tracing` and carries an `origin` field telling
//! whether it was emitted from a manager thread or from a worker thread. The
//! origin is a thread-local that worker threads flip when they start.

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use crate::error::ThreadError;

/// Origin tag for records emitted on the manager side.
pub const MANAGER_TAG: &str = "luathread";
/// Origin tag for records emitted on a worker thread.
pub const WORKER_TAG: &str = "luathread._instance";

/// The four severities scripts and hosts can log at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Verbose,
    Debug,
    Information,
    Error,
}

impl FromStr for LogLevel {
    type Err = ThreadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "verbose" | "trace" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            "info" | "information" => Ok(LogLevel::Information),
            "error" => Ok(LogLevel::Error),
            other => Err(ThreadError::Config(format!("unknown log level: {}", other))),
        }
    }
}

/// Which side of the manager/worker pair a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manager,
    Worker,
}

thread_local! {
    static ORIGIN: Cell<Origin> = const { Cell::new(Origin::Manager) };
}

impl Origin {
    /// Origin of the calling thread.
    pub fn current() -> Origin {
        ORIGIN.with(|o| o.get())
    }

    /// Mark the calling thread as a worker thread.
    pub(crate) fn enter_worker() {
        ORIGIN.with(|o| o.set(Origin::Worker));
    }

    pub fn tag(self) -> &'static str {
        match self {
            Origin::Manager => MANAGER_TAG,
            Origin::Worker => WORKER_TAG,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Emit a record at `level` for the worker or manager called `name`.
pub fn log(level: LogLevel, name: &str, message: impl fmt::Display) {
    let origin = Origin::current().tag();
    match level {
        LogLevel::Verbose => tracing::trace!(origin, name, "{}:{}", origin, message),
        LogLevel::Debug => tracing::debug!(origin, name, "{}:{}", origin, message),
        LogLevel::Information => tracing::info!(origin, name, "{}:{}", origin, message),
        LogLevel::Error => tracing::error!(origin, name, "{}:{}", origin, message),
    }
}

pub fn verbose(name: &str, message: impl fmt::Display) {
    log(LogLevel::Verbose, name, message)
}

pub fn debug(name: &str, message: impl fmt::Display) {
    log(LogLevel::Debug, name, message)
}

pub fn info(name: &str, message: impl fmt::Display) {
    log(LogLevel::Information, name, message)
}

pub fn error(name: &str, message: impl fmt::Display) {
    log(LogLevel::Error, name, message)
}
