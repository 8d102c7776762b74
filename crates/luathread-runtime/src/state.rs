//! Worker lifecycle state, shared between the worker thread and its manager.
//!
//! ```text
//! Starting ─▶ Idle ⇄ Busy
//!    │         │ ▲
//!    │         ▼ │
//!    │     Restarting
//!    ▼         ▼
//!  Cancelled ◀─┘ ─▶ Terminated
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    Restarting = 3,
    Cancelled = 4,
    Terminated = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Idle,
            2 => WorkerState::Busy,
            3 => WorkerState::Restarting,
            4 => WorkerState::Cancelled,
            _ => WorkerState::Terminated,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Restarting)
                | (Restarting, Idle)
                | (Starting | Idle | Busy | Restarting, Cancelled)
                | (Cancelled, Terminated)
        )
    }

    /// No further input will be accepted.
    pub fn is_closed(self) -> bool {
        matches!(self, WorkerState::Cancelled | WorkerState::Terminated)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Restarting => "restarting",
            WorkerState::Cancelled => "cancelled",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Lifecycle state plus the flags both sides consult.
#[derive(Debug)]
pub struct WorkerStatus {
    state: AtomicU8,
    /// The worker has a live interpreter context it must finalize.
    owns_context: AtomicBool,
    /// Restart tears the interpreter context down first.
    reset_on_restart: AtomicBool,
    /// Cancellation lets in-flight work finish and flush. Set from config,
    /// overwritten by each cancel request.
    clean_close: AtomicBool,
    /// Abrupt cancellation: running code should be interrupted.
    interrupt: AtomicBool,
}

impl WorkerStatus {
    pub(crate) fn new(reset_on_restart: bool, clean_close: bool) -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Starting as u8),
            owns_context: AtomicBool::new(false),
            reset_on_restart: AtomicBool::new(reset_on_restart),
            clean_close: AtomicBool::new(clean_close),
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` if the lifecycle allows it from the current state.
    /// Returns the state that was replaced, or `None` if the move was refused.
    pub(crate) fn advance(&self, next: WorkerState) -> Option<WorkerState> {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                WorkerState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .ok()
            .map(WorkerState::from_u8)
    }

    /// Record a cancellation request. Returns `false` if the worker was
    /// already cancelled or terminated.
    pub(crate) fn request_cancel(&self, clean: bool) -> bool {
        if self.state().is_closed() {
            return false;
        }
        // Flags first: the worker reads them as soon as it sees Cancelled.
        self.clean_close.store(clean, Ordering::SeqCst);
        if !clean {
            self.interrupt.store(true, Ordering::SeqCst);
        }
        self.advance(WorkerState::Cancelled).is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == WorkerState::Idle
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state().is_closed()
    }

    pub fn owns_context(&self) -> bool {
        self.owns_context.load(Ordering::SeqCst)
    }

    pub(crate) fn set_owns_context(&self, owns: bool) {
        self.owns_context.store(owns, Ordering::SeqCst);
    }

    pub fn reset_on_restart(&self) -> bool {
        self.reset_on_restart.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reset_on_restart(&self, reset: bool) {
        self.reset_on_restart.store(reset, Ordering::SeqCst);
    }

    pub fn clean_close(&self) -> bool {
        self.clean_close.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Fatal failure on the worker side: cancel without waiting for anything.
    pub(crate) fn fail(&self) {
        self.request_cancel(false);
    }

    pub(crate) fn terminate(&self) {
        self.state
            .store(WorkerState::Terminated as u8, Ordering::SeqCst);
    }
}
