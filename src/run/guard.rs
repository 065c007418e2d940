//! Single-flight guard for test runs
//!
//! A coordinator admits one run at a time. The guard moves
//! `Idle → Running` when a run is admitted, `Running → Settling` while the
//! run releases its process, and back to `Idle` when the [`RunPermit`] is
//! dropped. Dropping is the only way back to `Idle`, so every exit path of
//! a run (success, error, cancellation) clears the guard exactly once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Guard state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run in progress
    Idle,
    /// A run has been admitted and owns the tool process
    Running,
    /// The run finished and is releasing its resources
    Settling,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Settling => write!(f, "settling"),
        }
    }
}

#[derive(Debug)]
pub struct RunGuard {
    state: Mutex<RunState>,
}

impl RunGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RunState::Idle),
        })
    }

    pub fn state(&self) -> RunState {
        *self.lock()
    }

    /// Atomically claim the guard if no run is in progress
    pub fn try_begin(self: &Arc<Self>) -> Option<RunPermit> {
        let mut state = self.lock();
        if *state != RunState::Idle {
            return None;
        }
        *state = RunState::Running;
        Some(RunPermit {
            guard: Arc::clone(self),
        })
    }

    // A panic while holding the lock cannot leave the state half-written,
    // so a poisoned mutex is still safe to read.
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof that the holder owns the running slot
#[derive(Debug)]
pub struct RunPermit {
    guard: Arc<RunGuard>,
}

impl RunPermit {
    /// Mark the run as releasing its resources
    pub fn settle(&self) {
        *self.guard.lock() = RunState::Settling;
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        *self.guard.lock() = RunState::Idle;
    }
}
