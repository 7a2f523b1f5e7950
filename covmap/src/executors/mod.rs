//! Executors take an [`crate::inputs::ExecutionRequest`], run the target once, and report how it went.

pub mod command;
pub use command::{CoverageExecutor, ExecutorConfig};

pub mod timeout;

use core::time::Duration;

use covmap_bolts::shmem::CoverageSnapshot;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// How an execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitKind {
    /// The run exited normally.
    Ok,
    /// The run resulted in a target crash.
    Crash,
    /// The run timed out
    Timeout,
}

/// The outcome of one [`CoverageExecutor::capture`] call.
///
/// Crashes and timeouts are results, not errors: a fuzzing loop just carries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Copy of the coverage map taken after the target terminated (or was killed)
    pub coverage: CoverageSnapshot,
    /// The fatal signal the target died from, if it crashed
    pub crashed: Option<i32>,
    /// `true` iff our own deadline fired and killed the target
    pub timed_out: bool,
    /// The exit status, if the target exited on its own
    pub exit_code: Option<i32>,
    /// The signal that terminated the target, whoever sent it
    pub signal: Option<i32>,
    /// Wall clock time from spawn until the target was reaped
    pub exec_time: Duration,
}

impl ExecutionResult {
    /// Collapse the result into an [`ExitKind`]
    #[must_use]
    pub fn exit_kind(&self) -> ExitKind {
        if self.timed_out {
            ExitKind::Timeout
        } else if self.crashed.is_some() {
            ExitKind::Crash
        } else {
            ExitKind::Ok
        }
    }

    /// The crash signal as a [`Signal`], if it is one nix knows about
    #[must_use]
    pub fn crash_signal(&self) -> Option<Signal> {
        self.crashed.and_then(|sig| Signal::try_from(sig).ok())
    }
}
