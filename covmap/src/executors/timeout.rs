//! A deadline for one specific child, racing the executor's wait.
//!
//! Both sides try to move the [`RunStateCell`] out of [`RunState::Running`]; the first
//! one wins. The watchdog only sends [`TIMEOUT_SIGNAL`] after winning, and the
//! executor does not reap the child before the watchdog thread is joined, so the pid
//! it kills can never belong to somebody else.
//!
//! The child is expected to lead its own process group. The kill goes to the whole
//! group, so wrapper scripts cannot leave descendants behind that keep running (or keep
//! the input pipe open) past the deadline.

use core::{
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, killpg, Signal},
        wait::{waitid, Id, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::Error;

/// The signal used to enforce timeouts. A target dying from it is never reported as a crash.
pub const TIMEOUT_SIGNAL: Signal = Signal::SIGKILL;

/// Where a single execution stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Nobody decided yet
    Running = 0,
    /// The target terminated before the deadline
    Exited = 1,
    /// The deadline fired first and the target got killed
    TimedOut = 2,
}

impl RunState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Running,
            1 => Self::Exited,
            _ => Self::TimedOut,
        }
    }
}

/// A [`RunState`] that can leave [`RunState::Running`] exactly once.
#[derive(Debug)]
pub struct RunStateCell(AtomicU8);

impl Default for RunStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateCell {
    /// A fresh cell, [`RunState::Running`]
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(RunState::Running as u8))
    }

    /// The current state
    #[must_use]
    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Try to move from [`RunState::Running`] to `to`.
    ///
    /// Returns the final state: `to` if we won, whatever the other side set otherwise.
    pub fn settle(&self, to: RunState) -> RunState {
        match self.0.compare_exchange(
            RunState::Running as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => to,
            Err(current) => RunState::from_u8(current),
        }
    }
}

/// `true` once the child `pid` terminated. It stays unreaped.
pub(crate) fn has_exited(pid: Pid) -> bool {
    matches!(
        waitid(
            Id::Pid(pid),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
        ),
        Ok(status) if status != WaitStatus::StillAlive
    )
}

/// Send [`TIMEOUT_SIGNAL`] to the process group led by `pid`, or to `pid` alone if it leads none.
fn kill_group(pid: Pid) {
    let res = match killpg(pid, TIMEOUT_SIGNAL) {
        Err(Errno::ESRCH) => kill(pid, TIMEOUT_SIGNAL),
        res => res,
    };
    match res {
        // ESRCH: it is gone already, nothing to do
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!("Failed to kill timed out child {pid}: {err}"),
    }
}

/// Kills the child `pid` once its deadline passes, unless [`Watchdog::disarm`] came first.
#[derive(Debug)]
pub struct Watchdog {
    state: Arc<RunStateCell>,
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the deadline for `pid`. Without a timeout there is no thread, only the state.
    ///
    /// `pid` must be an unreaped child of this process, ideally leading its own process group.
    pub fn arm(pid: Pid, timeout: Option<Duration>) -> Result<Self, Error> {
        let state = Arc::new(RunStateCell::new());
        let Some(timeout) = timeout else {
            return Ok(Self {
                state,
                cancel: None,
                thread: None,
            });
        };

        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(format!("covmap-watchdog-{pid}"))
            .spawn(move || match cancelled.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    // exited in time, the executor just did not disarm us yet
                    if has_exited(pid) {
                        thread_state.settle(RunState::Exited);
                        return;
                    }
                    if thread_state.settle(RunState::TimedOut) != RunState::TimedOut {
                        return;
                    }
                    debug!("Child {pid} hit its {timeout:?} deadline, killing its process group");
                    kill_group(pid);
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            })?;

        Ok(Self {
            state,
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    /// The shared state, for inspection
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Call once the child terminated. Settles the race and stops the watchdog thread.
    ///
    /// Returns [`RunState::TimedOut`] if the deadline won, [`RunState::Exited`] otherwise.
    pub fn disarm(mut self) -> RunState {
        let outcome = self.state.settle(RunState::Exited);
        self.stop();
        outcome
    }

    fn stop(&mut self) {
        // Disconnecting wakes the thread up
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
