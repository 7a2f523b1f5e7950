//! Last-resort cleanup for coverage maps owned by this process.
//!
//! Every [`crate::shmem::CoverageShMem`] that owns its segment parks the segment id in
//! one slot of a fixed table. Whoever takes the id out of the slot first
//! (an explicit release, the `atexit` hook, or a fatal signal) is the one that destroys
//! the segment; everybody else does nothing.
//!
//! The table only holds atomics so it can be walked from a signal handler.

use core::{
    mem, ptr,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};
use std::sync::Once;

use libc::c_int;
use log::{debug, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Error;

/// How many owned maps can be tracked for exit-time cleanup at once.
pub const MAX_TRACKED_MAPS: usize = 64;

/// Signals whose default action kills the process, and that we hook if nobody else did.
pub const CLEANUP_SIGNALS: [Signal; 9] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
];

const EMPTY: i32 = -1;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicI32 = AtomicI32::new(EMPTY);

static LIVE_MAPS: [AtomicI32; MAX_TRACKED_MAPS] = [EMPTY_SLOT; MAX_TRACKED_MAPS];

static AT_EXIT: Once = Once::new();
static SIGNALS_HOOKED: AtomicBool = AtomicBool::new(false);

/// A slot in the cleanup table, handed out by [`register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

/// Track `id` for exit-time cleanup.
///
/// Installs the `atexit` hook on first use.
/// Returns `None` if the table is full; the caller then only gets cleanup on drop.
pub fn register(id: i32) -> Option<Slot> {
    AT_EXIT.call_once(|| {
        // # Safety
        // `release_at_exit` only touches atomics and calls `shmctl`.
        if unsafe { libc::atexit(release_at_exit) } != 0 {
            warn!("Could not register the atexit hook, coverage maps may leak on exit");
        }
    });

    for (idx, slot) in LIVE_MAPS.iter().enumerate() {
        if slot
            .compare_exchange(EMPTY, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(Slot(idx));
        }
    }
    warn!(
        "More than {MAX_TRACKED_MAPS} live coverage maps, map {id} will only be removed on drop"
    );
    None
}

/// Take `id` back out of its slot.
///
/// Returns `true` if the caller now owns the destruction of the segment,
/// `false` if an exit or signal hook got to it first.
pub fn unregister(slot: Slot, id: i32) -> bool {
    LIVE_MAPS[slot.0]
        .compare_exchange(id, EMPTY, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Destroy every segment still in the table. Returns how many were removed.
///
/// Async-signal-safe.
pub fn release_all() -> usize {
    let mut released = 0;
    for slot in &LIVE_MAPS {
        let id = slot.swap(EMPTY, Ordering::AcqRel);
        if id != EMPTY {
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
            }
            released += 1;
        }
    }
    released
}

extern "C" fn release_at_exit() {
    release_all();
}

extern "C" fn release_on_signal(sig: c_int) {
    release_all();
    // Die the way we would have died without us.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn has_default_disposition(sig: Signal) -> Result<bool, Error> {
    let mut current: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(sig as c_int, ptr::null(), &mut current) } < 0 {
        return Err(Error::unknown(format!(
            "Could not query the handler for {sig}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(current.sa_sigaction == libc::SIG_DFL)
}

/// Hook [`CLEANUP_SIGNALS`] so owned maps are removed before the process dies.
///
/// Only signals still at their default disposition are hooked, handlers installed by
/// the embedding program stay in place. The hook re-raises the signal with the
/// default action afterwards. Subsequent calls are no-ops.
pub fn install_signal_cleanup() -> Result<(), Error> {
    if SIGNALS_HOOKED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(release_on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in CLEANUP_SIGNALS {
        if !has_default_disposition(sig)? {
            debug!("{sig} already has a handler, not hooking it for map cleanup");
            continue;
        }
        // # Safety
        // The handler is async-signal-safe: atomics, shmctl, signal and raise.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}
