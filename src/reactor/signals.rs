//! Signal handling (§4.3 termination, §7 signal policy).
//!
//! POSIX signal handlers may only call async-signal-safe functions, so the
//! handler installed here does nothing but set an atomic flag; all actual
//! work (restarting workers, toggling shutdown state, reaping children) runs
//! synchronously in the supervision sweep, mirroring the original's own
//! "SIGCHLD handled in the sweep, not in a handler" design.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static SIGINT_COUNT: AtomicU32 = AtomicU32::new(0);
static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGHUP_RECEIVED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCode {
    Int,
    Term,
    Hup,
}

extern "C" fn on_signal(signum: libc::c_int) {
    match signum {
        libc::SIGINT => {
            SIGINT_COUNT.fetch_add(1, Ordering::SeqCst);
        }
        libc::SIGTERM => SIGTERM_RECEIVED.store(true, Ordering::SeqCst),
        libc::SIGHUP => SIGHUP_RECEIVED.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Installs handlers for SIGINT, SIGTERM, SIGHUP. Safe to call from both the
/// parent and any forked worker (a fork inherits the parent's dispositions,
/// so this is mostly defensive after re-exec-free forking).
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, on_signal as libc::sighandler_t);
    }
}

/// Drains pending signals observed since the last call, oldest first. SIGINT
/// is reported once per received signal (to distinguish "first" from
/// "second" ctrl-c per §7); SIGTERM/SIGHUP collapse to a single occurrence
/// since the reactor's reaction to repeats is identical.
pub fn drain_pending() -> Vec<SignalCode> {
    let mut pending = Vec::new();

    let ints = SIGINT_COUNT.swap(0, Ordering::SeqCst);
    for _ in 0..ints {
        pending.push(SignalCode::Int);
    }
    if SIGTERM_RECEIVED.swap(false, Ordering::SeqCst) {
        pending.push(SignalCode::Term);
    }
    if SIGHUP_RECEIVED.swap(false, Ordering::SeqCst) {
        pending.push(SignalCode::Hup);
    }

    pending
}
