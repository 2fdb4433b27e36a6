//! Process-global POSIX signal counters.
//!
//! Signal handlers may run at any point, so the handler itself only bumps an
//! atomic counter; the reactor drains the counters between poll iterations.
//! Handlers are installed without `SA_RESTART` so that a pending `poll(2)`
//! returns `EINTR` and the reactor observes the signal promptly.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

/// Highest signal number for which a callback may be registered.
pub const MAX_SIGNAL: i32 = 31;

static PENDING: [AtomicU32; (MAX_SIGNAL + 1) as usize] =
    [const { AtomicU32::new(0) }; (MAX_SIGNAL + 1) as usize];

extern "C" fn on_signal(signum: libc::c_int) {
    if (0..=MAX_SIGNAL).contains(&signum) {
        PENDING[signum as usize].fetch_add(1, Ordering::Relaxed);
    }
}

/// Installs the counting handler for `signum`, replacing any previous
/// disposition.
pub(crate) fn install(signum: i32) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as usize as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Takes the number of deliveries of `signum` since the previous call.
pub(crate) fn take_pending(signum: i32) -> u32 {
    PENDING[signum as usize].swap(0, Ordering::Relaxed)
}
