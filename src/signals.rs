//! Process-wide signal flags.
//!
//! Three atomics are the only global mutable state in the daemon: shutdown,
//! rotate and pause. Signal handlers do nothing but store to them; the
//! writer loop polls them. Source threads block the handled signal set at
//! logging entry so only the main thread responds.
//!
//! Default bindings:
//! - `SIGINT`, `SIGQUIT`, `SIGRTMIN+1`: request shutdown
//! - `SIGUSR1`, `SIGHUP`, `SIGRTMIN+2`: request log rotation
//! - `SIGRTMIN+3` / `SIGRTMIN+4`: pause / resume output

use std::sync::atomic::{AtomicBool, Ordering};

/// Set once to end the daemon; never cleared.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Cleared by the writer once the output files have been rotated. Rotation
/// is deferred while the logger is paused.
pub static ROTATE: AtomicBool = AtomicBool::new(false);

/// While set, the writer stops draining the queue. Inputs continue.
pub static PAUSE: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

#[inline(always)]
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

#[inline(always)]
pub fn rotate_requested() -> bool {
    ROTATE.load(Ordering::Acquire)
}

#[inline(always)]
pub fn request_rotate() {
    ROTATE.store(true, Ordering::Release);
}

#[inline(always)]
pub fn clear_rotate() {
    ROTATE.store(false, Ordering::Release);
}

#[inline(always)]
pub fn paused() -> bool {
    PAUSE.load(Ordering::Acquire)
}

fn handled_signals() -> Vec<libc::c_int> {
    vec![
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGUSR1,
        libc::SIGHUP,
        libc::SIGRTMIN() + 1,
        libc::SIGRTMIN() + 2,
        libc::SIGRTMIN() + 3,
        libc::SIGRTMIN() + 4,
    ]
}

/// Install the signal handlers on the main thread.
pub fn install_handlers() -> std::io::Result<()> {
    unsafe {
        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGRTMIN() + 1] {
            signal_hook::low_level::register(sig, || {
                SHUTDOWN.store(true, Ordering::Release)
            })?;
        }
        for sig in [libc::SIGUSR1, libc::SIGHUP, libc::SIGRTMIN() + 2] {
            signal_hook::low_level::register(sig, || ROTATE.store(true, Ordering::Release))?;
        }
        signal_hook::low_level::register(libc::SIGRTMIN() + 3, || {
            PAUSE.store(true, Ordering::Release)
        })?;
        signal_hook::low_level::register(libc::SIGRTMIN() + 4, || {
            PAUSE.store(false, Ordering::Release)
        })?;
    }
    Ok(())
}

/// Block every handled signal on the calling thread. Called at the top of
/// each source logging thread so delivery is confined to the main thread.
pub fn block_handled() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in handled_signals() {
            libc::sigaddset(&mut set, sig);
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Serialises tests that drive the global flags; the flags are process
/// wide and the test harness runs in parallel.
#[cfg(test)]
pub static TEST_FLAG_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trips() {
        let _guard = TEST_FLAG_LOCK.lock().unwrap();
        assert!(!rotate_requested());
        request_rotate();
        assert!(rotate_requested());
        clear_rotate();
        assert!(!rotate_requested());
        assert!(!paused());
    }
}
