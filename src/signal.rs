//! Cooperative cancellation driven by SIGINT/SIGTERM.
//!
//! The signals are blocked in the calling thread before the watcher is
//! spawned, so every thread created afterwards inherits the mask and the
//! watcher is the only place they are ever delivered (via `sigwait`).
//!
//! The first signal requests a graceful stop. A second one, received while
//! the capture is still winding down, terminates the process with the
//! signal's default action.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::SniffError;

/// Shared stop flag. Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Block SIGINT and SIGTERM in this thread and spawn a watcher that cancels
/// `token` when either arrives, and kills the process if one arrives again.
///
/// Must be called from the main thread before any other thread is spawned.
pub fn spawn_signal_watcher(token: CancelToken) -> Result<JoinHandle<()>, SniffError> {
    let set = shutdown_sigset();
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(SniffError::Fatal(format!(
            "pthread_sigmask: {}",
            io::Error::from_raw_os_error(ret)
        )));
    }

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || watch(set, token))
        .map_err(|e| SniffError::Fatal(format!("spawn signal watcher: {e}")))
}

fn shutdown_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        set
    }
}

/// What the watcher does with a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// Ask the capture loop to stop after the current read.
    Cancel,
    /// Stop is already pending; terminate the process.
    Terminate,
}

fn next_action(token: &CancelToken) -> SignalAction {
    if token.is_cancelled() {
        SignalAction::Terminate
    } else {
        SignalAction::Cancel
    }
}

fn watch(set: libc::sigset_t, token: CancelToken) {
    loop {
        let mut sig: libc::c_int = 0;
        let ret = unsafe { libc::sigwait(&set, &mut sig) };
        if ret != 0 {
            log::error!("sigwait failed: {}", io::Error::from_raw_os_error(ret));
            token.cancel();
            return;
        }
        if sig != libc::SIGINT && sig != libc::SIGTERM {
            continue;
        }
        match next_action(&token) {
            SignalAction::Cancel => {
                log::info!("Received signal {sig}, stopping capture (repeat to force exit)");
                token.cancel();
            }
            SignalAction::Terminate => {
                log::warn!("Received signal {sig} again, terminating");
                terminate(sig);
                return;
            }
        }
    }
}

/// Re-deliver `sig` to this thread with its default disposition.
fn terminate(sig: libc::c_int) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::signal(sig, libc::SIG_DFL);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::raise(sig);
    }
    // Only reached if the default action was somehow ignored.
    std::process::exit(128 + sig);
}
