//! Signal plumbing shared by the X server handshake, the main reap loop and
//! the back-off sleep: block everything at startup, then selectively
//! unblock a small set for a bounded region while a temporary handler
//! records what happened in a plain atomic flag. No other state is touched
//! from signal-handler context.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigAction, SigHandler, SaFlags, SigSet, Signal};

use crate::error::Error;

static SERVER_READY: AtomicBool = AtomicBool::new(false);
static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_server_ready(_: libc::c_int) {
    SERVER_READY.store(true, Ordering::SeqCst);
}

extern "C" fn mark_quit_requested(_: libc::c_int) {
    QUIT_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn noop_handler(_: libc::c_int) {}

pub fn server_ready() -> bool {
    SERVER_READY.swap(false, Ordering::SeqCst)
}

pub fn take_quit_requested() -> bool {
    QUIT_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Block every signal and return the mask that was in effect before, so it
/// can be restored by children after `fork` and by the process at exit.
pub fn block_all() -> Result<SigSet, Error> {
    let full = SigSet::all();
    let mut old = SigSet::empty();
    unsafe {
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&full), Some(&mut old))?;
    }
    Ok(old)
}

pub fn restore_mask(mask: &SigSet) -> Result<(), Error> {
    unsafe {
        signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(mask), None)?;
    }
    Ok(())
}

/// RAII guard: installs handlers for `SIGUSR1`/`SIGCHLD` and unblocks them,
/// restoring both the dispositions and the signal mask on drop. Used around
/// the X server readiness wait.
pub struct ServerReadyGuard {
    old_usr1: SigAction,
    old_chld: SigAction,
    unblocked: SigSet,
}

impl ServerReadyGuard {
    pub fn install() -> Result<Self, Error> {
        let action = SigAction::new(
            SigHandler::Handler(mark_server_ready),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old_usr1 = unsafe { signal::sigaction(Signal::SIGUSR1, &action)? };

        let chld_action = SigAction::new(
            SigHandler::Handler(noop_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old_chld = unsafe { signal::sigaction(Signal::SIGCHLD, &chld_action)? };

        let mut unblock = SigSet::empty();
        unblock.add(Signal::SIGUSR1);
        unblock.add(Signal::SIGCHLD);
        signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;

        SERVER_READY.store(false, Ordering::SeqCst);

        Ok(Self {
            old_usr1,
            old_chld,
            unblocked: unblock,
        })
    }
}

impl Drop for ServerReadyGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = signal::sigaction(Signal::SIGUSR1, &self.old_usr1);
            let _ = signal::sigaction(Signal::SIGCHLD, &self.old_chld);
            let _ = signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&self.unblocked), None);
        }
    }
}

/// RAII guard: installs handlers for `SIGTERM`/`SIGINT`/`SIGQUIT` that set
/// the quit flag, and unblocks them, restoring both the dispositions and the
/// signal mask on drop. Used around the main reap loop and the interruptible
/// back-off sleep.
pub struct QuitSignalGuard {
    old_term: SigAction,
    old_int: SigAction,
    old_quit: SigAction,
    unblocked: SigSet,
}

impl QuitSignalGuard {
    pub fn install() -> Result<Self, Error> {
        let action = SigAction::new(
            SigHandler::Handler(mark_quit_requested),
            SaFlags::empty(),
            SigSet::empty(),
        );

        let old_term = unsafe { signal::sigaction(Signal::SIGTERM, &action)? };
        let old_int = unsafe { signal::sigaction(Signal::SIGINT, &action)? };
        let old_quit = unsafe { signal::sigaction(Signal::SIGQUIT, &action)? };

        let mut unblock = SigSet::empty();
        unblock.add(Signal::SIGTERM);
        unblock.add(Signal::SIGINT);
        unblock.add(Signal::SIGQUIT);
        signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;

        QUIT_REQUESTED.store(false, Ordering::SeqCst);

        Ok(Self {
            old_term,
            old_int,
            old_quit,
            unblocked: unblock,
        })
    }
}

impl Drop for QuitSignalGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = signal::sigaction(Signal::SIGTERM, &self.old_term);
            let _ = signal::sigaction(Signal::SIGINT, &self.old_int);
            let _ = signal::sigaction(Signal::SIGQUIT, &self.old_quit);
            let _ = signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&self.unblocked), None);
        }
    }
}
