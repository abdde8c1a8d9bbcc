//! The supervisor state machine: owns the (VT, X server, X session) triple,
//! centralises the single `waitpid(-1, …)` that reaps either child, and
//! drives the restart/back-off policy. Grounded on `dm.c`'s `nodm_run` /
//! `nodm_supervise` and the restart bookkeeping in `nodm.c`'s `main`.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::signal::SigSet;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::Error;
use crate::signals::{self, QuitSignalGuard};
use crate::vt::VirtualTerminal;
use crate::x_options;
use crate::xserver::XServer;
use crate::xsession::XSession;

/// Back-off ladder: seconds to sleep before the next
/// restart, indexed by how many consecutive sessions have been shorter than
/// `minimum_session_time_seconds`. The last slot is sticky: once reached,
/// `restart_count` no longer advances.
const BACKOFF_LADDER: [u64; 6] = [0, 0, 30, 30, 60, 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    XServerDied,
    SessionDied(i32),
    UserQuit,
}

/// Computes the next `restart_count` given how long the last session ran.
/// A pure function so the back-off ladder can be tested without forking
/// anything.
fn next_restart_count(current: usize, elapsed_secs: u64, minimum_session_time_secs: u64) -> usize {
    if elapsed_secs < minimum_session_time_secs {
        (current + 1).min(BACKOFF_LADDER.len() - 1)
    } else {
        0
    }
}

pub struct Supervisor {
    vt: VirtualTerminal,
    server_argv: Vec<String>,
    display_name: String,
    x_timeout_seconds: u64,
    run_as_user: String,
    session_command: String,
    use_pam: bool,
    cleanup_xsession_errors: bool,
    minimum_session_time_seconds: u64,

    server: Option<XServer>,
    session: Option<XSession>,

    last_start: Instant,
    original_mask: SigSet,
    restart_count: usize,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            vt: VirtualTerminal::new(config.first_vt),
            server_argv: config.x_argv.clone(),
            display_name: config.display_name.clone(),
            x_timeout_seconds: config.x_timeout_seconds,
            run_as_user: config.run_as_user.clone(),
            session_command: config.session_command.clone(),
            use_pam: config.use_pam,
            cleanup_xsession_errors: config.cleanup_xsession_errors,
            minimum_session_time_seconds: config.minimum_session_time_seconds,
            server: None,
            session: None,
            last_start: Instant::now(),
            original_mask: SigSet::empty(),
            restart_count: 0,
        }
    }

    /// Allocates the VT, blocks every signal for the remainder of the
    /// process's life, then performs the first `restart()`. On any failure
    /// the VT (if allocated) is released before returning.
    pub fn start(&mut self) -> Result<(), Error> {
        self.original_mask = signals::block_all()?;

        if let Err(err) = self.vt.start() {
            return Err(err);
        }

        if self.vt.allocated_number() >= 0 {
            x_options::append_vt(&mut self.server_argv, self.vt.allocated_number() as u32);
        }

        if let Err(err) = self.restart() {
            self.vt.stop();
            return Err(err);
        }

        Ok(())
    }

    /// Starts a fresh X server and X session pair. Both are cycle-scoped:
    /// `window_path` depends on the server instance that just became ready,
    /// so a new `XServer`/`XSession` is constructed rather than reusing the
    /// previous cycle's.
    fn restart(&mut self) -> Result<(), Error> {
        self.last_start = Instant::now();

        let mut server = XServer::new(
            self.server_argv.clone(),
            self.display_name.clone(),
            self.x_timeout_seconds,
        );
        server.start(&self.original_mask)?;

        let mut session = XSession::new(
            self.session_command.clone(),
            self.run_as_user.clone(),
            self.use_pam,
            self.cleanup_xsession_errors,
            self.display_name.clone(),
            server.window_path().map(String::from),
        );

        if let Err(err) = session.start(&self.original_mask) {
            server.stop();
            return Err(err);
        }

        self.server = Some(server);
        self.session = Some(session);
        Ok(())
    }

    /// Blocks until the X server or X session exits, or the process is
    /// asked to quit. Every `waitpid(-1, …)` in the crate lives here.
    fn wait(&mut self) -> Result<ExitReason, Error> {
        let _guard = QuitSignalGuard::install()?;

        let server_pid = self.server.as_ref().and_then(XServer::pid);
        let session_pid = self.session.as_ref().and_then(XSession::pid);

        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if Some(pid) == server_pid {
                        return Ok(ExitReason::XServerDied);
                    } else if Some(pid) == session_pid {
                        return Ok(ExitReason::SessionDied(code));
                    }
                    continue;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    let status = 128 + sig as i32;
                    if Some(pid) == server_pid {
                        return Ok(ExitReason::XServerDied);
                    } else if Some(pid) == session_pid {
                        return Ok(ExitReason::SessionDied(status));
                    }
                    continue;
                }
                Ok(_) => continue,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {
                    if signals::take_quit_requested() {
                        return Ok(ExitReason::UserQuit);
                    }
                    continue;
                }
                Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => {
                    return Err(Error::Programming(
                        "wait() called with no server or session running".into(),
                    ));
                }
                Err(err) => return Err(Error::OsError(format!("waitpid(-1): {err}"))),
            }
        }
    }

    /// Stops the session then the server. The VT is left held: it is only
    /// released by [`Supervisor::shutdown`] at process exit.
    fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }

    /// Releases the VT in addition to stopping the server and session.
    /// Called once, when the loop below returns.
    pub fn shutdown(&mut self) {
        self.stop();
        self.vt.stop();
    }

    /// Sleeps for `secs`, waking early if `SIGTERM`/`SIGINT`/`SIGQUIT`
    /// arrives. Returns `true` if the sleep ran to completion, `false` if
    /// interrupted by a quit signal.
    fn interruptible_sleep(&self, secs: u64) -> Result<bool, Error> {
        let _guard = QuitSignalGuard::install()?;

        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            if signals::take_quit_requested() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// The heart of the supervisor: wait for either child to die, tear both
    /// down, and either restart after a back-off sleep or return the
    /// terminal error that ends the process. Never returns `Ok`: the
    /// daemon's only non-error exit is a signal-driven `UserQuit`.
    pub fn wait_restart_loop(&mut self) -> Error {
        loop {
            let outcome = match self.wait() {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.stop();
                    return err;
                }
            };

            let ended_at = Instant::now();
            self.stop();

            match outcome {
                ExitReason::UserQuit => return Error::UserQuit,
                ExitReason::XServerDied => warn!("X server died, restarting"),
                ExitReason::SessionDied(status) => {
                    info!("X session exited with status {status}, restarting")
                }
            }

            let elapsed = ended_at.saturating_duration_since(self.last_start).as_secs();
            self.restart_count = next_restart_count(
                self.restart_count,
                elapsed,
                self.minimum_session_time_seconds,
            );

            let sleep_secs = BACKOFF_LADDER[self.restart_count];
            if sleep_secs > 0 {
                info!("backing off for {sleep_secs}s before restarting (restart_count={})", self.restart_count);
            }

            match self.interruptible_sleep(sleep_secs) {
                Ok(true) => {}
                Ok(false) => return Error::UserQuit,
                Err(err) => return err,
            }

            if let Err(err) = self.restart() {
                error!("could not restart after back-off: {err}");
                return err;
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_count_climbs_and_saturates_at_the_last_slot() {
        let mut count = 0;
        let mut steps = Vec::new();
        for _ in 0..6 {
            steps.push(count);
            count = next_restart_count(count, 1, 60);
        }
        assert_eq!(steps, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(count, 5, "must saturate at the last real slot");
    }

    #[test]
    fn restart_count_resets_after_a_long_session() {
        let count = next_restart_count(3, 1, 60);
        assert_eq!(count, 4);

        let reset = next_restart_count(4, 120, 60);
        assert_eq!(reset, 0);
    }

    #[test]
    fn backoff_sleep_sequence_matches_s8() {
        let mut count = 0;
        let mut sleeps = Vec::new();
        for _ in 0..6 {
            sleeps.push(BACKOFF_LADDER[count]);
            count = next_restart_count(count, 1, 60);
        }
        assert_eq!(sleeps, vec![0, 0, 30, 30, 60, 60]);
    }
}
