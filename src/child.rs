//! Small primitives shared by the X server, X session and Supervisor:
//! non-blocking status checks and "make this process go away" teardown.
//! Every `waitpid(-1, …)` in the crate otherwise lives in
//! [`crate::supervisor::Supervisor::wait`]; these two functions only ever
//! wait on a specific, known pid.

use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Quit(i32),
    Gone,
}

/// Non-blocking check of whether `pid` has exited.
pub fn has_quit(pid: Pid) -> Status {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Status::Running,
        Ok(WaitStatus::Exited(_, code)) => Status::Quit(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => Status::Quit(128 + sig as i32),
        Ok(_) => Status::Running,
        Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => Status::Gone,
        Err(_) => Status::Gone,
    }
}

/// Ensure `pid` is no longer running: `SIGTERM` then `SIGCONT` (in case it
/// is job-control stopped), then block until it is reaped.
pub fn must_exit(pid: Pid, description: &str) {
    match has_quit(pid) {
        Status::Running => {
            let _ = signal::kill(pid, Signal::SIGTERM);
            let _ = signal::kill(pid, Signal::SIGCONT);

            loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        info!("{description} (pid {pid}) exited with status {code}");
                        break;
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        warn!("{description} (pid {pid}) was killed by signal {sig:?}");
                        break;
                    }
                    Ok(_) => continue,
                    Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                    Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => break,
                    Err(_) => break,
                }
            }
        }
        Status::Quit(code) => {
            info!("{description} (pid {pid}) had already exited with status {code}");
        }
        Status::Gone => {}
    }
}
