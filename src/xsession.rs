//! X session controller: looks up the target user, forks, and runs the
//! session command either directly or behind a PAM-managed credential
//! lifetime. Grounded on `xsession-child.c`'s `nodm_xsession_child{,_pam}`
//! and `nodm_xsession_child_common_env`.

use std::env;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use log::{info, warn};
use nix::sys::signal::Signal;
use nix::sys::signal::{self};
use nix::unistd::{chdir, execv, fork, initgroups, setgid, setpgid, setuid, ForkResult, Gid, Pid, Uid};
use pgs_files::passwd::{get_entry_by_name, get_entry_by_uid, PasswdEntry};

use crate::child;
use crate::error::Error;
use crate::pam_session::{self, PamSession};
use crate::signals::QuitSignalGuard;

pub struct XSession {
    session_command: String,
    run_as_user: String,
    use_pam: bool,
    cleanup_xsession_errors: bool,
    display_name: String,
    window_path: Option<String>,
    pid: Option<Pid>,
}

impl XSession {
    pub fn new(
        session_command: String,
        run_as_user: String,
        use_pam: bool,
        cleanup_xsession_errors: bool,
        display_name: String,
        window_path: Option<String>,
    ) -> Self {
        Self {
            session_command,
            run_as_user,
            use_pam,
            cleanup_xsession_errors,
            display_name,
            window_path,
            pid: None,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn start(&mut self, original_mask: &nix::sys::signal::SigSet) -> Result<(), Error> {
        let user = self.lookup_user()?;

        info!("starting X session for {}", user.name);

        match unsafe { fork() }
            .map_err(|_| Error::OsError("cannot fork X session".into()))?
        {
            ForkResult::Child => self.run_child(user, original_mask),
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                Ok(())
            }
        }
    }

    fn lookup_user(&self) -> Result<PasswdEntry, Error> {
        if self.run_as_user.is_empty() {
            get_entry_by_uid(nix::unistd::getuid().as_raw())
                .ok_or_else(|| Error::OsError("current uid has no passwd entry".into()))
        } else {
            get_entry_by_name(&self.run_as_user)
                .ok_or_else(|| Error::OsError(format!("unknown user {}", self.run_as_user)))
        }
    }

    /// Runs entirely in the forked child. Never returns.
    fn run_child(&self, user: PasswdEntry, original_mask: &nix::sys::signal::SigSet) -> ! {
        let _ = crate::signals::restore_mask(original_mask);
        let _ = setpgid(Pid::from_raw(0), nix::unistd::getpid());

        let body = SessionBody {
            user: &user,
            session_command: &self.session_command,
            display_name: &self.display_name,
            window_path: self.window_path.clone(),
            cleanup_xsession_errors: self.cleanup_xsession_errors,
        };

        if self.use_pam {
            run_with_pam(body)
        } else {
            body.exec();
        }
    }

    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            child::must_exit(pid, "X session");
        }
    }
}

impl Drop for XSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionBody<'a> {
    user: &'a PasswdEntry,
    session_command: &'a str,
    display_name: &'a str,
    window_path: Option<String>,
    cleanup_xsession_errors: bool,
}

impl SessionBody<'_> {
    /// Common to both the PAM and non-PAM paths: environment, `NODM_*`
    /// cleanup, `chdir`, `.xsession-errors` truncation, then `exec`. Never
    /// returns.
    fn exec(&self) -> ! {
        env::set_var("HOME", &self.user.dir);
        env::set_var("USER", &self.user.name);
        env::set_var("USERNAME", &self.user.name);
        env::set_var("LOGNAME", &self.user.name);
        env::set_var("PWD", &self.user.dir);
        env::set_var("SHELL", &self.user.shell);
        env::set_var("DISPLAY", self.display_name);

        if let Some(window_path) = &self.window_path {
            env::set_var("WINDOWPATH", window_path);
        }

        for var in [
            "NODM_USER",
            "NODM_XINIT",
            "NODM_XSESSION",
            "NODM_X_OPTIONS",
            "NODM_MIN_SESSION_TIME",
        ] {
            env::remove_var(var);
        }

        if chdir(self.user.dir.as_str()).is_ok() && self.cleanup_xsession_errors {
            truncate_xsession_errors();
        }

        let shell = CString::new("/bin/sh").unwrap();
        let args = [
            CString::new("/bin/sh").unwrap(),
            CString::new("-l").unwrap(),
            CString::new("-c").unwrap(),
            CString::new(self.session_command).unwrap_or_default(),
        ];

        let exec_err = execv(&shell, &args).unwrap_err();
        let code = if exec_err == nix::Error::Sys(nix::errno::Errno::ENOENT) {
            Error::CmdNotFound(self.session_command.to_string()).exit_code()
        } else {
            Error::CmdNoExec(self.session_command.to_string()).exit_code()
        };
        std::process::exit(code);
    }
}

/// Truncates `.xsession-errors` in the (already-current) home directory.
/// Follows `cleanup_xse`'s "truncate whenever it is non-empty" rule with a
/// zero-byte threshold: every session start gets a clean error log.
fn truncate_xsession_errors() {
    match OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(".xsession-errors")
    {
        Ok(file) => {
            if let Err(err) = nix::unistd::ftruncate(file.as_raw_fd(), 0) {
                warn!("cannot truncate .xsession-errors: {err}");
            }
        }
        Err(err) => warn!("cannot open .xsession-errors: {err}"),
    }
}

/// The PAM code path: ignores `SIGINT`/`SIGQUIT` around the account-management
/// call (`setup_pam` in the original), establishes credentials and opens the
/// session, switches to the target uid/gid, then delegates to
/// [`pam_session::run_pam_session_body`] for the double-fork middle process.
/// Never returns: exits with the session's own status or a PAM failure code.
fn run_with_pam(body: SessionBody<'_>) -> ! {
    let tty = current_tty();

    let mut pam = match PamSession::start("nodm", &body.user.name) {
        Ok(pam) => pam,
        Err(err) => {
            warn!("{err}");
            std::process::exit(err.exit_code());
        }
    };

    if let Err(err) = pam
        .set_tty(&tty)
        .and_then(|_| pam.set_ruser("root"))
        .and_then(|_| pam.set_xdisplay(body.display_name))
    {
        warn!("{err}");
        std::process::exit(err.exit_code());
    }

    unsafe {
        signal::signal(Signal::SIGINT, signal::SigHandler::SigIgn).ok();
        signal::signal(Signal::SIGQUIT, signal::SigHandler::SigIgn).ok();
    }
    pam.acct_mgmt();
    unsafe {
        signal::signal(Signal::SIGINT, signal::SigHandler::SigDfl).ok();
        signal::signal(Signal::SIGQUIT, signal::SigHandler::SigDfl).ok();
    }

    if let Err(err) = setup_groups(body.user) {
        warn!("{err}");
        std::process::exit(err.exit_code());
    }

    if let Err(err) = pam.setcred_establish() {
        warn!("{err}");
        std::process::exit(err.exit_code());
    }

    if let Err(err) = pam.open_session() {
        warn!("{err}");
        std::process::exit(err.exit_code());
    }

    for (key, value) in pam.envlist() {
        env::set_var(key, value);
    }

    if let Err(err) = setuid(Uid::from_raw(body.user.uid)) {
        warn!("bad user id {} for user {}: {err}", body.user.uid, body.user.name);
        pam.close_session();
        std::process::exit(Error::OsError(err.to_string()).exit_code());
    }

    // SAFETY: guard lives in this process only, installed before the inner
    // fork so the forwarded SIGTERM is observable via `take_quit_requested`.
    let _guard = QuitSignalGuard::install();

    let result = pam_session::run_pam_session_body(|| {
        match unsafe { fork() }.map_err(|_| Error::OsError("cannot fork user shell".into()))? {
            ForkResult::Child => body.exec(),
            ForkResult::Parent { child } => Ok(child),
        }
    });

    pam.close_session();

    match result {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            warn!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn setup_groups(user: &PasswdEntry) -> Result<(), Error> {
    setgid(Gid::from_raw(user.gid))
        .map_err(|err| Error::OsError(format!("bad group id {} for user {}: {err}", user.gid, user.name)))?;

    let name = CString::new(user.name.as_str())
        .map_err(|_| Error::OsError("user name contains a NUL byte".into()))?;
    initgroups(&name, Gid::from_raw(user.gid))
        .map_err(|err| Error::OsError(format!("initgroups failed for user {}: {err}", user.name)))
}

/// Not wrapped by `nix`; `libc::ttyname` is the only way to recover the
/// controlling terminal's path for `PAM_TTY`.
fn current_tty() -> String {
    let ptr = unsafe { libc::ttyname(std::io::stdin().as_raw_fd()) };
    if ptr.is_null() {
        return "???".to_string();
    }
    let path = unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy();
    path.strip_prefix("/dev/").unwrap_or(&path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals;
    use nix::sys::wait::{waitpid, WaitStatus};

    /// Exercises the non-PAM path directly (no root required): fork, exec
    /// `/bin/sh -l -c <command>`, and confirm the reaped status matches.
    fn run_and_reap(command: &str) -> i32 {
        let mask = signals::block_all().expect("block signals");
        let mut session = XSession::new(
            command.to_string(),
            String::new(),
            false,
            false,
            ":0".to_string(),
            None,
        );

        session.start(&mask).expect("fork the session child");
        let pid = session.pid().expect("pid recorded after fork");

        let status = loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                Ok(_) => continue,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(err) => panic!("waitpid failed: {err}"),
            }
        };

        let _ = signals::restore_mask(&mask);
        status
    }

    /// A trivial session command exits 0.
    #[test]
    fn trivial_session_exits_zero() {
        assert_eq!(run_and_reap("exit 0"), 0);
    }

    /// A failing session command is reported with its own exit status.
    #[test]
    fn failing_session_reports_its_exit_status() {
        assert_eq!(run_and_reap("exit 2"), 2);
    }
}
