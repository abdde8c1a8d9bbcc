//! X server controller: fork/exec handshake on `SIGUSR1`, then connect and
//! read back `WINDOWPATH` from the `XFree86_VT` root window property.
//! Grounded on `xserver.c`'s `nodm_xserver_start`/`_stop`/`_connect`/
//! `_read_window_path`, with the Xlib connection itself redesigned onto
//! `x11rb`: no FFI I/O-error callback, no `setjmp`/`longjmp`, ordinary
//! `Result`s instead.

use std::env;
use std::ffi::CString;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, setpgid, ForkResult, Pid};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt};
use x11rb::rust_connection::RustConnection;

use crate::child;
use crate::error::Error;
use crate::signals::ServerReadyGuard;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct XServer {
    argv: Vec<String>,
    display_name: String,
    start_timeout_seconds: u64,
    pid: Option<Pid>,
    connection: Option<RustConnection>,
    screen_num: usize,
    window_path: Option<String>,
}

impl XServer {
    pub fn new(argv: Vec<String>, display_name: String, start_timeout_seconds: u64) -> Self {
        Self {
            argv,
            display_name,
            start_timeout_seconds,
            pid: None,
            connection: None,
            screen_num: 0,
            window_path: None,
        }
    }

    pub fn window_path(&self) -> Option<&str> {
        self.window_path.as_deref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Fork/exec the server, wait for its readiness handshake, then connect
    /// and read `WINDOWPATH`. On any failure the child (if started) is torn
    /// down before returning. `original_mask` is the signal mask in effect
    /// before the Supervisor blocked everything at startup; the forked
    /// child restores it before `exec`.
    pub fn start(&mut self, original_mask: &nix::sys::signal::SigSet) -> Result<(), Error> {
        info!("starting X server: {}", self.argv.join(" "));

        let guard = ServerReadyGuard::install()?;

        let result = self.fork_and_wait(original_mask);

        match result {
            Ok(()) => {
                drop(guard);
                self.connect()?;
                self.read_window_path()?;
                Ok(())
            }
            Err(err) => {
                if let Some(pid) = self.pid {
                    child::must_exit(pid, "X server");
                    self.pid = None;
                }
                drop(guard);
                Err(err)
            }
        }
    }

    fn fork_and_wait(&mut self, original_mask: &nix::sys::signal::SigSet) -> Result<(), Error> {
        let argv0 = self.argv[0].clone();

        match unsafe { fork() }.map_err(|_| Error::OsError(format!("cannot fork to run {argv0}")))?
        {
            ForkResult::Child => {
                self.exec_server(original_mask);
                unreachable!("exec_server never returns");
            }
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                self.wait_for_ready(child)
            }
        }
    }

    /// Runs entirely in the forked child. Never returns: always ends in
    /// `exec` or `exit`.
    fn exec_server(&self, original_mask: &nix::sys::signal::SigSet) -> ! {
        let _ = crate::signals::restore_mask(original_mask);

        unsafe {
            signal::signal(Signal::SIGTTIN, signal::SigHandler::SigIgn).ok();
            signal::signal(Signal::SIGTTOU, signal::SigHandler::SigIgn).ok();
            signal::signal(Signal::SIGUSR1, signal::SigHandler::SigIgn).ok();
        }

        let _ = setpgid(Pid::from_raw(0), nix::unistd::getpid());

        let path = match CString::new(self.argv[0].as_str()) {
            Ok(path) => path,
            Err(_) => std::process::exit(Error::CmdNoExec(self.argv[0].clone()).exit_code()),
        };
        let args: Vec<CString> = self
            .argv
            .iter()
            .map(|s| CString::new(s.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
            .collect();

        let exec_err = execv(&path, &args).unwrap_err();
        let code = if exec_err == nix::Error::Sys(nix::errno::Errno::ENOENT) {
            Error::CmdNotFound(self.argv[0].clone()).exit_code()
        } else {
            Error::CmdNoExec(self.argv[0].clone()).exit_code()
        };
        std::process::exit(code);
    }

    fn wait_for_ready(&mut self, child: Pid) -> Result<(), Error> {
        let deadline = Instant::now() + Duration::from_secs(self.start_timeout_seconds);

        loop {
            if crate::signals::server_ready() {
                info!("X is ready to accept connections");
                return Ok(());
            }

            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    self.report_exit_code(code);
                    self.pid = None;
                    return Err(Error::XServerDied);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.report_exit_signal(sig);
                    self.pid = None;
                    return Err(Error::XServerDied);
                }
                Ok(_) => {}
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(err) => return Err(Error::OsError(format!("waitpid on X server: {err}"))),
            }

            if Instant::now() >= deadline {
                error!(
                    "X server did not respond after {} seconds",
                    self.start_timeout_seconds
                );
                return Err(Error::XServerTimeout);
            }

            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn connect(&mut self) -> Result<(), Error> {
        info!("connecting to X server");

        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                info!("connecting to X server, attempt #{}", attempt + 1);
            }

            match RustConnection::connect(Some(&self.display_name)) {
                Ok((conn, screen_num)) => {
                    self.connection = Some(conn);
                    self.screen_num = screen_num;
                    return Ok(());
                }
                Err(_) => {
                    warn!(
                        "could not connect to X server on \"{}\"",
                        self.display_name
                    );
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }

        Err(Error::XServerConnect)
    }

    fn read_window_path(&mut self) -> Result<(), Error> {
        info!("reading WINDOWPATH value from server");

        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::Programming("read_window_path called without a connection".into()))?;

        let root = conn
            .setup()
            .roots
            .get(self.screen_num)
            .ok_or_else(|| Error::XlibError("no screen roots advertised by server".into()))?
            .root;

        let atom = conn
            .intern_atom(false, b"XFree86_VT")
            .map_err(|err| Error::XlibError(format!("intern_atom failed: {err}")))?
            .reply()
            .map_err(|err| Error::XlibError(format!("intern_atom reply failed: {err}")))?
            .atom;

        let reply = conn
            .get_property(false, root, atom, AtomEnum::ANY, 0, 1)
            .map_err(|err| Error::XlibError(format!("get_property failed: {err}")))?
            .reply()
            .map_err(|err| Error::XlibError(format!("no XFree86 VT property: {err}")))?;

        let num: u32 = if reply.value_len == 0 {
            root
        } else if reply.value_len != 1 {
            return Err(Error::XlibError(format!(
                "{} != 1 items in XFree86_VT property",
                reply.value_len
            )));
        } else if reply.type_ != u32::from(AtomEnum::CARDINAL)
            && reply.type_ != u32::from(AtomEnum::INTEGER)
            && reply.type_ != u32::from(AtomEnum::WINDOW)
        {
            return Err(Error::XlibError(format!(
                "unsupported type {} in XFree86_VT property",
                reply.type_
            )));
        } else {
            match reply.format {
                8 => *reply
                    .value
                    .first()
                    .ok_or_else(|| Error::XlibError("truncated XFree86_VT property".into()))?
                    as u32,
                16 => {
                    let bytes: [u8; 2] = reply.value[..2]
                        .try_into()
                        .map_err(|_| Error::XlibError("truncated XFree86_VT property".into()))?;
                    u16::from_ne_bytes(bytes) as u32
                }
                32 => {
                    let bytes: [u8; 4] = reply.value[..4]
                        .try_into()
                        .map_err(|_| Error::XlibError("truncated XFree86_VT property".into()))?;
                    u32::from_ne_bytes(bytes)
                }
                other => {
                    return Err(Error::XlibError(format!(
                        "unsupported format {other} in XFree86_VT property"
                    )))
                }
            }
        };

        self.window_path = Some(match env::var("WINDOWPATH") {
            Ok(prior) if !prior.is_empty() => format!("{prior}:{num}"),
            _ => format!("{num}"),
        });

        Ok(())
    }

    fn report_exit_code(&self, code: i32) {
        warn!(
            "X server {} quit with status {code}",
            self.pid.map(Pid::as_raw).unwrap_or(-1)
        );
    }

    fn report_exit_signal(&self, sig: Signal) {
        error!(
            "X server {} was killed with signal {}",
            self.pid.map(Pid::as_raw).unwrap_or(-1),
            sig as i32
        );
    }

    /// Disconnect, kill and reap the server. Idempotent: safe to call when
    /// nothing was ever started.
    pub fn stop(&mut self) {
        // Dropping the connection closes the socket. Any I/O error on close
        // is unobservable through x11rb's API, which is exactly the
        // best-effort behaviour `ignorexio` emulated in the original.
        self.connection = None;

        if let Some(pid) = self.pid.take() {
            child::must_exit(pid, "X server");
        }

        self.window_path = None;
    }
}

impl Drop for XServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals;

    /// A server binary that exits immediately, before ever signalling
    /// readiness, must be reported as `XServerDied` rather than a timeout,
    /// and must leave no pid behind.
    #[test]
    fn server_dying_before_ready_reports_xserver_died() {
        let mask = signals::block_all().expect("block signals");
        let mut server = XServer::new(
            vec!["/bin/false".to_string(), ":97".to_string()],
            ":97".to_string(),
            5,
        );

        let result = server.start(&mask);

        assert!(matches!(result, Err(Error::XServerDied)));
        assert_eq!(server.pid(), None);
        let _ = signals::restore_mask(&mask);
    }
}
