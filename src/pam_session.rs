//! Raw PAM bindings and the PAM-holding "middle process" used by the X
//! session controller. Talks to `pam_sys` directly (flat C-style constants,
//! a raw `pam_handle_t` pointer, a hand-rolled conversation callback)
//! instead of a higher-level password-prompting wrapper, since this daemon
//! needs to set `PAM_TTY`/`PAM_RUSER`/`PAM_XDISPLAY` items that such
//! wrappers don't expose. `nodm` never prompts for a password (it
//! auto-logs-in), so the conversation function only ever has to answer
//! `PAM_ERROR_MSG`/`PAM_TEXT_INFO` and, if a module insists on asking
//! something else anyway, an empty string.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;

use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use pam_sys::*;

use crate::error::Error;

pub struct PamSession {
    handle: *mut pam_handle_t,
    status: i32,
}

extern "C" fn conversation(
    num_msg: i32,
    msg: *mut *const pam_message,
    resp: *mut *mut pam_response,
    _appdata_ptr: *mut libc::c_void,
) -> i32 {
    unsafe {
        let msgs = std::slice::from_raw_parts(msg, num_msg as usize);
        let responses =
            libc::calloc(num_msg as usize, std::mem::size_of::<pam_response>()) as *mut pam_response;
        if responses.is_null() {
            return PAM_BUF_ERR;
        }
        let out = std::slice::from_raw_parts_mut(responses, num_msg as usize);

        for (i, m_ptr) in msgs.iter().enumerate() {
            let m = **m_ptr;
            match m.msg_style {
                PAM_ERROR_MSG => {
                    warn!("PAM: {}", CStr::from_ptr(m.msg).to_string_lossy());
                    out[i].resp = ptr::null_mut();
                    out[i].resp_retcode = 0;
                }
                PAM_TEXT_INFO => {
                    info!("PAM: {}", CStr::from_ptr(m.msg).to_string_lossy());
                    out[i].resp = ptr::null_mut();
                    out[i].resp_retcode = 0;
                }
                PAM_PROMPT_ECHO_OFF | PAM_PROMPT_ECHO_ON => {
                    out[i].resp = libc::strdup(CString::new("").unwrap().as_ptr());
                    out[i].resp_retcode = 0;
                }
                _ => {
                    libc::free(responses as *mut libc::c_void);
                    return PAM_CONV_ERR;
                }
            }
        }

        *resp = responses;
        PAM_SUCCESS
    }
}

impl PamSession {
    pub fn start(service: &str, user: &str) -> Result<Self, Error> {
        let c_service = CString::new(service)
            .map_err(|_| Error::PamError("service name contains a NUL byte".into()))?;
        let c_user =
            CString::new(user).map_err(|_| Error::PamError("user name contains a NUL byte".into()))?;

        let conv = pam_conv {
            conv: Some(conversation),
            appdata_ptr: ptr::null_mut(),
        };

        let mut handle: *mut pam_handle_t = ptr::null_mut();
        let status = unsafe { pam_start(c_service.as_ptr(), c_user.as_ptr(), &conv, &mut handle) };

        let session = PamSession { handle, status };
        if status != PAM_SUCCESS {
            return Err(Error::PamError(format!("pam_start failed with code {status}")));
        }
        Ok(session)
    }

    fn set_item(&mut self, item_type: i32, value: &str) -> Result<(), Error> {
        let c_value = CString::new(value)
            .map_err(|_| Error::PamError("item value contains a NUL byte".into()))?;
        let status =
            unsafe { pam_set_item(self.handle, item_type, c_value.as_ptr() as *const libc::c_void) };
        if status != PAM_SUCCESS {
            return Err(Error::PamError(format!(
                "pam_set_item({item_type}) failed with code {status}"
            )));
        }
        Ok(())
    }

    pub fn set_tty(&mut self, tty: &str) -> Result<(), Error> {
        self.set_item(PAM_TTY, tty)
    }

    pub fn set_ruser(&mut self, ruser: &str) -> Result<(), Error> {
        self.set_item(PAM_RUSER, ruser)
    }

    pub fn set_xdisplay(&mut self, display: &str) -> Result<(), Error> {
        self.set_item(PAM_XDISPLAY, display)
    }

    /// `xsession-child.c` warns and continues on a failing account check;
    /// an auto-login session is not blocked by it.
    pub fn acct_mgmt(&mut self) {
        let status = unsafe { pam_acct_mgmt(self.handle, 0) };
        if status != PAM_SUCCESS {
            warn!("pam_acct_mgmt failed with code {status}, continuing anyway");
        }
    }

    pub fn setcred_establish(&mut self) -> Result<(), Error> {
        let status = unsafe { pam_setcred(self.handle, PAM_ESTABLISH_CRED as i32) };
        if status != PAM_SUCCESS {
            return Err(Error::PamError(format!("pam_setcred failed with code {status}")));
        }
        Ok(())
    }

    pub fn open_session(&mut self) -> Result<(), Error> {
        let status = unsafe { pam_open_session(self.handle, 0) };
        if status != PAM_SUCCESS {
            return Err(Error::PamError(format!("pam_open_session failed with code {status}")));
        }
        Ok(())
    }

    pub fn close_session(&mut self) {
        let status = unsafe { pam_close_session(self.handle, 0) };
        if status != PAM_SUCCESS {
            warn!("pam_close_session failed with code {status}");
        }
    }

    /// Consumes and frees PAM's own copy of the environment list it built
    /// up from modules like `pam_env`.
    pub fn envlist(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        unsafe {
            let list = pam_getenvlist(self.handle);
            if !list.is_null() {
                let mut cursor = list;
                while !(*cursor).is_null() {
                    let entry = CStr::from_ptr(*cursor).to_string_lossy();
                    if let Some((key, value)) = entry.split_once('=') {
                        env.insert(key.to_string(), value.to_string());
                    }
                    libc::free(*cursor as *mut libc::c_void);
                    cursor = cursor.add(1);
                }
                libc::free(list as *mut libc::c_void);
            }
        }
        env
    }
}

impl Drop for PamSession {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                pam_end(self.handle, self.status);
            }
        }
    }
}

/// The PAM-holding middle process described in `xsession-child.c`: it forks
/// once more, letting `spawn_inner` run in the grandchild while this
/// process blocks in `waitpid(WUNTRACED)` so a job-control stop of the
/// session doesn't leave PAM credentials established against a frozen
/// process (SIGSTOP is re-applied to itself and SIGCONT forwarded to the
/// grandchild). `SIGTERM` received here kills the grandchild (`SIGTERM`
/// then, after a grace period, `SIGKILL`) before this function returns so
/// the caller can tear down PAM and report `SessionDied`.
pub fn run_pam_session_body(spawn_inner: impl FnOnce() -> Result<Pid, Error>) -> Result<i32, Error> {
    let inner = spawn_inner()?;

    loop {
        match waitpid(inner, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(WaitStatus::Stopped(pid, _)) => {
                let _ = signal::kill(pid, Signal::SIGCONT);
                let _ = signal::kill(nix::unistd::getpid(), Signal::SIGSTOP);
                let _ = signal::kill(pid, Signal::SIGCONT);
            }
            Ok(_) => continue,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {
                if term_requested() {
                    return Ok(kill_grandchild_and_wait(inner));
                }
                continue;
            }
            Err(err) => return Err(Error::OsError(format!("waitpid on session child: {err}"))),
        }
    }
}

fn term_requested() -> bool {
    crate::signals::take_quit_requested()
}

fn kill_grandchild_and_wait(inner: Pid) -> i32 {
    let _ = signal::kill(inner, Signal::SIGTERM);
    std::thread::sleep(std::time::Duration::from_secs(2));
    if matches!(crate::child::has_quit(inner), crate::child::Status::Running) {
        let _ = signal::kill(inner, Signal::SIGKILL);
    }
    match waitpid(inner, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
        _ => 128 + Signal::SIGTERM as i32,
    }
}
