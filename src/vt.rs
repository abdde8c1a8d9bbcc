//! Virtual terminal allocation: find the lowest unused `/dev/ttyN` at or
//! above a configured floor and hold it open for the supervisor's
//! lifetime. Generalized from "switch to a VT" to "find and reserve a free
//! one" per `vt.c`'s `nodm_vt_allocate`.

use std::os::unix::io::RawFd;

use log::info;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::error::Error;

#[cfg(not(target_env = "musl"))]
type RequestType = libc::c_ulong;
#[cfg(target_env = "musl")]
type RequestType = libc::c_int;

// From linux/vt.h. Not exposed by the `libc` crate.
const VT_GETSTATE: RequestType = 0x5603;

#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

const MAX_VT: i32 = 16;
const PROBE_DEVICES: [&str; 3] = ["/dev/tty", "/dev/tty0", "/dev/console"];

#[derive(Debug)]
pub struct VirtualTerminal {
    configured_initial_vt: i32,
    allocated_number: i32,
    holder: Option<RawFd>,
}

impl VirtualTerminal {
    pub fn new(configured_initial_vt: i32) -> Self {
        Self {
            configured_initial_vt,
            allocated_number: -1,
            holder: None,
        }
    }

    pub fn allocated_number(&self) -> i32 {
        self.allocated_number
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.configured_initial_vt < 0 {
            return Ok(());
        }

        let mut probe_fd = None;
        for device in PROBE_DEVICES {
            match fcntl::open(device, OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => {
                    probe_fd = Some(fd);
                    break;
                }
                Err(_) => continue,
            }
        }

        let probe_fd = probe_fd.ok_or_else(|| {
            Error::VtAllocationFailed("could not open any of /dev/tty, /dev/tty0, /dev/console".into())
        })?;

        let mut state = VtStat::default();
        let query = unsafe {
            libc::ioctl(
                probe_fd,
                VT_GETSTATE,
                &mut state as *mut VtStat,
            )
        };
        let _ = close(probe_fd);

        if query < 0 {
            return Err(Error::VtAllocationFailed(
                "VT_GETSTATE ioctl failed".into(),
            ));
        }

        let in_use_mask = state.v_state as u32;
        let chosen = (self.configured_initial_vt..MAX_VT)
            .find(|n| in_use_mask & (1 << n) == 0)
            .ok_or_else(|| Error::VtAllocationFailed("no free virtual terminal".into()))?;

        let path = format!("/dev/tty{chosen}");
        let fd = fcntl::open(path.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|err| {
            Error::VtAllocationFailed(format!("could not open {path}: {err}"))
        })?;

        info!("Allocated virtual terminal {chosen}");

        self.allocated_number = chosen;
        self.holder = Some(fd);

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(fd) = self.holder.take() {
            let _ = close(fd);
        }
        self.allocated_number = -1;
    }
}

impl Drop for VirtualTerminal {
    fn drop(&mut self) {
        self.stop();
    }
}
