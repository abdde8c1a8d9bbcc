//! The error taxonomy shared by every component and the single place that
//! maps an error to the process exit code described in `nodm`'s man page.

use std::fmt::{self, Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Not running as root outside of `--nested` mode.
    NoPerm,
    /// Bad command line usage.
    Usage(String),
    /// A configuration value could not be parsed.
    BadArg(String),
    /// `execv` failed with `ENOENT`.
    CmdNotFound(String),
    /// `execv` failed with anything else.
    CmdNoExec(String),
    /// An invariant that should be impossible was violated.
    Programming(String),
    /// A PAM call failed.
    PamError(String),
    /// Any other `errno`-bearing OS failure.
    OsError(String),
    /// The `XFree86_VT` property had an unsupported type/format, or was
    /// multi-valued.
    XlibError(String),
    /// No virtual terminal could be allocated.
    VtAllocationFailed(String),
    /// The X server died before or after becoming ready.
    XServerDied,
    /// The X server never signalled readiness within the timeout.
    XServerTimeout,
    /// The X server never accepted a client connection.
    XServerConnect,
    /// The X session command exited.
    SessionDied(i32),
    /// `SIGTERM`/`SIGINT`/`SIGQUIT` was received.
    UserQuit,
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        use Error::*;

        match self {
            NoPerm => 1,
            Usage(_) => 2,
            BadArg(_) => 3,
            CmdNoExec(_) => 126,
            CmdNotFound(_) => 127,
            Programming(_) => 200,
            PamError(_) => 201,
            OsError(_) => 202,
            XlibError(_) => 203,
            VtAllocationFailed(_) => 204,
            XServerDied => 210,
            XServerTimeout => 211,
            XServerConnect => 212,
            SessionDied(_) => 220,
            UserQuit => 221,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Error::*;

        match self {
            NoPerm => write!(f, "nodm must be run as root (use --nested to avoid this)"),
            Usage(msg) => write!(f, "usage error: {msg}"),
            BadArg(msg) => write!(f, "bad argument: {msg}"),
            CmdNotFound(cmd) => write!(f, "command not found: {cmd}"),
            CmdNoExec(cmd) => write!(f, "could not execute: {cmd}"),
            Programming(msg) => write!(f, "internal error: {msg}"),
            PamError(msg) => write!(f, "PAM error: {msg}"),
            OsError(msg) => write!(f, "OS error: {msg}"),
            XlibError(msg) => write!(f, "X protocol error: {msg}"),
            VtAllocationFailed(msg) => write!(f, "could not allocate a virtual terminal: {msg}"),
            XServerDied => write!(f, "the X server died"),
            XServerTimeout => write!(f, "the X server did not become ready in time"),
            XServerConnect => write!(f, "could not connect to the X server"),
            SessionDied(status) => write!(f, "the X session exited with status {status}"),
            UserQuit => write!(f, "terminated by signal"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::OsError(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::OsError(err.to_string())
    }
}
