/// Core types for the pa-jail tool
use std::io;
use thiserror::Error;

/// User and group id of the process that invoked us, captured before any
/// privilege manipulation.
#[derive(Clone, Copy, Debug)]
pub struct CallerIds {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl CallerIds {
    pub fn capture() -> Self {
        // SAFETY: getuid/getgid cannot fail.
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

/// The CLI actions. A `run` invocation without a command degrades to
/// `Add`, which is how the bare `start` form dispatches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JailAction {
    Add,
    Run,
    Rm,
    Mv,
}

/// What has already happened to a destination path inside the jail.
/// The ordering matters: mounted and unmounted destinations are never
/// copied over or re-mounted.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum DstState {
    Copied,
    Mounted,
    Unmounted,
}

/// Errors raised while setting up, entering, or supervising a jail.
#[derive(Error, Debug)]
pub enum JailError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Policy(String),

    #[error("{0}")]
    Path(String),

    #[error("{0}: {1}")]
    Io(String, #[source] io::Error),

    #[error("{0}")]
    Construct(String),

    #[error("{0}: {1}")]
    Privilege(String, #[source] io::Error),

    #[error("{0}: {1}")]
    Runtime(String, #[source] io::Error),
}

impl JailError {
    /// Map an error to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            JailError::Privilege(..) => 127,
            JailError::Runtime(..) => 125,
            _ => 1,
        }
    }

    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> JailError {
        let context = context.into();
        move |err| JailError::Io(context, err)
    }

    pub fn last_os(context: impl Into<String>) -> JailError {
        JailError::Io(context.into(), io::Error::last_os_error())
    }
}

/// Result type alias for pa-jail operations.
pub type Result<T> = std::result::Result<T, JailError>;

/// Exit codes reserved by the run state machine.
pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_IO: i32 = 125;
pub const EXIT_EXEC: i32 = 126;
pub const EXIT_PRIV: i32 = 127;

pub const ROOT: libc::uid_t = 0;
