//! Pseudo-terminal plumbing.
//!
//! The controller allocates the master before dropping its saved root;
//! the payload child opens the slave after `setsid` so it becomes the
//! controlling terminal of the new session.

use std::ffi::CStr;
use std::os::unix::io::RawFd;

use crate::types::{JailError, Result};

pub struct PtyMaster {
    pub fd: RawFd,
    pub slave_name: String,
}

impl Drop for PtyMaster {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // SAFETY: the master fd is owned by this struct.
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

fn set_input_flags(fd: RawFd) {
    let mut tty = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tty points at valid storage.
    if unsafe { libc::tcgetattr(fd, tty.as_mut_ptr()) } >= 0 {
        // SAFETY: tcgetattr initialized it.
        let mut tty = unsafe { tty.assume_init() };
        tty.c_iflag |= libc::BRKINT | libc::IGNPAR | libc::IMAXBEL | libc::IUTF8;
        // SAFETY: tty is a valid termios.
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &tty);
        }
    }
}

/// Allocate and unlock a pty master.
pub fn open_master() -> Result<PtyMaster> {
    // SAFETY: plain syscall wrappers; the fd is checked before use.
    unsafe {
        let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        if fd == -1 {
            return Err(JailError::Privilege(
                "posix_openpt".into(),
                std::io::Error::last_os_error(),
            ));
        }
        set_input_flags(fd);
        if libc::grantpt(fd) == -1 {
            return Err(JailError::Privilege(
                "grantpt".into(),
                std::io::Error::last_os_error(),
            ));
        }
        if libc::unlockpt(fd) == -1 {
            return Err(JailError::Privilege(
                "unlockpt".into(),
                std::io::Error::last_os_error(),
            ));
        }
        let mut buf = [0 as libc::c_char; 128];
        if libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) != 0 {
            return Err(JailError::Privilege(
                "ptsname".into(),
                std::io::Error::last_os_error(),
            ));
        }
        let slave_name = CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned();
        Ok(PtyMaster { fd, slave_name })
    }
}

/// How the payload child wires the slave onto its standard descriptors.
#[derive(Clone, Copy, Debug)]
pub struct SlaveConfig {
    /// Terminal size, `None` under `--size none`.
    pub winsize: Option<(u16, u16)>,
    pub no_onlcr: bool,
    pub dup_stdin: bool,
    pub dup_stdout: bool,
    pub dup_stderr: bool,
}

/// Runs in the payload child, after `setsid` and the permanent privilege
/// drop: open the slave, adopt it as the controlling tty, size it, and
/// dup it over the standard descriptors.
pub fn child_open_slave(master: &PtyMaster, child: libc::pid_t, cfg: &SlaveConfig) -> Result<()> {
    let name = crate::fsops::cstring(&master.slave_name)?;
    // SAFETY: syscall sequence on descriptors the child owns.
    unsafe {
        let slave = libc::open(name.as_ptr(), libc::O_RDWR);
        if slave == -1 {
            return Err(JailError::last_os(master.slave_name.clone()));
        }
        libc::close(master.fd);
        libc::ioctl(slave, libc::TIOCSCTTY, 0);
        libc::tcsetpgrp(slave, child);

        if let Some((cols, rows)) = cfg.winsize {
            let mut ws = std::mem::MaybeUninit::<libc::winsize>::uninit();
            libc::ioctl(slave, libc::TIOCGWINSZ, ws.as_mut_ptr());
            let mut ws = ws.assume_init();
            ws.ws_col = cols;
            ws.ws_row = rows;
            libc::ioctl(slave, libc::TIOCSWINSZ, &ws);
        }

        let mut tty = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(slave, tty.as_mut_ptr()) >= 0 {
            let mut tty = tty.assume_init();
            tty.c_iflag |= libc::BRKINT | libc::IGNPAR | libc::IMAXBEL | libc::IUTF8;
            if cfg.no_onlcr {
                tty.c_oflag &= !libc::ONLCR;
            }
            libc::tcsetattr(slave, libc::TCSANOW, &tty);
        }

        if cfg.dup_stdin {
            libc::dup2(slave, libc::STDIN_FILENO);
        }
        if cfg.dup_stdout {
            libc::dup2(slave, libc::STDOUT_FILENO);
        }
        if cfg.dup_stderr {
            libc::dup2(slave, libc::STDERR_FILENO);
        }
        libc::close(slave);
    }
    Ok(())
}

/// Save and restore terminal attributes around the relay loop.
pub struct TtyState {
    pub fd: RawFd,
    saved: libc::termios,
}

impl TtyState {
    /// Capture the termios of the first standard descriptor that is a
    /// tty, if any.
    pub fn capture(fds: &[RawFd]) -> Option<Self> {
        for &fd in fds {
            // SAFETY: isatty on a possibly-closed fd is harmless.
            if unsafe { libc::isatty(fd) } == 1 {
                let mut tty = std::mem::MaybeUninit::<libc::termios>::uninit();
                // SAFETY: tty points at valid storage.
                if unsafe { libc::tcgetattr(fd, tty.as_mut_ptr()) } == 0 {
                    // SAFETY: initialized by tcgetattr.
                    let saved = unsafe { tty.assume_init() };
                    return Some(Self { fd, saved });
                }
            }
        }
        None
    }

    /// Raw mode with a one-byte, short-timeout read, for interactive
    /// relaying.
    pub fn make_raw(&self) {
        let mut tty = self.saved;
        // SAFETY: cfmakeraw only mutates the struct.
        unsafe {
            libc::cfmakeraw(&mut tty);
        }
        tty.c_cc[libc::VMIN] = 1;
        tty.c_cc[libc::VTIME] = 1;
        // SAFETY: tty is a valid termios.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &tty);
        }
    }

    pub fn restore(&self) {
        // SAFETY: saved is the attribute set captured earlier.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.saved);
        }
    }

    pub fn restore_now(&self) {
        // SAFETY: saved is the attribute set captured earlier.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved);
        }
    }
}
