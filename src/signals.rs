//! SIGCHLD/SIGTERM delivery as a pollable file descriptor.
//!
//! On Linux the signals are blocked and routed through a signalfd; the
//! payload child unblocks them again before exec. Elsewhere a self-pipe
//! written from a minimal handler provides the same edge.

use std::os::unix::io::RawFd;

use crate::types::{JailError, Result};

#[cfg(target_os = "linux")]
pub struct SignalSource {
    sfd: nix::sys::signalfd::SignalFd,
    pub got_sigterm: bool,
}

#[cfg(target_os = "linux")]
impl SignalSource {
    /// Block SIGCHLD and SIGTERM and open a signalfd for them.
    pub fn start() -> Result<Self> {
        use nix::sys::signal::{SigSet, Signal};
        use nix::sys::signalfd::{SfdFlags, SignalFd};

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.thread_block()
            .map_err(|e| JailError::Privilege(
                "sigprocmask".into(),
                std::io::Error::from_raw_os_error(e as i32),
            ))?;
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| JailError::Privilege(
                "signalfd".into(),
                std::io::Error::from_raw_os_error(e as i32),
            ))?;
        Ok(Self {
            sfd,
            got_sigterm: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.sfd.as_raw_fd()
    }

    /// Drain pending signal events, recording whether SIGTERM arrived.
    pub fn drain(&mut self) {
        while let Ok(Some(info)) = self.sfd.read_signal() {
            if info.ssi_signo == libc::SIGTERM as u32 {
                self.got_sigterm = true;
            }
        }
    }

    /// Undo the mask in the payload child so the jail sees signals
    /// normally. The signalfd itself is close-on-exec.
    pub fn unblock_in_child() {
        use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
        let empty = SigSet::empty();
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&empty), None);
    }
}

#[cfg(not(target_os = "linux"))]
pub struct SignalSource {
    read_fd: RawFd,
    pub got_sigterm: bool,
}

#[cfg(not(target_os = "linux"))]
static mut SIGPIPE_WRITE: RawFd = -1;

#[cfg(not(target_os = "linux"))]
static GOT_SIGTERM: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

#[cfg(not(target_os = "linux"))]
extern "C" fn pipe_handler(signo: libc::c_int) {
    if signo == libc::SIGTERM {
        GOT_SIGTERM.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    let byte = signo as u8;
    // SAFETY: write(2) is async-signal-safe and the fd outlives the
    // handler installation.
    unsafe {
        libc::write(SIGPIPE_WRITE, (&byte as *const u8).cast(), 1);
    }
}

#[cfg(not(target_os = "linux"))]
impl SignalSource {
    pub fn start() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds points at two ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(JailError::Privilege(
                "pipe".into(),
                std::io::Error::last_os_error(),
            ));
        }
        for fd in fds {
            // SAFETY: fd was just created.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        // SAFETY: single-threaded setup before any handler can run.
        unsafe {
            SIGPIPE_WRITE = fds[1];
            libc::signal(libc::SIGCHLD, pipe_handler as usize);
            libc::signal(libc::SIGTERM, pipe_handler as usize);
        }
        Ok(Self {
            read_fd: fds[0],
            got_sigterm: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn drain(&mut self) {
        let mut buf = [0u8; 128];
        // SAFETY: buf is a valid destination.
        while unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
        if GOT_SIGTERM.load(std::sync::atomic::Ordering::SeqCst) {
            self.got_sigterm = true;
        }
    }

    pub fn unblock_in_child() {}
}
