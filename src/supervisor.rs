//! The controller: payload fork, byte relay, timeouts, teardown.
//!
//! After the namespace transition the controller forks the payload and
//! becomes a single-threaded relay between host stdin/stdout, the pty
//! master, an optional input fd, and any event-stream subscribers. One
//! `poll` is the only suspension point. The controller is pid 1 of the
//! jail's pid namespace, so its exit tears down everything inside.

use std::io::Write;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::unistd::{Gid, Uid};

use crate::buffer::StreamBuf;
use crate::builder::JailBuilder;
use crate::events::EventStream;
use crate::fsops::{cstring, wait_status, FsOps};
use crate::namespace;
use crate::owner::{to_cstrings, JailOwner};
use crate::paths::shell_quote;
use crate::pty::{self, PtyMaster, SlaveConfig, TtyState};
use crate::signals::SignalSource;
use crate::types::{CallerIds, JailError, Result, EXIT_IO, EXIT_PRIV, EXIT_TIMEOUT, ROOT};

pub struct RunConfig {
    pub timeout: Option<f64>,
    pub idle_timeout: Option<f64>,
    pub foreground: bool,
    pub ready_marker: Option<String>,
    /// Terminal size, `None` under `--size none`.
    pub term_size: Option<(u16, u16)>,
    pub no_onlcr: bool,
}

/// The pid file is written with the caller's identity and flocked for
/// the lifetime of the run.
pub struct PidFile {
    fd: RawFd,
    name: String,
    contents: String,
}

impl PidFile {
    pub fn open(name: &str, contents: &str, fs: &FsOps) -> Result<Option<Self>> {
        fs.echo(format_args!("touch {}\nflock {}", name, name));
        if fs.dryrun {
            return Ok(None);
        }
        let c = cstring(name)?;
        // SAFETY: c is a valid NUL-terminated path.
        let fd = unsafe {
            libc::open(
                c.as_ptr(),
                libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT,
                0o666 as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(JailError::last_os(name.to_string()));
        }
        loop {
            // SAFETY: fd is open.
            if unsafe { libc::flock(fd, libc::LOCK_EX) } == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(JailError::Io(name.to_string(), err));
            }
        }
        let this = Self {
            fd,
            name: name.to_string(),
            contents: contents.to_string(),
        };
        this.write(None)?;
        Ok(Some(this))
    }

    /// Write the pid (substituting `$$` in the configured contents), or a
    /// `*` placeholder while the pid is unknown.
    pub fn write(&self, pid: Option<libc::pid_t>) -> Result<()> {
        let mut out = String::with_capacity(self.contents.len() + 16);
        match pid {
            Some(pid) => {
                let mut rest = self.contents.as_str();
                while let Some(at) = rest.find("$$") {
                    out.push_str(&rest[..at]);
                    out.push_str(&pid.to_string());
                    rest = &rest[at + 2..];
                }
                out.push_str(rest);
            }
            None => out.push('*'),
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        // SAFETY: fd is the open pid file.
        let ok = unsafe {
            libc::lseek(self.fd, 0, libc::SEEK_SET) != -1
                && libc::write(self.fd, out.as_ptr().cast(), out.len()) == out.len() as isize
                && libc::ftruncate(self.fd, out.len() as libc::off_t) == 0
        };
        if !ok {
            return Err(JailError::last_os(self.name.clone()));
        }
        Ok(())
    }
}

struct TimingFile {
    fd: RawFd,
    count: u64,
    last_msec: u64,
    last_off: u64,
}

pub struct Supervisor {
    to_slave: StreamBuf,
    to_slave_off: u64,
    from_slave: StreamBuf,
    from_slave_off: u64,
    streams: Vec<EventStream>,
    pub stdin_tty: bool,
    pub stdout_tty: bool,
    pub stderr_tty: bool,
    tty: Option<TtyState>,
    input_fd: RawFd,
    event_source_fd: RawFd,
    timing: Option<TimingFile>,
    child_status: Option<i32>,
    has_blocked: bool,
    quiet: bool,
    no_onlcr: bool,
    verbose: bool,
    start: Instant,
    expiry: Option<Instant>,
    idle_timeout: Option<Duration>,
    idle_expiry: Option<Instant>,
}

fn is_tty(fd: RawFd) -> bool {
    // SAFETY: isatty is harmless on any fd value.
    unsafe { libc::isatty(fd) == 1 }
}

fn make_nonblocking(fd: RawFd) {
    // SAFETY: fcntl flag juggling on an fd the caller owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

impl Supervisor {
    /// Capture terminal state early, before any stdio juggling. `input_fd`
    /// is 0 when input comes from stdin; `event_source_fd` and
    /// `timing_fd` are -1 when absent.
    pub fn new(
        input_fd: RawFd,
        event_source_fd: RawFd,
        timing_fd: RawFd,
        quiet: bool,
        no_onlcr: bool,
        verbose: bool,
    ) -> Self {
        let mut from_slave = StreamBuf::new(8192);
        // keep event offsets aligned with the output file when stdout is
        // redirected into one
        // SAFETY: lseek on stdout is harmless.
        let stdout_off = unsafe { libc::lseek(libc::STDOUT_FILENO, 0, libc::SEEK_CUR) };
        let origin = if stdout_off < 0 { 0 } else { stdout_off as u64 };
        from_slave.set_origin(origin);

        Self {
            to_slave: StreamBuf::new(4096),
            to_slave_off: 0,
            from_slave,
            from_slave_off: origin,
            streams: Vec::new(),
            stdin_tty: is_tty(libc::STDIN_FILENO),
            stdout_tty: is_tty(libc::STDOUT_FILENO),
            stderr_tty: is_tty(libc::STDERR_FILENO),
            tty: TtyState::capture(&[
                libc::STDIN_FILENO,
                libc::STDOUT_FILENO,
                libc::STDERR_FILENO,
            ]),
            input_fd,
            event_source_fd,
            timing: (timing_fd >= 0).then(|| TimingFile {
                fd: timing_fd,
                count: 0,
                last_msec: 0,
                last_off: 0,
            }),
            child_status: None,
            has_blocked: false,
            quiet,
            no_onlcr,
            verbose,
            start: Instant::now(),
            expiry: None,
            idle_timeout: None,
            idle_expiry: None,
        }
    }

    pub fn arm_timeouts(&mut self, timeout: Option<f64>, idle_timeout: Option<f64>) {
        self.start = Instant::now();
        self.expiry = timeout
            .filter(|t| *t > 0.0)
            .map(|t| self.start + Duration::from_secs_f64(t));
        self.idle_timeout = idle_timeout
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64);
        self.idle_expiry = self.idle_timeout.map(|d| self.start + d);
    }

    fn write_timing(&mut self) {
        let Some(t) = &mut self.timing else {
            return;
        };
        let delta_ms = self.start.elapsed().as_millis() as u64;
        let line = if t.count % 128 == 0 {
            format!("{},{}\n", delta_ms, self.from_slave_off)
        } else {
            format!(
                "+{},+{}\n",
                delta_ms - t.last_msec,
                self.from_slave_off - t.last_off
            )
        };
        let bytes = line.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            // SAFETY: the slice bounds are valid.
            let n = unsafe {
                libc::write(
                    t.fd,
                    bytes[written..].as_ptr().cast(),
                    bytes.len() - written,
                )
            };
            if n < 0 {
                eprintln!("Timing file: {}", std::io::Error::last_os_error());
                std::process::exit(1);
            }
            written += n as usize;
        }
        t.last_msec = delta_ms;
        t.last_off = self.from_slave_off;
        t.count += 1;
    }

    /// One poll cycle: build the fd set, block until an edge or deadline,
    /// drain signals, accept subscribers.
    fn block(&mut self, master_fd: RawFd, signals: &mut SignalSource) {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(6 + self.streams.len());
        let pollin = libc::POLLIN;
        let pollout = libc::POLLOUT;
        fds.push(libc::pollfd { fd: signals.fd(), events: pollin, revents: 0 });

        if self.to_slave.can_read() {
            fds.push(libc::pollfd { fd: self.input_fd, events: pollin, revents: 0 });
        }

        let mut master_events = 0;
        if self.from_slave.can_read() {
            master_events |= pollin;
        }
        if self.to_slave.can_write() {
            master_events |= pollout;
        }
        if master_events != 0 {
            fds.push(libc::pollfd { fd: master_fd, events: master_events, revents: 0 });
        }

        if self.from_slave.can_write() {
            fds.push(libc::pollfd { fd: libc::STDOUT_FILENO, events: pollout, revents: 0 });
        }

        let mut listener_index = None;
        if self.event_source_fd >= 0 {
            fds.push(libc::pollfd { fd: self.event_source_fd, events: pollin, revents: 0 });
            listener_index = Some(fds.len() - 1);
        }
        for es in &self.streams {
            if es.buf.can_write() {
                fds.push(libc::pollfd { fd: es.fd, events: pollout, revents: 0 });
            }
        }

        let mut timeout_ms: i32 = 3_600_000;
        if !self.streams.is_empty() {
            timeout_ms = 30_000;
        }
        let now = Instant::now();
        for deadline in [self.expiry, self.idle_expiry].into_iter().flatten() {
            let remaining = if now < deadline {
                deadline.duration_since(now).as_millis().min(i32::MAX as u128) as i32
            } else {
                0
            };
            timeout_ms = timeout_ms.min(remaining);
        }

        // a zero-timeout probe first: if nothing is ready we are about to
        // genuinely block, which is what the timing file samples
        // SAFETY: fds is a valid pollfd array.
        let mut rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
        if rc == 0 {
            self.has_blocked = true;
            // SAFETY: as above.
            rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        }
        if rc < 0 {
            return;
        }

        if fds[0].revents & pollin != 0 {
            signals.drain();
        }

        if let Some(idx) = listener_index {
            if fds[idx].revents & pollin != 0 {
                // SAFETY: event_source_fd is a listening socket.
                let cfd = unsafe {
                    libc::accept(self.event_source_fd, std::ptr::null_mut(), std::ptr::null_mut())
                };
                if cfd >= 0 {
                    let mut es = EventStream::new(cfd, self.from_slave.start());
                    es.write_header();
                    es.write_event(&self.from_slave);
                    self.streams.push(es);
                }
            }
        }
    }

    /// Reap children and evaluate every termination cause except the
    /// escape sequence. `wait_all` holds the child's status back until
    /// the output buffer has drained.
    fn check_child_timeout(
        &mut self,
        child: libc::pid_t,
        wait_all: bool,
        signals: &SignalSource,
    ) -> Option<i32> {
        loop {
            let (pid, status) = wait_status(-1, libc::WNOHANG);
            if pid == child {
                self.child_status = Some(status);
            }
            if pid == -1 {
                break;
            }
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EAGAIN && errno != libc::ECHILD {
            return Some(EXIT_IO);
        }
        if let Some(status) = self.child_status {
            if wait_all {
                return Some(status);
            }
        }
        if signals.got_sigterm {
            return Some(128 + libc::SIGTERM);
        }
        let now = Instant::now();
        if self.expiry.is_some_and(|t| now > t) || self.idle_expiry.is_some_and(|t| now > t) {
            return Some(EXIT_TIMEOUT);
        }
        None
    }

    /// The relay loop. Runs as pid 1 of the jail; never returns.
    pub fn relay(
        mut self,
        child: libc::pid_t,
        master: PtyMaster,
        mut signals: SignalSource,
        caller: CallerIds,
    ) -> ! {
        // escalate through the saved root, then hold the caller's
        // identity so sockets and files stay theirs
        let restored = nix::unistd::setresuid(
            Uid::from_raw(ROOT),
            Uid::from_raw(ROOT),
            Uid::from_raw(ROOT),
        )
        .and_then(|_| {
            nix::unistd::setresgid(
                Gid::from_raw(caller.gid),
                Gid::from_raw(caller.gid),
                Gid::from_raw(caller.gid),
            )
        })
        .and_then(|_| {
            nix::unistd::setresuid(
                Uid::from_raw(caller.uid),
                Uid::from_raw(caller.uid),
                Uid::from_raw(caller.uid),
            )
        });
        if restored.is_err() {
            eprintln!("setresuid: {}", std::io::Error::last_os_error());
            self.finish(child, EXIT_PRIV);
        }

        let _ = std::io::stdout().flush();

        if let Some(tty) = &self.tty {
            tty.make_raw();
        }
        make_nonblocking(master.fd);
        if self.input_fd == 0 && !self.stdin_tty {
            // SAFETY: stdin is ours to close; the payload has its own.
            unsafe {
                libc::close(libc::STDIN_FILENO);
            }
            self.to_slave.read_closed = true;
            self.to_slave.write_closed = true;
        }
        if self.input_fd == 0 && !self.stdout_tty && !self.stderr_tty {
            // SAFETY: as above for stdout.
            unsafe {
                libc::close(libc::STDOUT_FILENO);
            }
            self.from_slave.read_closed = true;
            self.from_slave.write_closed = true;
            self.from_slave.read_errno = libc::EIO; // closed, not an error
        }

        if self.event_source_fd > 0 {
            // SAFETY: event_source_fd is a bound socket.
            if unsafe { libc::listen(self.event_source_fd, 50) } != 0 {
                eprintln!("listen: {}", std::io::Error::last_os_error());
                self.finish(child, EXIT_PRIV);
            }
        }

        loop {
            let wait_all = self.from_slave.done();
            if let Some(status) = self.check_child_timeout(child, wait_all, &signals) {
                self.finish(child, status);
            }

            // the child lives but the pty read failed for real
            if self.from_slave.read_closed && self.from_slave.read_errno != libc::EIO {
                let nl = if self.no_onlcr { "\n" } else { "\r\n" };
                eprint!(
                    "read: {}{}",
                    std::io::Error::from_raw_os_error(self.from_slave.read_errno),
                    nl
                );
                self.finish(child, EXIT_IO);
            }

            self.block(master.fd, &mut signals);
            let mut any = false;

            if self.to_slave.read(self.input_fd) {
                any = true;
            }
            if !self.to_slave.is_empty()
                && self.to_slave.pending().windows(2).any(|w| w == b"\x1b\x03")
            {
                self.finish(child, 128 + libc::SIGTERM);
            }
            let mut off = self.to_slave_off;
            if self.to_slave.write(master.fd, &mut off) {
                self.to_slave_off = off;
                self.to_slave.consume_to(off);
                any = true;
            } else {
                self.to_slave_off = off;
            }
            if self.from_slave.read(master.fd) {
                any = true;
            }
            if self.has_blocked && self.timing.is_some() {
                self.write_timing();
                self.has_blocked = false;
            }
            if !self.from_slave.is_empty() {
                let last_off = self.from_slave.end();
                for es in &mut self.streams {
                    if es.output_off < last_off {
                        es.write_event(&self.from_slave);
                    }
                }
            }
            let mut off = self.from_slave_off;
            if self.from_slave.write(libc::STDOUT_FILENO, &mut off) {
                self.from_slave_off = off;
                self.from_slave.consume_to(off);
                any = true;
            } else {
                self.from_slave_off = off;
            }

            for es in &mut self.streams {
                es.flush();
            }
            self.streams.retain_mut(|es| {
                if es.buf.write_closed {
                    // SAFETY: the subscriber fd is owned by the stream.
                    unsafe {
                        libc::close(es.fd);
                    }
                    false
                } else {
                    true
                }
            });

            if any {
                if let Some(idle) = self.idle_timeout {
                    self.idle_expiry = Some(Instant::now() + idle);
                }
            }
        }
    }

    /// Terminate: final timing sample, banner, tty restore, subscriber
    /// drain, exit.
    fn finish(&mut self, child: libc::pid_t, status: i32) -> ! {
        if self.timing.is_some() {
            self.write_timing();
        }

        let banner = if status == EXIT_TIMEOUT && !self.quiet {
            Some("...timed out".to_string())
        } else if status == 128 + libc::SIGTERM && !self.quiet {
            Some("...terminated".to_string())
        } else if self.verbose {
            Some(format!("...terminating with status {}", status))
        } else {
            None
        };
        if let Some(msg) = banner {
            let nl = if self.no_onlcr { "\n" } else { "\r\n" };
            if self.input_fd > 0 || self.stderr_tty {
                eprint!("{}\x1b[3;7;31m{}\x1b[K\x1b[0m{}\x1b[K{}", nl, msg, nl, nl);
            } else {
                eprint!("{}{}{}{}", nl, msg, nl, nl);
            }
        }

        #[cfg(not(target_os = "linux"))]
        if status >= EXIT_TIMEOUT {
            // no pid namespace to collapse; kill the payload directly
            // SAFETY: child is the payload pid.
            unsafe {
                libc::kill(child, libc::SIGKILL);
            }
        }
        #[cfg(target_os = "linux")]
        let _ = child;

        if let Some(tty) = &self.tty {
            tty.restore();
        }
        let _ = std::io::stderr().flush();

        for es in &mut self.streams {
            es.write_done();
        }
        loop {
            let mut fds: Vec<libc::pollfd> = Vec::new();
            self.streams.retain_mut(|es| {
                es.flush();
                if es.buf.write_closed || !es.buf.can_write() {
                    // SAFETY: the subscriber fd is owned by the stream.
                    unsafe {
                        libc::close(es.fd);
                    }
                    false
                } else {
                    fds.push(libc::pollfd { fd: es.fd, events: libc::POLLOUT, revents: 0 });
                    true
                }
            });
            if fds.is_empty() {
                break;
            }
            // SAFETY: fds is a valid pollfd array.
            unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 5000);
            }
        }
        std::process::exit(status);
    }
}

/// Everything `run` does after construction: unshare, fork the
/// controller, and either wait (`--fg`) or detach. Returns the parent's
/// exit status; the controller itself exits from inside `relay`.
pub fn run_jail(
    mut sup: Supervisor,
    builder: JailBuilder,
    jdir: &str,
    owner: &JailOwner,
    args: &[String],
    cfg: &RunConfig,
    caller: CallerIds,
    pidfile: Option<PidFile>,
) -> Result<i32> {
    let (env, command) = owner.build_env(args);
    let argv = owner.build_argv(command);
    sup.arm_timeouts(cfg.timeout, cfg.idle_timeout);

    if builder.fs.dryrun {
        controller_main(sup, builder, jdir, owner, &env, &argv, cfg, caller)?;
        return Ok(0);
    }

    namespace::unshare_namespaces(&builder.fs)?;
    // SAFETY: single-threaded at this point; the child execs or exits.
    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(JailError::Privilege(
            "fork".into(),
            std::io::Error::last_os_error(),
        ));
    }
    if child == 0 {
        // the controller: pid 1 of the new namespace, never returns
        match controller_main(sup, builder, jdir, owner, &env, &argv, cfg, caller) {
            Ok(()) => std::process::exit(0),
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(err.exit_code());
            }
        }
    }

    if let Some(pf) = &pidfile {
        pf.write(Some(child))?;
    }

    // the controller owns the terminal now
    // SAFETY: these descriptors are not used by the parent again.
    unsafe {
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }

    let mut exit_status = 0;
    if cfg.foreground {
        let _ = nix::unistd::setresgid(
            Gid::from_raw(caller.gid),
            Gid::from_raw(caller.gid),
            Gid::from_raw(caller.gid),
        );
        let _ = nix::unistd::setresuid(
            Uid::from_raw(caller.uid),
            Uid::from_raw(caller.uid),
            Uid::from_raw(caller.uid),
        );
        exit_status = wait_status(child, 0).1;
        if let Some(tty) = &sup.tty {
            tty.restore_now();
        }
    }
    Ok(exit_status)
}

#[allow(clippy::too_many_arguments)]
fn controller_main(
    sup: Supervisor,
    mut builder: JailBuilder,
    jdir: &str,
    owner: &JailOwner,
    env: &[String],
    argv: &[String],
    cfg: &RunConfig,
    caller: CallerIds,
) -> Result<()> {
    namespace::enter_jail(&mut builder, jdir)?;
    namespace::become_jail_user_keep_root(owner, &builder.fs)?;

    builder.fs.echo(format_args!("make-pty"));
    let master = if builder.fs.dryrun {
        None
    } else {
        Some(pty::open_master()?)
    };

    builder.fs.echo(format_args!("cd {}", owner.home));
    if !builder.fs.dryrun {
        nix::unistd::chdir(owner.home.as_str()).map_err(|e| {
            JailError::Io(owner.home.clone(), std::io::Error::from_raw_os_error(e as i32))
        })?;
    }

    if !builder.fs.dryrun {
        let shell_c = cstring(&owner.shell)?;
        // SAFETY: shell_c is a valid NUL-terminated path.
        if unsafe { libc::access(shell_c.as_ptr(), libc::R_OK | libc::X_OK) } != 0 {
            return Err(JailError::last_os(owner.shell.clone()));
        }
    }

    if let Some(marker) = &cfg.ready_marker {
        if builder.fs.verbose {
            let nl = marker.ends_with('\n');
            builder.fs.echo(format_args!(
                "echo {}{}",
                if nl { "" } else { "-n " },
                marker.trim_end_matches('\n')
            ));
        }
        if !builder.fs.dryrun {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(marker.as_bytes());
            let _ = stdout.flush();
        }
    }

    if builder.fs.verbose {
        let words: Vec<String> = env
            .iter()
            .cloned()
            .chain(argv.iter().map(|a| shell_quote(a)))
            .collect();
        builder.fs.echo(format_args!("{}", words.join(" ")));
    }

    if builder.fs.dryrun {
        return Ok(());
    }
    let master = master.expect("pty master exists outside dry-run");

    let signals = SignalSource::start()?;
    if sup.input_fd > 0 || sup.stdin_tty {
        make_nonblocking(sup.input_fd);
    }
    if sup.input_fd > 0 || sup.stdout_tty {
        make_nonblocking(libc::STDOUT_FILENO);
    }

    let argv_c = to_cstrings(argv)?;
    let env_c = to_cstrings(env)?;
    let slave_cfg = SlaveConfig {
        winsize: cfg.term_size,
        no_onlcr: cfg.no_onlcr,
        dup_stdin: sup.input_fd > 0 || sup.stdin_tty,
        dup_stdout: sup.input_fd > 0 || sup.stdout_tty,
        dup_stderr: sup.input_fd > 0 || sup.stderr_tty,
    };

    // SAFETY: single-threaded; the child only runs exec-safe code.
    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(JailError::Privilege(
            "fork".into(),
            std::io::Error::last_os_error(),
        ));
    }
    if child == 0 {
        payload_child(owner, &master, &slave_cfg, &argv_c, &env_c);
    }

    sup.relay(child, master, signals, caller);
}

/// The payload side of the fork: permanent privilege drop, session and
/// pty adoption, clean signal slate, exec.
fn payload_child(
    owner: &JailOwner,
    master: &PtyMaster,
    slave_cfg: &SlaveConfig,
    argv: &[std::ffi::CString],
    env: &[std::ffi::CString],
) -> ! {
    // SAFETY: getpid cannot fail.
    let my_pid = unsafe { libc::getpid() };
    SignalSource::unblock_in_child();

    if let Err(err) = namespace::become_jail_user_forever(owner) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
    // SAFETY: we are a fresh fork child, eligible to lead a session.
    if unsafe { libc::setsid() } == -1 {
        eprintln!("setsid: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }
    if let Err(err) = pty::child_open_slave(master, my_pid, slave_cfg) {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    // an ignored disposition would survive exec; give the payload a
    // clean slate
    for sig in 1..65 {
        // SAFETY: resetting a disposition is always allowed to fail.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }

    let argv_ptr: &std::ffi::CStr = &argv[0];
    match nix::unistd::execve(argv_ptr, argv, env) {
        Ok(infallible) => match infallible {},
        Err(err) => {
            eprintln!(
                "exec {}: {}",
                owner.shell,
                std::io::Error::from_raw_os_error(err as i32)
            );
            std::process::exit(crate::types::EXIT_EXEC);
        }
    }
}
