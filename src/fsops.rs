//! Filesystem primitives with action echoing and dry-run support.
//!
//! Every mutating operation prints its shell equivalent in verbose mode
//! (to stdout under `-n`, stderr under `-V`) and is suppressed entirely
//! under dry-run. The echo stream is part of the tool's contract: a
//! dry-run that prints nothing is the idempotence check.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::process::Command;

use crate::paths::{noendslash, parentdir};
use crate::types::{JailError, Result};

pub struct FsOps {
    pub verbose: bool,
    pub dryrun: bool,
    /// Whether echoed actions go to stdout (dry-run) or stderr.
    echo_stdout: bool,
    /// Directories already confirmed or created by `ensure_dir`; the
    /// value records whether this process created them.
    dirtable: HashMap<String, bool>,
    /// Set when a non-fatal construction step failed; the final exit code
    /// reports it.
    pub failed: bool,
}

pub fn cstring(path: &str) -> Result<CString> {
    CString::new(path.as_bytes())
        .map_err(|_| JailError::Path(format!("{}: embedded NUL in path", path)))
}

fn uid_name(uid: libc::uid_t) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn gid_name(gid: libc::gid_t) -> String {
    match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

impl FsOps {
    pub fn new(verbose: bool, dryrun: bool) -> Self {
        Self {
            verbose: verbose || dryrun,
            dryrun,
            echo_stdout: dryrun,
            dirtable: HashMap::new(),
            failed: false,
        }
    }

    pub fn echo(&self, line: std::fmt::Arguments) {
        if !self.verbose {
            return;
        }
        if self.echo_stdout {
            let _ = writeln!(std::io::stdout(), "{}", line);
        } else {
            let _ = writeln!(std::io::stderr(), "{}", line);
        }
    }

    /// Print a construction error and remember the failure; processing
    /// continues so one bad manifest entry does not hide the rest.
    pub fn report(&mut self, err: &JailError) {
        eprintln!("{}", err);
        self.failed = true;
    }

    pub fn chmod(&self, path: &str, mode: libc::mode_t) -> Result<()> {
        self.echo(format_args!("chmod 0{:o} {}", mode, path));
        if self.dryrun {
            return Ok(());
        }
        let c = cstring(path)?;
        // SAFETY: `c` is a valid NUL-terminated path.
        if unsafe { libc::chmod(c.as_ptr(), mode) } != 0 {
            return Err(JailError::last_os(format!("chmod {}", path)));
        }
        Ok(())
    }

    pub fn fchmod(&self, fd: libc::c_int, mode: libc::mode_t, path: &str) -> Result<()> {
        self.echo(format_args!("chmod 0{:o} {}", mode, path));
        if self.dryrun {
            return Ok(());
        }
        // SAFETY: fd is an open descriptor owned by the caller.
        if unsafe { libc::fchmod(fd, mode) } != 0 {
            return Err(JailError::last_os(format!("chmod {}", path)));
        }
        Ok(())
    }

    pub fn lchown(&self, path: &str, owner: libc::uid_t, group: libc::gid_t) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            uid_name(owner),
            gid_name(group),
            path
        ));
        if self.dryrun {
            return Ok(());
        }
        let c = cstring(path)?;
        // SAFETY: `c` is a valid NUL-terminated path; lchown never follows
        // the final symlink.
        if unsafe { libc::lchown(c.as_ptr(), owner, group) } != 0 {
            return Err(JailError::last_os(format!("chown {}", path)));
        }
        Ok(())
    }

    pub fn lchownat(
        &self,
        dirfd: libc::c_int,
        name: &CString,
        owner: libc::uid_t,
        group: libc::gid_t,
        display: &str,
    ) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            uid_name(owner),
            gid_name(group),
            display
        ));
        if self.dryrun {
            return Ok(());
        }
        // SAFETY: dirfd is an open directory and name a valid C string.
        if unsafe {
            libc::fchownat(dirfd, name.as_ptr(), owner, group, libc::AT_SYMLINK_NOFOLLOW)
        } != 0
        {
            return Err(JailError::last_os(format!("chown {}", display)));
        }
        Ok(())
    }

    pub fn fchown(
        &self,
        fd: libc::c_int,
        owner: libc::uid_t,
        group: libc::gid_t,
        display: &str,
    ) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            uid_name(owner),
            gid_name(group),
            display
        ));
        if self.dryrun {
            return Ok(());
        }
        // SAFETY: fd is an open descriptor owned by the caller.
        if unsafe { libc::fchown(fd, owner, group) } != 0 {
            return Err(JailError::last_os(format!("chown {}", display)));
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: libc::mode_t) -> Result<()> {
        self.echo(format_args!("mkdir -m 0{:o} {}", mode, path));
        if self.dryrun {
            return Ok(());
        }
        let c = cstring(path)?;
        // SAFETY: `c` is a valid NUL-terminated path.
        if unsafe { libc::mkdir(c.as_ptr(), mode) } != 0 {
            return Err(JailError::last_os(format!("mkdir {}", path)));
        }
        Ok(())
    }

    pub fn mkdirat(
        &self,
        dirfd: libc::c_int,
        name: &CString,
        mode: libc::mode_t,
        display: &str,
    ) -> Result<()> {
        self.echo(format_args!("mkdir -m 0{:o} {}", mode, display));
        if self.dryrun {
            return Ok(());
        }
        // SAFETY: dirfd is an open directory and name a valid C string.
        if unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode) } != 0 {
            return Err(JailError::last_os(format!("mkdir {}", display)));
        }
        Ok(())
    }

    /// `mkdir -p` with a result cache. Returns `true` when the terminal
    /// directory was created, `false` when it already existed. With
    /// `nolink`, a symlink at `path` is an error rather than followed.
    pub fn ensure_dir(&mut self, path: &str, mode: libc::mode_t, nolink: bool) -> Result<bool> {
        let path = noendslash(path);
        if let Some(&created) = self.dirtable.get(&path) {
            return Ok(created);
        }

        let meta = if nolink {
            std::fs::symlink_metadata(&path)
        } else {
            std::fs::metadata(&path)
        };
        let created = match meta {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => {
                return Err(JailError::Io(
                    path.clone(),
                    std::io::Error::from_raw_os_error(libc::ENOTDIR),
                ))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let parent = parentdir(&path);
                if noendslash(&parent) != path {
                    self.ensure_dir(&parent, mode, false)?;
                }
                self.mkdir(&path, mode)?;
                true
            }
            Err(err) => return Err(JailError::Io(path.clone(), err)),
        };
        self.dirtable.insert(path, created);
        Ok(created)
    }

    /// Record a directory created outside `ensure_dir` (the jail walk
    /// creates components with mkdirat).
    pub fn note_dir(&mut self, path: &str) {
        self.dirtable.insert(noendslash(path), false);
    }

    pub fn rm_f(&self, path: &str) -> Result<()> {
        self.echo(format_args!("rm -f {}", path));
        if self.dryrun {
            return Ok(());
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(JailError::Io(format!("rm {}", path), err)),
        }
    }

    /// Replace `new` with a hard link to `old`.
    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        self.rm_f(new)?;
        self.echo(format_args!("ln {} {}", old, new));
        if self.dryrun {
            return Ok(());
        }
        std::fs::hard_link(old, new).map_err(JailError::io(format!("ln {} {}", old, new)))
    }

    /// Copy one file with `/bin/cp -p`, replacing the destination.
    pub fn cp_p(&self, src: &str, dst: &str) -> Result<()> {
        self.rm_f(dst)?;
        self.echo(format_args!("cp -p {} {}", src, dst));
        if self.dryrun {
            return Ok(());
        }
        let status = Command::new("/bin/cp")
            .arg("-p")
            .arg(src)
            .arg(dst)
            .status()
            .map_err(JailError::io("fork"))?;
        if !status.success() {
            return Err(JailError::Construct(format!(
                "/bin/cp {}: Bad exit status",
                dst
            )));
        }
        Ok(())
    }

    pub fn mknod(&self, path: &str, mode: libc::mode_t, dev: libc::dev_t) -> Result<()> {
        self.echo(format_args!(
            "mknod -m 0{:o} {} {}",
            mode & 0o7777,
            path,
            dev_name(mode, dev)
        ));
        if self.dryrun {
            return Ok(());
        }
        let c = cstring(path)?;
        // SAFETY: `c` is a valid NUL-terminated path.
        if unsafe { libc::mknod(c.as_ptr(), mode, dev) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) && mknod_matches(path, mode, dev) {
                return Ok(());
            }
            return Err(JailError::Io(format!("mknod {}", path), err));
        }
        Ok(())
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.echo(format_args!("ln -s {} {}", target, link));
        if self.dryrun {
            return Ok(());
        }
        match std::os::unix::fs::symlink(target, link) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match std::fs::read_link(link) {
                    Ok(existing) if existing.as_os_str().as_bytes() == target.as_bytes() => Ok(()),
                    _ => Err(JailError::Io(format!("symlink {} {}", target, link), err)),
                }
            }
            Err(err) => Err(JailError::Io(format!("symlink {} {}", target, link), err)),
        }
    }

    /// Copy the source's mtime onto `path` without following symlinks.
    pub fn copy_mtime(&self, path: &str, meta: &std::fs::Metadata) -> Result<()> {
        use std::os::unix::fs::MetadataExt;
        self.echo(format_args!("touch -m -d @{} {}", meta.mtime(), path));
        if self.dryrun {
            return Ok(());
        }
        let times = [
            libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            libc::timespec {
                tv_sec: meta.mtime(),
                tv_nsec: meta.mtime_nsec(),
            },
        ];
        let c = cstring(path)?;
        // SAFETY: `c` is a valid NUL-terminated path and `times` is a
        // two-element array as utimensat requires.
        if unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        } != 0
        {
            return Err(JailError::last_os(format!("utimensat {}", path)));
        }
        Ok(())
    }
}

fn mknod_matches(path: &str, mode: libc::mode_t, dev: libc::dev_t) -> bool {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.mode() as libc::mode_t == mode && meta.rdev() == dev,
        Err(_) => false,
    }
}

fn dev_name(mode: libc::mode_t, dev: libc::dev_t) -> String {
    let (major, minor) = (libc::major(dev), libc::minor(dev));
    match mode & libc::S_IFMT {
        libc::S_IFCHR => format!("c {} {}", major, minor),
        libc::S_IFBLK => format!("b {} {}", major, minor),
        libc::S_IFIFO => "p".to_string(),
        _ => format!("{} {}", mode, dev),
    }
}

/// Wait for `child`, mapping signal deaths to `128 + signo` the way the
/// shell does.
pub fn wait_status(child: libc::pid_t, flags: libc::c_int) -> (libc::pid_t, i32) {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status points at a valid int.
        let w = unsafe { libc::waitpid(child, &mut status, flags) };
        if w > 0 && libc::WIFEXITED(status) {
            return (w, libc::WEXITSTATUS(status));
        } else if w > 0 && libc::WIFSIGNALED(status) {
            return (w, 128 + libc::WTERMSIG(status));
        } else if w > 0 {
            continue; // stopped; keep waiting
        } else if w == 0 {
            // SAFETY: setting errno through the libc location is sound.
            unsafe { *libc::__errno_location() = libc::EAGAIN };
            return (-1, -1);
        } else if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return (-1, -1);
        }
    }
}
