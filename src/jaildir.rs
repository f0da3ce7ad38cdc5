//! Jail directory lifecycle.
//!
//! The jail path is opened component by component with
//! `openat(O_PATH|O_NOFOLLOW)`, carrying the parent descriptor forward so
//! no step can be redirected through a symlink. Ancestors above the
//! policy's tree directory must be root-owned and not writable by anyone
//! else; components below it are created on demand. The walk also records
//! the jail's device number, which bounds every later recursive descent.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;

use crate::fsops::{cstring, FsOps};
use crate::mounts::MountTable;
use crate::paths::{absolute, check_filename, endslash};
use crate::policy::JailPolicy;
use crate::types::{DstState, JailAction, JailError, Result, ROOT};

const WALK_FLAGS: libc::c_int = libc::O_PATH | libc::O_CLOEXEC | libc::O_NOFOLLOW;

pub struct JailDir {
    /// Absolute jail path, slash-terminated.
    pub dir: String,
    pub parent: String,
    pub component: String,
    /// The policy tree directory that authorizes this jail.
    pub permdir: String,
    /// Device holding the jail; recursive operations never leave it.
    pub dev: libc::dev_t,
    pub skeletondir: String,
    parent_fd: RawFd,
}

impl Drop for JailDir {
    fn drop(&mut self) {
        if self.parent_fd >= 0 {
            // SAFETY: parent_fd is owned by this struct.
            unsafe {
                libc::close(self.parent_fd);
            }
            self.parent_fd = -1;
        }
    }
}

struct Dir(*mut libc::DIR);

impl Dir {
    /// Take ownership of `fd` and open it for iteration.
    fn from_fd(fd: RawFd) -> Result<Self> {
        // SAFETY: fd is a valid directory descriptor; on failure we still
        // own it and must close it.
        let d = unsafe { libc::fdopendir(fd) };
        if d.is_null() {
            let err = std::io::Error::last_os_error();
            // SAFETY: fdopendir did not take ownership.
            unsafe {
                libc::close(fd);
            }
            return Err(JailError::Io("fdopendir".into(), err));
        }
        Ok(Self(d))
    }

    fn entries(&mut self) -> Vec<(CString, u8)> {
        let mut out = Vec::new();
        loop {
            // SAFETY: the DIR pointer is valid while self is alive.
            let de = unsafe { libc::readdir(self.0) };
            if de.is_null() {
                break;
            }
            // SAFETY: d_name is NUL-terminated by readdir.
            let name = unsafe { CStr::from_ptr((*de).d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            // SAFETY: de points at a valid dirent.
            let d_type = unsafe { (*de).d_type };
            out.push((name.to_owned(), d_type));
        }
        out
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        // SAFETY: the DIR pointer is owned and closed exactly once.
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn fstat_fd(fd: RawFd, display: &str) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: st points at valid storage for fstat.
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
        return Err(JailError::last_os(display.to_string()));
    }
    // SAFETY: fstat succeeded and initialized st.
    Ok(unsafe { st.assume_init() })
}

impl JailDir {
    /// Validate and open the jail path. Returns `Ok(None)` when the path
    /// vanished and `rm --force` asked us to shrug.
    pub fn open(
        fs: &mut FsOps,
        raw: &str,
        skeleton: Option<&str>,
        action: JailAction,
        force: bool,
        policy: &JailPolicy,
    ) -> Result<Option<Self>> {
        let dir = check_filename(&absolute(raw)?)
            .ok_or_else(|| JailError::Path(format!("{}: Bad characters in filename", raw)))?;
        if dir == "/" || !dir.starts_with('/') {
            return Err(JailError::Path(format!("{}: Bad characters in filename", raw)));
        }
        let dir = endslash(&dir);

        let query = policy.allow_jail(&dir);
        if !query.allowed {
            return Err(JailError::Policy(format!(
                "{}: Jail disabled by /etc/pa-jail.conf\n{}",
                dir,
                query.disable_message()
            )));
        }
        let permdir = query.treedir;

        let skeletondir = match skeleton {
            Some(s) if !s.is_empty() => {
                let skel = endslash(&absolute(s)?);
                let sq = policy.allow_skeleton(&skel);
                if !sq.allowed {
                    return Err(JailError::Policy(format!(
                        "{}: Skeleton disabled by /etc/pa-jail.conf\n{}",
                        skel,
                        sq.disable_message()
                    )));
                }
                skel
            }
            _ => String::new(),
        };

        let mut this = Self {
            dir: dir.clone(),
            parent: String::new(),
            component: String::new(),
            permdir,
            dev: 0,
            skeletondir,
            parent_fd: -1,
        };

        let bytes = dir.as_bytes();
        let mut last_pos = 0usize;
        let mut fd: RawFd = -1;
        let mut dryrunning = false;
        while last_pos != bytes.len() {
            let mut next_pos = last_pos;
            while next_pos != 0 && next_pos < bytes.len() && bytes[next_pos] != b'/' {
                next_pos += 1;
            }
            if next_pos == 0 {
                next_pos = 1; // the root component
            }
            this.parent = dir[..last_pos].to_string();
            this.component = dir[last_pos..next_pos].to_string();
            let thisdir = &dir[..next_pos];
            last_pos = next_pos;
            while last_pos != bytes.len() && bytes[last_pos] == b'/' {
                last_pos += 1;
            }

            let allowed_here = !this.permdir.is_empty()
                && last_pos >= this.permdir.len()
                && dir.starts_with(&this.permdir);

            if this.parent_fd >= 0 {
                // SAFETY: we own the descriptor being replaced.
                unsafe {
                    libc::close(this.parent_fd);
                }
            }
            this.parent_fd = fd;
            let base = if this.parent_fd >= 0 {
                this.parent_fd
            } else {
                libc::AT_FDCWD // first component is absolute
            };
            let comp_c = cstring(&this.component)?;
            // SAFETY: base is a valid directory fd or AT_FDCWD and comp_c
            // a valid C string.
            fd = unsafe { libc::openat(base, comp_c.as_ptr(), WALK_FLAGS) };
            let open_errno = std::io::Error::last_os_error();
            if fd == -1 && !allowed_here && open_errno.raw_os_error() == Some(libc::ENOENT) {
                break;
            }
            if (fd == -1 && dryrunning)
                || (fd == -1
                    && allowed_here
                    && open_errno.raw_os_error() == Some(libc::ENOENT)
                    && matches!(action, JailAction::Add | JailAction::Run))
            {
                fs.mkdirat(this.parent_fd, &comp_c, 0o755, thisdir)?;
                fs.note_dir(thisdir);
                // SAFETY: as above; reopened without O_PATH so fchmod works.
                fd = unsafe {
                    libc::openat(base, comp_c.as_ptr(), libc::O_CLOEXEC | libc::O_NOFOLLOW)
                };
                // the jail root itself must not carry setuid/setgid
                if last_pos == bytes.len() && (fd >= 0 || fs.dryrun) {
                    fs.fchmod(fd, 0o755, thisdir)?;
                }
                if fs.dryrun {
                    dryrunning = true;
                    continue;
                }
            }
            if fd == -1 {
                if open_errno.raw_os_error() == Some(libc::ENOENT)
                    && action == JailAction::Rm
                    && force
                {
                    return Ok(None);
                }
                return Err(JailError::Io(thisdir.to_string(), open_errno));
            }

            let st = fstat_fd(fd, thisdir)?;
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                return Err(JailError::Io(
                    thisdir.to_string(),
                    std::io::Error::from_raw_os_error(libc::ENOTDIR),
                ));
            }
            if !allowed_here && last_pos != bytes.len() {
                if st.st_uid != ROOT {
                    return Err(JailError::Path(format!("{}: Not owned by root", thisdir)));
                }
                if (st.st_gid != ROOT && st.st_mode & 0o020 != 0) || st.st_mode & 0o002 != 0 {
                    return Err(JailError::Path(format!(
                        "{}: Writable by non-root",
                        thisdir
                    )));
                }
            }
            this.dev = st.st_dev;
        }
        if fd >= 0 {
            // SAFETY: fd was opened above and is not stored.
            unsafe {
                libc::close(fd);
            }
        }
        Ok(Some(this))
    }

    /// Rewrite `<jail>/home/*` ownership from the passwd database. Used
    /// after populating a jail so per-user homes belong to their users.
    pub fn chown_home(&self, fs: &mut FsOps, mounts: &mut MountTable) -> Result<()> {
        mounts.populate()?;
        let dirbuf = format!("{}home/", self.dir);
        let comp = cstring(&format!("{}/home", self.component))?;
        // SAFETY: parent_fd is the held jail parent descriptor.
        let dirfd = unsafe { libc::openat(self.parent_fd, comp.as_ptr(), libc::O_CLOEXEC | libc::O_NOFOLLOW) };
        if dirfd < 0 {
            return Err(JailError::last_os(dirbuf));
        }
        let st = fstat_fd(dirfd, &dirbuf)?;
        let r = self.chown_walk(fs, mounts, dirfd, dirbuf, ROOT, ROOT, Some(&home_map()), st.st_dev);
        // SAFETY: dirfd is owned here.
        unsafe {
            libc::close(dirfd);
        }
        r
    }

    /// Recursively chown `dir` (inside the jail) to `owner:group`,
    /// without following symlinks or crossing devices.
    pub fn chown_recursive(
        &self,
        fs: &mut FsOps,
        mounts: &mut MountTable,
        dir: &str,
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> Result<()> {
        let dirbuf = endslash(dir);
        let c = cstring(&crate::paths::noendslash(dir))?;
        // SAFETY: c is a valid NUL-terminated path.
        let dirfd = unsafe { libc::open(c.as_ptr(), libc::O_CLOEXEC | libc::O_NOFOLLOW) };
        if dirfd < 0 {
            return Err(JailError::last_os(dirbuf));
        }
        let st = fstat_fd(dirfd, &dirbuf)?;
        fs.fchown(dirfd, owner, group, &dirbuf)?;
        let r = self.chown_walk(fs, mounts, dirfd, dirbuf, owner, group, None, st.st_dev);
        // SAFETY: dirfd is owned here.
        unsafe {
            libc::close(dirfd);
        }
        r
    }

    #[allow(clippy::too_many_arguments)]
    fn chown_walk(
        &self,
        fs: &mut FsOps,
        mounts: &MountTable,
        dirfd: RawFd,
        dirbuf: String,
        owner: libc::uid_t,
        group: libc::gid_t,
        home_map: Option<&HashMap<String, (libc::uid_t, libc::gid_t)>>,
        dev: libc::dev_t,
    ) -> Result<()> {
        // SAFETY: dup so the iteration fd and the openat base stay
        // independent.
        let iter_fd = unsafe { libc::dup(dirfd) };
        if iter_fd < 0 {
            return Err(JailError::last_os(dirbuf));
        }
        let mut dir = Dir::from_fd(iter_fd)?;
        for (name, d_type) in dir.entries() {
            let name_str = name.to_string_lossy().into_owned();
            let display = format!("{}{}", dirbuf, name_str);

            if d_type == libc::DT_LNK {
                fs.lchownat(dirfd, &name, owner, group, &display)?;
                continue;
            }

            let (mut u, mut g) = (owner, group);
            if let Some(map) = home_map {
                if let Some(&(mu, mg)) = map.get(&name_str) {
                    u = mu;
                    g = mg;
                }
            }

            if d_type == libc::DT_DIR {
                let subdir = format!("{}{}", dirbuf, name_str);
                if mounts.get(&subdir).is_some() {
                    continue; // mount point
                }
                // SAFETY: dirfd is valid and name NUL-terminated.
                let subfd = unsafe {
                    libc::openat(dirfd, name.as_ptr(), libc::O_CLOEXEC | libc::O_NOFOLLOW)
                };
                if subfd < 0 {
                    return Err(JailError::last_os(subdir));
                }
                let st = fstat_fd(subfd, &subdir)?;
                if st.st_dev == dev {
                    fs.fchown(subfd, u, g, &subdir)?;
                    self.chown_walk(
                        fs,
                        mounts,
                        subfd,
                        endslash(&subdir),
                        u,
                        g,
                        None,
                        dev,
                    )?;
                }
                // SAFETY: subfd is owned here.
                unsafe {
                    libc::close(subfd);
                }
            } else {
                fs.lchownat(dirfd, &name, u, g, &display)?;
            }
        }
        Ok(())
    }

    /// Erase the jail tree, depth-first, never crossing devices, skipping
    /// subtrees a dry-run marked as unmounted.
    pub fn remove(&self, fs: &FsOps, dst_table: &HashMap<String, DstState>) -> Result<()> {
        self.remove_walk(
            fs,
            dst_table,
            self.parent_fd,
            &self.component.clone(),
            &endslash(&self.dir),
        )
    }

    fn remove_walk(
        &self,
        fs: &FsOps,
        dst_table: &HashMap<String, DstState>,
        parent_fd: RawFd,
        component: &str,
        dirname: &str,
    ) -> Result<()> {
        if dst_table.get(dirname) == Some(&DstState::Unmounted) {
            return Ok(());
        }

        let comp_c = cstring(component)?;
        // SAFETY: parent_fd is a valid directory fd.
        let dirfd = unsafe { libc::openat(parent_fd, comp_c.as_ptr(), libc::O_RDONLY) };
        if dirfd < 0 {
            return Err(JailError::last_os(dirname.to_string()));
        }
        let st = match fstat_fd(dirfd, dirname) {
            Ok(st) => st,
            Err(e) => {
                // SAFETY: dirfd is owned here.
                unsafe { libc::close(dirfd) };
                return Err(e);
            }
        };
        if st.st_dev != self.dev {
            // SAFETY: dirfd is owned here.
            unsafe { libc::close(dirfd) };
            return Ok(());
        }

        // SAFETY: dup keeps a base fd for unlinkat alongside iteration.
        let iter_fd = unsafe { libc::dup(dirfd) };
        if iter_fd < 0 {
            let err = JailError::last_os(dirname.to_string());
            // SAFETY: dirfd is owned here.
            unsafe { libc::close(dirfd) };
            return Err(err);
        }
        let mut dir = Dir::from_fd(iter_fd)?;
        for (name, d_type) in dir.entries() {
            let name_str = name.to_string_lossy().into_owned();
            if d_type == libc::DT_DIR {
                let next = format!("{}{}", dirname, name_str);
                self.remove_walk(fs, dst_table, dirfd, &name_str, &endslash(&next))?;
            } else {
                fs.echo(format_args!("rm {}{}", dirname, name_str));
                // SAFETY: dirfd valid, name NUL-terminated.
                if !fs.dryrun && unsafe { libc::unlinkat(dirfd, name.as_ptr(), 0) } != 0 {
                    return Err(JailError::last_os(format!("rm {}{}", dirname, name_str)));
                }
            }
        }
        drop(dir);
        // SAFETY: dirfd is owned here.
        unsafe {
            libc::close(dirfd);
        }

        fs.echo(format_args!("rmdir {}", dirname));
        // SAFETY: parent_fd valid, comp_c NUL-terminated.
        if !fs.dryrun
            && unsafe { libc::unlinkat(parent_fd, comp_c.as_ptr(), libc::AT_REMOVEDIR) } != 0
        {
            return Err(JailError::last_os(format!("rmdir {}", dirname)));
        }
        Ok(())
    }

    /// Atomically rename the jail to `newpath` (absolute, pre-validated).
    pub fn rename_to(&self, fs: &FsOps, newpath: &str) -> Result<()> {
        fs.echo(format_args!(
            "mv {}{} {}",
            self.parent, self.component, newpath
        ));
        if fs.dryrun {
            return Ok(());
        }
        let comp_c = cstring(&self.component)?;
        let new_c = cstring(newpath)?;
        // SAFETY: parent_fd valid; newpath is absolute so the second dirfd
        // is ignored.
        if unsafe { libc::renameat(self.parent_fd, comp_c.as_ptr(), self.parent_fd, new_c.as_ptr()) }
            != 0
        {
            return Err(JailError::last_os(format!(
                "mv {}{} {}",
                self.parent, self.component, newpath
            )));
        }
        Ok(())
    }
}

/// Map `/home/<leaf>` directory names to their owners: an account whose
/// `pw_dir` is exactly `/home/<name>` claims that name, otherwise the
/// account name itself is used.
fn home_map() -> HashMap<String, (libc::uid_t, libc::gid_t)> {
    let mut map = HashMap::new();
    // SAFETY: passwd iteration is process-global; we are single-threaded.
    unsafe {
        libc::setpwent();
        loop {
            let pw = libc::getpwent();
            if pw.is_null() {
                break;
            }
            let name = CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
            let dir = CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned();
            let key = match dir.strip_prefix("/home/") {
                Some(leaf) if !leaf.is_empty() && !leaf.contains('/') => leaf.to_string(),
                _ => name,
            };
            map.insert(key, ((*pw).pw_uid, (*pw).pw_gid));
        }
        libc::endpwent();
    }
    map
}
