//! Host mount introspection and jail mount scheduling.
//!
//! The table starts from `/proc/mounts` and picks up manifest-declared
//! binds and filesystem mounts. Which phase actually performs a mount is
//! decided by `mountable`: `/proc` and `/dev/pts` only make sense inside
//! the new namespace, `/sys` and `/dev` must happen before the fork, and
//! `/run` is never replicated.

use std::collections::HashMap;

use nix::mount::MsFlags;

use crate::fsops::FsOps;
use crate::types::{DstState, JailError, Result};

struct MountArg {
    name: &'static str,
    value: MsFlags,
    unparse: bool,
}

const MOUNT_ARGS: &[MountArg] = &[
    MountArg { name: "bind", value: MsFlags::MS_BIND, unparse: false },
    MountArg { name: "noatime", value: MsFlags::MS_NOATIME, unparse: true },
    MountArg { name: "nodev", value: MsFlags::MS_NODEV, unparse: true },
    MountArg { name: "nodiratime", value: MsFlags::MS_NODIRATIME, unparse: true },
    MountArg { name: "noexec", value: MsFlags::MS_NOEXEC, unparse: true },
    MountArg { name: "nosuid", value: MsFlags::MS_NOSUID, unparse: true },
    MountArg { name: "private", value: MsFlags::MS_PRIVATE, unparse: true },
    MountArg { name: "rec", value: MsFlags::MS_REC, unparse: false },
    MountArg { name: "relatime", value: MsFlags::MS_RELATIME, unparse: true },
    MountArg { name: "remount", value: MsFlags::MS_REMOUNT, unparse: true },
    MountArg { name: "ro", value: MsFlags::MS_RDONLY, unparse: true },
    MountArg { name: "rw", value: MsFlags::empty(), unparse: true },
    MountArg { name: "slave", value: MsFlags::MS_SLAVE, unparse: true },
    MountArg { name: "strictatime", value: MsFlags::MS_STRICTATIME, unparse: true },
    MountArg { name: "unbindable", value: MsFlags::MS_UNBINDABLE, unparse: true },
];

fn find_mount_arg(name: &str) -> Option<&'static MountArg> {
    MOUNT_ARGS.iter().find(|ma| ma.name == name)
}

/// One mount: a source, filesystem type, canonical flag set, and the
/// residual option string for everything the kernel flag set cannot hold.
#[derive(Clone, Debug, PartialEq)]
pub struct MountSlot {
    pub fsname: String,
    pub fstype: String,
    pub opts: MsFlags,
    pub data: String,
    /// Declared by the manifest (as opposed to inherited from the host).
    pub wanted: bool,
}

impl MountSlot {
    pub fn new(fsname: &str, fstype: &str, options: &str) -> Self {
        let mut slot = Self {
            fsname: fsname.to_string(),
            fstype: fstype.to_string(),
            opts: MsFlags::empty(),
            data: String::new(),
            wanted: false,
        };
        for opt in options.split(',').filter(|o| !o.is_empty()) {
            let key = opt.split('=').next().unwrap_or(opt);
            if let Some(ma) = find_mount_arg(key) {
                slot.opts |= ma.value;
            } else {
                if !slot.data.is_empty() {
                    slot.data.push(',');
                }
                slot.data.push_str(opt);
            }
        }
        slot
    }

    /// Fold one more option into the slot. Recognized keywords set (or,
    /// for `rw`, clear) flag bits; anything else replaces a same-keyed
    /// entry in the residual string.
    pub fn add_mountopt(&mut self, opt: &str) {
        let key = opt.split('=').next().unwrap_or(opt);
        if let Some(ma) = find_mount_arg(key) {
            if ma.value.is_empty() {
                self.opts &= !MsFlags::MS_RDONLY;
            } else {
                self.opts |= ma.value;
            }
            return;
        }
        let keep: Vec<&str> = self
            .data
            .split(',')
            .filter(|o| !o.is_empty() && o.split('=').next().unwrap_or(o) != key)
            .collect();
        self.data = keep.join(",");
        if !self.data.is_empty() {
            self.data.push(',');
        }
        self.data.push_str(opt);
    }

    fn mount_data(&self) -> Option<&str> {
        if self.data.is_empty() {
            None
        } else {
            Some(&self.data)
        }
    }

    fn unparse_opts(&self, opts: MsFlags) -> String {
        let mut arg = String::new();
        if !opts.contains(MsFlags::MS_RDONLY) {
            arg.push_str("rw");
        }
        for ma in MOUNT_ARGS {
            if !ma.value.is_empty() && opts.contains(ma.value) && ma.unparse {
                if !arg.is_empty() {
                    arg.push(',');
                }
                arg.push_str(ma.name);
            }
        }
        if !self.data.is_empty() {
            if !arg.is_empty() {
                arg.push(',');
            }
            arg.push_str(&self.data);
        }
        if opts.contains(MsFlags::MS_BIND) {
            let start = if opts.contains(MsFlags::MS_REC) {
                " --rbind "
            } else {
                " --bind "
            };
            if arg == "rw" {
                return start.to_string();
            }
            return format!("{}-o {}", start, arg);
        }
        if arg.is_empty() {
            arg
        } else {
            format!(" -o {}", arg)
        }
    }

    /// The `mount(8)` invocation equivalent to this slot, for echoing and
    /// error messages.
    pub fn debug_mount_command(&self, dst: &str, opts: MsFlags) -> String {
        format!(
            "mount -i -n -t {}{} {} {}",
            self.fstype,
            self.unparse_opts(opts),
            self.fsname,
            dst
        )
    }

    fn mount(&self, dst: &str, opts: MsFlags, fs: &FsOps) -> std::io::Result<()> {
        fs.echo(format_args!("{}", self.debug_mount_command(dst, opts)));
        if fs.dryrun {
            return Ok(());
        }
        nix::mount::mount(
            Some(self.fsname.as_str()),
            dst,
            Some(self.fstype.as_str()),
            opts,
            self.mount_data(),
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }
}

/// Which stage of the jail lifecycle is asking for mounts.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum MountPhase {
    /// `add`: interpret the manifest, mount nothing that needs the child.
    Manifest,
    /// `run`, before the namespace fork.
    PreFork,
    /// Inside the new mount namespace, after the fork.
    Child,
}

pub struct MountTable {
    table: HashMap<String, MountSlot>,
    pub phase: MountPhase,
    /// Mounts postponed from the pre-fork stage to the child stage.
    pub delayed: Vec<(String, String)>,
    populated: bool,
}

impl MountTable {
    pub fn new(phase: MountPhase) -> Self {
        Self {
            table: HashMap::new(),
            phase,
            delayed: Vec::new(),
            populated: false,
        }
    }

    /// Load the host's mounts from `/proc/mounts`. Idempotent.
    pub fn populate(&mut self) -> Result<()> {
        if self.populated {
            return Ok(());
        }
        self.populated = true;
        let contents = std::fs::read_to_string("/proc/mounts")
            .map_err(JailError::io("open /proc/mounts"))?;
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(fsname), Some(dir), Some(fstype), Some(opts)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };
            let slot = MountSlot::new(&unescape_mntent(fsname), fstype, opts);
            self.table.insert(unescape_mntent(dir), slot);
        }
        Ok(())
    }

    pub fn get(&self, dir: &str) -> Option<&MountSlot> {
        self.table.get(dir)
    }

    pub fn insert(&mut self, dir: String, slot: MountSlot) {
        self.table.insert(dir, slot);
    }

    /// Mount points under `prefix`, deepest first (for unmounting).
    pub fn points_under(&self, prefix: &str) -> Vec<String> {
        let mut points: Vec<String> = self
            .table
            .keys()
            .filter(|dir| dir.starts_with(prefix))
            .cloned()
            .collect();
        points.sort_by(|a, b| b.len().cmp(&a.len()));
        points
    }

    /// Decide whether `src` should be mounted at `dst` in the current
    /// phase. May defer the mount to the child stage.
    fn mountable(&mut self, src: &str, dst: &str) -> bool {
        let Some(slot) = self.table.get(src) else {
            return false;
        };
        let fstype = slot.fstype.clone();
        let fstype = fstype.as_str();
        let wanted = slot.wanted;

        if (src == "/proc" && fstype == "proc") || (src == "/dev/pts" && fstype == "devpts") {
            self.phase == MountPhase::Child
        } else if src == "/tmp" && fstype == "tmpfs" {
            self.phase != MountPhase::PreFork
        } else if src == "/run" && fstype == "tmpfs" {
            false
        } else if (src == "/sys" && fstype == "sysfs") || (src == "/dev" && fstype == "udev") || wanted {
            if self.phase == MountPhase::PreFork {
                self.delayed.push((src.to_string(), dst.to_string()));
                false
            } else {
                true
            }
        } else {
            false
        }
    }

    /// Install the mount registered for `src` at `dst`, if this phase
    /// should. Flags are upgraded for child-stage binds and devpts, and a
    /// remount pass makes propagation flags effective after binds.
    pub fn install(
        &mut self,
        fs: &mut FsOps,
        dst_table: &mut HashMap<String, DstState>,
        src: &str,
        dst: &str,
        in_child: bool,
    ) -> Result<()> {
        if !self.mountable(src, dst) {
            return Ok(());
        }
        let slot = match self.table.get(src) {
            Some(slot) => slot.clone(),
            None => return Ok(()),
        };

        // identical mount already present on the host
        if !in_child {
            if let Some(existing) = self.table.get(dst) {
                if existing.fsname == slot.fsname
                    && existing.fstype == slot.fstype
                    && existing.opts == slot.opts
                    && existing.data == slot.data
                {
                    return Ok(());
                }
            }
        }

        if dst_table.get(dst).is_some_and(|&s| s > DstState::Copied) {
            return Ok(());
        }
        dst_table.insert(dst.to_string(), DstState::Mounted);

        if in_child {
            let _ = fs.ensure_dir(dst, 0o555, true);
        }

        let mut msx = slot;
        if msx.fstype == "devpts" && in_child {
            msx.add_mountopt("newinstance");
            msx.add_mountopt("ptmxmode=0666");
        }
        if msx.opts.contains(MsFlags::MS_BIND) && in_child {
            msx.add_mountopt("slave");
        }

        let mut r = msx.mount(dst, msx.opts, fs);
        // a busy child mount can still be adjusted in place
        let busy = matches!(&r, Err(e) if e.raw_os_error() == Some(libc::EBUSY));
        if busy && !fs.dryrun && in_child {
            r = msx.mount(dst, msx.opts | MsFlags::MS_REMOUNT, fs);
        }
        if r.is_ok() && msx.opts.contains(MsFlags::MS_BIND) {
            r = msx.mount(dst, msx.opts | MsFlags::MS_REMOUNT, fs);
        }
        r.map_err(|err| JailError::Io(msx.debug_mount_command(dst, msx.opts), err))
    }

    /// Unmount one mount point. In dry-run the destination table is
    /// marked so a later `remove` skips the subtree.
    pub fn uninstall(
        &self,
        fs: &FsOps,
        dst_table: &mut HashMap<String, DstState>,
        dir: &str,
    ) -> Result<()> {
        fs.echo(format_args!("umount -i -n {}", dir));
        if fs.dryrun {
            dst_table.insert(dir.to_string(), DstState::Unmounted);
            return Ok(());
        }
        nix::mount::umount(dir)
            .map_err(|e| JailError::Io(
                format!("umount {}", dir),
                std::io::Error::from_raw_os_error(e as i32),
            ))
    }

    /// Map a jail path to the host directory that actually holds its
    /// bytes: a bind mount's source, or the path itself. Checks delayed
    /// mounts too, retrying once with the trailing slash toggled.
    pub fn unmounted(&self, dir: &str) -> String {
        let mut candidate = dir.to_string();
        for retried in [false, true] {
            if let Some(slot) = self.table.get(&candidate) {
                return if slot.opts.contains(MsFlags::MS_BIND) {
                    slot.fsname.clone()
                } else {
                    dir.to_string()
                };
            }
            for (src, dst) in &self.delayed {
                if dst == &candidate {
                    let bind = self
                        .table
                        .get(src)
                        .is_some_and(|s| s.opts.contains(MsFlags::MS_BIND));
                    return if bind { src.clone() } else { dir.to_string() };
                }
            }
            if retried || candidate.is_empty() {
                break;
            }
            if candidate.ends_with('/') && candidate.len() > 1 {
                candidate.pop();
            } else {
                candidate.push('/');
            }
        }
        dir.to_string()
    }
}

/// Decode the `\040`-style octal escapes getmntent(3) would handle.
fn unescape_mntent(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(field.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let val = (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0');
                out.push(val as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_unparse_options() {
        let slot = MountSlot::new("tmpfs", "tmpfs", "rw,nosuid,nodev,size=65536k");
        assert!(slot.opts.contains(MsFlags::MS_NOSUID));
        assert!(slot.opts.contains(MsFlags::MS_NODEV));
        assert!(!slot.opts.contains(MsFlags::MS_RDONLY));
        assert_eq!(slot.data, "size=65536k");
        assert_eq!(
            slot.debug_mount_command("/j/tmp", slot.opts),
            "mount -i -n -t tmpfs -o rw,nodev,nosuid,size=65536k tmpfs /j/tmp"
        );
    }

    #[test]
    fn bind_command_shape() {
        let slot = MountSlot::new("/src", "none", "bind,rec,unbindable");
        let cmd = slot.debug_mount_command("/j/dst", slot.opts);
        assert!(cmd.contains("--rbind"), "{cmd}");
        let ro = MountSlot::new("/src", "none", "bind,ro");
        let cmd = ro.debug_mount_command("/j/dst", ro.opts);
        assert!(cmd.contains("--bind"), "{cmd}");
        assert!(cmd.contains("ro"), "{cmd}");
    }

    #[test]
    fn rw_clears_readonly() {
        let mut slot = MountSlot::new("/src", "none", "bind,ro");
        assert!(slot.opts.contains(MsFlags::MS_RDONLY));
        slot.add_mountopt("rw");
        assert!(!slot.opts.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn add_mountopt_replaces_same_key() {
        let mut slot = MountSlot::new("devpts", "devpts", "gid=5,mode=620,ptmxmode=000");
        slot.add_mountopt("ptmxmode=0666");
        slot.add_mountopt("newinstance");
        assert_eq!(slot.data, "gid=5,mode=620,ptmxmode=0666,newinstance");
    }

    #[test]
    fn unrecognized_options_roundtrip_in_order() {
        let slot = MountSlot::new("proc", "proc", "rw,alpha=1,nosuid,beta,gamma=x");
        assert_eq!(slot.data, "alpha=1,beta,gamma=x");
    }

    #[test]
    fn mountable_phase_rules() {
        let mut table = MountTable::new(MountPhase::Child);
        table.insert("/proc".into(), MountSlot::new("proc", "proc", "rw"));
        table.insert("/tmp".into(), MountSlot::new("tmpfs", "tmpfs", "rw"));
        table.insert("/run".into(), MountSlot::new("tmpfs", "tmpfs", "rw"));
        table.insert("/sys".into(), MountSlot::new("sysfs", "sysfs", "rw"));
        assert!(table.mountable("/proc", "/j/proc"));
        assert!(table.mountable("/tmp", "/j/tmp"));
        assert!(!table.mountable("/run", "/j/run"));
        assert!(table.mountable("/sys", "/j/sys"));

        let mut table = MountTable::new(MountPhase::PreFork);
        table.insert("/proc".into(), MountSlot::new("proc", "proc", "rw"));
        table.insert("/tmp".into(), MountSlot::new("tmpfs", "tmpfs", "rw"));
        table.insert("/sys".into(), MountSlot::new("sysfs", "sysfs", "rw"));
        assert!(!table.mountable("/proc", "/j/proc"));
        assert!(!table.mountable("/tmp", "/j/tmp"));
        assert!(!table.mountable("/sys", "/j/sys"));
        assert_eq!(table.delayed, vec![("/sys".to_string(), "/j/sys".to_string())]);

        let mut table = MountTable::new(MountPhase::Manifest);
        table.insert("/tmp".into(), MountSlot::new("tmpfs", "tmpfs", "rw"));
        table.insert("/proc".into(), MountSlot::new("proc", "proc", "rw"));
        assert!(table.mountable("/tmp", "/j/tmp"));
        assert!(!table.mountable("/proc", "/j/proc"));
    }

    #[test]
    fn wanted_mounts_follow_sys_rules() {
        let mut table = MountTable::new(MountPhase::PreFork);
        let mut slot = MountSlot::new("/data", "none", "bind,rec");
        slot.wanted = true;
        table.insert("/data".into(), slot);
        assert!(!table.mountable("/data", "/j/data"));
        assert_eq!(table.delayed.len(), 1);

        table.phase = MountPhase::Child;
        assert!(table.mountable("/data", "/j/data"));
    }

    #[test]
    fn unmounted_resolves_bind_sources() {
        let mut table = MountTable::new(MountPhase::Manifest);
        let slot = MountSlot::new("/real/src", "none", "bind,rec");
        table.insert("/j/dst".into(), slot);
        assert_eq!(table.unmounted("/j/dst"), "/real/src");
        assert_eq!(table.unmounted("/j/dst/"), "/real/src");
        assert_eq!(table.unmounted("/j/other"), "/j/other");
    }

    #[test]
    fn mntent_unescape() {
        assert_eq!(unescape_mntent("/a\\040b"), "/a b");
        assert_eq!(unescape_mntent("/plain"), "/plain");
        assert_eq!(unescape_mntent("end\\"), "end\\");
    }
}
