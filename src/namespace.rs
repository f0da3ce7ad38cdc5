//! Privilege and namespace transition.
//!
//! `run` unshares mount, IPC, and pid namespaces, forks the controller
//! (pid 1 of the new pid namespace), pivots into the jail, and lowers the
//! effective identity to the jail user while keeping root in the saved id
//! for one final escalation at teardown.

use nix::mount::{umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{Gid, Uid};

use crate::builder::JailBuilder;
use crate::fsops::FsOps;
use crate::mounts::MountPhase;
use crate::owner::JailOwner;
use crate::paths::endslash;
use crate::types::{JailError, Result, ROOT};

fn nix_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Detach this process into fresh mount/IPC/pid namespaces. The next
/// fork's child becomes pid 1.
pub fn unshare_namespaces(fs: &FsOps) -> Result<()> {
    fs.echo(format_args!("-unshare-"));
    if fs.dryrun {
        return Ok(());
    }
    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWPID)
        .map_err(|e| JailError::Privilege("unshare".into(), nix_io(e)))
}

/// Runs in the controller, inside the new namespaces: perform deferred
/// and namespace-only mounts, then `pivot_root` into the jail.
#[cfg(target_os = "linux")]
pub fn enter_jail(builder: &mut JailBuilder, jdir: &str) -> Result<()> {
    let jdir = endslash(jdir);
    builder.mounts.phase = MountPhase::Child;

    let unmounted_jdir = endslash(&builder.mounts.unmounted(&jdir));
    let parent_mnt = format!("{}mnt/.parent", jdir);
    let unmounted_parent_mnt = format!("{}mnt/.parent", unmounted_jdir);
    builder
        .fs
        .ensure_dir(&unmounted_parent_mnt, 0o777, true)
        .map_err(|e| JailError::Privilege(
            format!("mkdir -p {}", unmounted_parent_mnt),
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        ))?;

    // Some distributions make / a shared mount, which would propagate
    // everything we do here back to the host despite CLONE_NEWNS.
    builder.fs.echo(format_args!("mount --make-rslave /"));
    if !builder.fs.dryrun {
        nix::mount::mount(
            Some("none"),
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&str>,
        )
        .map_err(|e| JailError::Privilege("mount --make-rslave /".into(), nix_io(e)))?;
    }

    builder.mounts.populate()?;
    let delayed = std::mem::take(&mut builder.mounts.delayed);
    for (src, dst) in delayed {
        builder.install_mount(&src, &dst, true);
    }
    for src in ["/proc", "/dev/pts", "/tmp", "/run"] {
        let dst = format!("{}{}", jdir, &src[1..]);
        builder.install_mount(src, &dst, true);
    }

    // pivot_root requires the new root to be a mount point; when the jail
    // sits on the root filesystem, bind it onto itself first
    if unmounted_jdir == jdir {
        builder.fs.echo(format_args!("mount --bind {}", jdir));
        if !builder.fs.dryrun {
            nix::mount::mount(
                Some(jdir.as_str()),
                jdir.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| JailError::Privilege(format!("mount --bind {}", jdir), nix_io(e)))?;
        }
    }

    builder
        .fs
        .echo(format_args!("pivot_root {} {}", jdir, parent_mnt));
    if !builder.fs.dryrun {
        nix::unistd::pivot_root(jdir.as_str(), parent_mnt.as_str())
            .map_err(|e| JailError::Privilege(
                format!("pivot_root {} {}", jdir, parent_mnt),
                nix_io(e),
            ))?;
    }
    builder.fs.echo(format_args!("cd /"));
    if !builder.fs.dryrun {
        nix::unistd::chdir("/").map_err(|e| JailError::Privilege("cd".into(), nix_io(e)))?;
    }
    let new_parent_mnt = &parent_mnt[jdir.len() - 1..];
    builder.fs.echo(format_args!("umount {}", new_parent_mnt));
    if !builder.fs.dryrun {
        umount2(new_parent_mnt, MntFlags::MNT_DETACH)
            .map_err(|e| JailError::Privilege(format!("umount {}", new_parent_mnt), nix_io(e)))?;
    }
    Ok(())
}

/// On other unix targets the namespace steps collapse to a plain chroot.
#[cfg(not(target_os = "linux"))]
pub fn enter_jail(builder: &mut JailBuilder, jdir: &str) -> Result<()> {
    let jdir = endslash(jdir);
    builder.fs.echo(format_args!("cd {}", jdir));
    if !builder.fs.dryrun {
        nix::unistd::chdir(jdir.as_str())
            .map_err(|e| JailError::Privilege(jdir.clone(), nix_io(e)))?;
    }
    builder.fs.echo(format_args!("chroot ."));
    if !builder.fs.dryrun {
        nix::unistd::chroot(".").map_err(|e| JailError::Privilege("chroot".into(), nix_io(e)))?;
    }
    Ok(())
}

/// Lower effective and real ids to the jail user, keeping root in the
/// saved set so the controller can escalate once more.
pub fn become_jail_user_keep_root(owner: &JailOwner, fs: &FsOps) -> Result<()> {
    fs.echo(format_args!("su {}", owner.uid));
    if fs.dryrun {
        return Ok(());
    }
    nix::unistd::setresgid(
        Gid::from_raw(owner.gid),
        Gid::from_raw(owner.gid),
        Gid::from_raw(ROOT as libc::gid_t),
    )
    .map_err(|e| JailError::Privilege("setresgid".into(), nix_io(e)))?;
    nix::unistd::setresuid(
        Uid::from_raw(owner.uid),
        Uid::from_raw(owner.uid),
        Uid::from_raw(ROOT),
    )
    .map_err(|e| JailError::Privilege("setresuid".into(), nix_io(e)))?;
    Ok(())
}

/// Permanent drop in the payload child: all three ids become the jail
/// user, with no way back.
pub fn become_jail_user_forever(owner: &JailOwner) -> Result<()> {
    nix::unistd::setresgid(
        Gid::from_raw(owner.gid),
        Gid::from_raw(owner.gid),
        Gid::from_raw(owner.gid),
    )
    .map_err(|e| JailError::Privilege("setresgid".into(), nix_io(e)))?;
    nix::unistd::setresuid(
        Uid::from_raw(owner.uid),
        Uid::from_raw(owner.uid),
        Uid::from_raw(owner.uid),
    )
    .map_err(|e| JailError::Privilege("setresuid".into(), nix_io(e)))?;
    Ok(())
}
