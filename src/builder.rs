//! Jail construction: manifest execution and file replication.
//!
//! A `JailBuilder` owns every table construction needs: the destination
//! set (dedup and mount bookkeeping), the `(dev,ino)` map that powers
//! hard-link reuse, the ensured-directory cache, and the mount table.
//! Nothing here is process-global, so tests can run several builders.
//!
//! Replication preserves mode, owner, and mtime. Regular files are
//! copied with `/bin/cp -p`, or hard-linked against an earlier replica
//! (the skeleton tree when one is configured). Symlinks are recreated
//! verbatim and their targets scheduled transitively, so naming
//! `/bin/ls` is enough to pull in the chain it resolves through.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};

use crate::fsops::FsOps;
use crate::manifest::{BindTag, ManifestParser, MountSpec};
use crate::mounts::{MountSlot, MountTable};
use crate::paths::{endslash, noendslash, parentdir, shell_quote};
use crate::types::{DstState, JailError, Result, ROOT};

pub const BINDTAG_FILE: &str = ".pa-jail-bindtag";

pub struct JailBuilder {
    pub fs: FsOps,
    pub mounts: MountTable,
    /// Jail root, no trailing slash.
    pub dst_root: String,
    /// Skeleton root, no trailing slash; empty when none.
    pub link_dir: String,
    pub dst_table: HashMap<String, DstState>,
    devino: HashMap<(u64, u64), String>,
    last_parentdir: String,
}

impl JailBuilder {
    pub fn new(fs: FsOps, mounts: MountTable, dst_root: &str, link_dir: &str) -> Self {
        Self {
            fs,
            mounts,
            dst_root: noendslash(dst_root),
            link_dir: noendslash(link_dir),
            dst_table: HashMap::new(),
            devino: HashMap::new(),
            last_parentdir: String::new(),
        }
    }

    /// Interpret a manifest against the jail root. With `nomount`, bind
    /// and mount entries are ignored (used when rebuilding bind sources).
    /// Per-entry failures are reported and processing continues; the
    /// final result says whether everything succeeded.
    pub fn construct(&mut self, manifest: &str, nomount: bool) -> Result<()> {
        self.fs.chmod(&self.dst_root, 0o755)?;
        self.fs.lchown(&self.dst_root, ROOT, ROOT)?;
        self.dst_table
            .insert(format!("{}/", self.dst_root), DstState::Copied);

        self.mounts.populate()?;

        let mut parser = ManifestParser::new();
        for line in manifest.lines() {
            let Some(entry) = parser.parse_line(line) else {
                continue;
            };

            if entry.flags.binds() {
                if nomount {
                    continue;
                }
                if entry.flags.mount {
                    eprintln!("{}: [mount] option ignored", entry.src);
                }
                if let Some(tag) = &entry.bind_tag {
                    self.fix_bind_src(&entry.src, tag)?;
                }
                let opts = if entry.flags.bind_ro {
                    "bind,rec,unbindable,ro"
                } else {
                    "bind,rec,unbindable"
                };
                let mut slot = MountSlot::new(&entry.src, "none", opts);
                slot.wanted = true;
                self.install_wanted(&entry.src, &entry.dst, slot);
            } else if entry.flags.mount {
                if nomount {
                    continue;
                }
                let spec = entry.mount_spec.clone().unwrap_or(MountSpec {
                    fstype: String::new(),
                    options: String::new(),
                });
                let mut slot = MountSlot::new(&entry.src, &spec.fstype, &spec.options);
                slot.wanted = true;
                self.install_wanted(&entry.src, &entry.dst, slot);
            } else if let Err(err) = self.handle_copy(&entry.src, &entry.dst, entry.flags.cp) {
                self.fs.report(&err);
            }
        }

        if self.fs.failed {
            Err(JailError::Construct(format!(
                "{}: construction failed",
                self.dst_root
            )))
        } else {
            Ok(())
        }
    }

    /// Install a registered mount at an absolute destination, reporting
    /// (not propagating) failure the way construction errors behave.
    pub fn install_mount(&mut self, src: &str, dst: &str, in_child: bool) {
        if let Err(err) = self
            .mounts
            .install(&mut self.fs, &mut self.dst_table, src, dst, in_child)
        {
            self.fs.report(&err);
        }
    }

    fn install_wanted(&mut self, src: &str, dst: &str, slot: MountSlot) {
        self.mounts.insert(src.to_string(), slot);
        let full_dst = format!("{}{}", self.dst_root, dst);
        if let Err(err) = self.fs.ensure_dir(&full_dst, 0o555, true) {
            self.fs.report(&err);
        }
        if let Err(err) = self
            .mounts
            .install(&mut self.fs, &mut self.dst_table, src, &full_dst, false)
        {
            self.fs.report(&err);
        }
    }

    /// Check the tag stamped into a bind source; when stale, rebuild the
    /// source from its manifest and stamp the new tag.
    fn fix_bind_src(&mut self, src: &str, tag: &BindTag) -> Result<()> {
        let tagfile = format!("{}{}", endslash(src), BINDTAG_FILE);
        self.fs.echo(format_args!(
            "test {} = `cat {}`",
            shell_quote(&tag.tag),
            shell_quote(&tagfile)
        ));
        let got = std::fs::read_to_string(&tagfile).unwrap_or_default();
        if got.trim_end() == tag.tag {
            return Ok(());
        }

        let contents = std::fs::read_to_string(&tag.files)
            .map_err(JailError::io(tag.files.clone()))?;
        let saved_root = std::mem::replace(&mut self.dst_root, noendslash(src));
        let r = self.construct(&contents, true);
        self.dst_root = saved_root;
        // the tag is stamped even when the rebuild reported errors; the
        // run as a whole still exits nonzero
        if let Err(err) = r {
            self.fs.report(&err);
        }

        self.fs
            .echo(format_args!("echo {} > {}", shell_quote(&tag.tag), tagfile));
        if !self.fs.dryrun {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .custom_flags(libc::O_NOFOLLOW)
                .mode(0o600)
                .open(&tagfile)
                .map_err(JailError::io(tagfile.clone()))?;
            file.write_all(format!("{}\n", tag.tag).as_bytes())
                .map_err(JailError::io(tagfile.clone()))?;
        }
        Ok(())
    }

    /// Replicate `src` at `subdst` below the jail root (and the skeleton,
    /// when configured), materializing parents as needed.
    pub fn handle_copy(&mut self, src: &str, subdst: &str, deep_copy: bool) -> Result<()> {
        debug_assert!(subdst.starts_with('/'));
        debug_assert!(!self.dst_root.ends_with('/'));

        // lstat on a slash-terminated symlink path follows the symlink
        let src = noendslash(src);
        let subdst = noendslash(subdst);

        let dst = format!("{}{}", self.dst_root, subdst);
        if self.dst_table.contains_key(&dst) {
            return Ok(());
        }
        self.dst_table.insert(dst.clone(), DstState::Copied);

        let dst_parent = noendslash(&parentdir(&dst));
        if dst_parent != self.last_parentdir && dst_parent.len() > self.dst_root.len() {
            self.last_parentdir = dst_parent.clone();
            if !self.dst_table.contains_key(&dst_parent) {
                let src_parent = noendslash(&parentdir(&src));
                let sub_parent = dst_parent[self.dst_root.len()..].to_string();
                self.handle_copy(&src_parent, &sub_parent, false)?;
            }
        }

        let meta = std::fs::symlink_metadata(&src)
            .map_err(JailError::io(format!("lstat {}", src)))?;

        // skeleton first, so the jail copy below can hard-link to it
        if !self.link_dir.is_empty() {
            let skel_dst = format!("{}{}", self.link_dir, subdst);
            if let Err(err) = self.do_copy(&skel_dst, &src, &meta, true) {
                self.fs.report(&err);
            }
        }

        self.do_copy(&dst, &src, &meta, !deep_copy)?;

        if meta.is_dir() {
            self.mounts
                .install(&mut self.fs, &mut self.dst_table, &src, &dst, false)?;
        }
        Ok(())
    }

    fn do_copy(
        &mut self,
        dst: &str,
        src: &str,
        meta: &std::fs::Metadata,
        reuse_link: bool,
    ) -> Result<()> {
        let ftype = meta.file_type();
        let existing = std::fs::symlink_metadata(dst).ok();
        if let Some(dmeta) = &existing {
            let sizes_match = !(ftype.is_file() || ftype.is_symlink())
                || meta.size() == dmeta.size();
            let rdev_match = !(ftype.is_char_device() || ftype.is_block_device())
                || meta.rdev() == dmeta.rdev();
            let mtime_match = !(ftype.is_file() || ftype.is_symlink())
                || (meta.mtime() == dmeta.mtime() && meta.mtime_nsec() == dmeta.mtime_nsec());
            if meta.mode() == dmeta.mode()
                && meta.uid() == dmeta.uid()
                && meta.gid() == dmeta.gid()
                && sizes_match
                && rdev_match
                && mtime_match
            {
                if ftype.is_file() {
                    self.devino
                        .insert((meta.dev(), meta.ino()), dst.to_string());
                }
                return Ok(());
            }
        }

        if ftype.is_file() {
            if reuse_link {
                let key = (meta.dev(), meta.ino());
                if let Some(twin) = self.devino.get(&key) {
                    return self.fs.link(&twin.clone(), dst);
                }
                self.devino.insert(key, dst.to_string());
            }
            self.fs.cp_p(src, dst)?;
        } else if ftype.is_dir() {
            let perm = meta.mode() & 0o6777;
            if existing.as_ref().is_some_and(|d| !d.is_dir()) {
                return Err(JailError::Io(
                    dst.to_string(),
                    std::io::Error::from_raw_os_error(libc::ENOTDIR),
                ));
            }
            self.fs.mkdir(dst, perm)?;
        } else if ftype.is_char_device() || ftype.is_block_device() {
            self.fs.rm_f(dst)?;
            if src == "/dev/ptmx" {
                // the pty multiplexer must come from the jail's own devpts
                return self.fs.symlink("pts/ptmx", dst);
            }
            let mode = meta.mode()
                & (libc::S_IFREG
                    | libc::S_IFCHR
                    | libc::S_IFBLK
                    | libc::S_IFIFO
                    | libc::S_IFSOCK
                    | 0o6777);
            self.fs.mknod(dst, mode, meta.rdev())?;
        } else if ftype.is_symlink() {
            self.fs.rm_f(dst)?;
            let target = std::fs::read_link(src)
                .map_err(JailError::io(format!("readlink {}", src)))?;
            let target = target.to_string_lossy().into_owned();
            self.fs.symlink(&target, dst)?;
            self.fs.copy_mtime(dst, meta)?;
            self.handle_symlink_dst(dst.to_string(), src.to_string(), target)?;
        } else {
            return Err(JailError::Construct(format!("{}: Odd file type", src)));
        }

        if meta.uid() != ROOT || meta.gid() != ROOT as libc::gid_t {
            self.fs.lchown(dst, meta.uid(), meta.gid())?;
        }
        Ok(())
    }

    /// Schedule a copy of a symlink's target. The target path is derived
    /// by walking `src` and `dst` up one level per leading `../`; if the
    /// walk would escape the jail root (or the host root), the target is
    /// skipped.
    fn handle_symlink_dst(&mut self, dst: String, src: String, lnk: String) -> Result<()> {
        let root = if !self.link_dir.is_empty() && !dst.starts_with(&self.dst_root) {
            self.link_dir.clone()
        } else {
            self.dst_root.clone()
        };

        let (src, dst) = if lnk.starts_with('/') {
            (lnk.clone(), format!("{}{}", root, lnk))
        } else {
            let mut src = src;
            let mut dst = dst;
            let mut lnk = lnk.as_str();
            loop {
                if src.len() == 1 {
                    log::debug!("symlink target {} escapes the source root, skipping", lnk);
                    return Ok(());
                }
                let srcslash = src[..src.len() - 1].rfind('/');
                let dstslash = dst[..dst.len() - 1].rfind('/');
                let (Some(ss), Some(ds)) = (srcslash, dstslash) else {
                    log::debug!("symlink target {} has no parent, skipping", lnk);
                    return Ok(());
                };
                if ds < root.len() {
                    log::debug!("symlink target {} escapes {}, skipping", lnk, root);
                    return Ok(());
                }
                src.truncate(ss + 1);
                dst.truncate(ds + 1);
                if lnk.len() > 3 && lnk.starts_with("../") {
                    lnk = &lnk[3..];
                } else {
                    break;
                }
            }
            src.push_str(lnk);
            dst.push_str(lnk);
            (src, dst)
        };

        let subdst = &dst[root.len()..];
        if !subdst.starts_with("/proc/") {
            self.handle_copy(&src, subdst, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountPhase;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use std::path::Path;

    fn builder(root: &Path, skel: &str) -> JailBuilder {
        JailBuilder::new(
            FsOps::new(false, false),
            MountTable::new(MountPhase::Manifest),
            root.to_str().unwrap(),
            skel,
        )
    }

    fn mkfile(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn copies_file_and_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("host/usr/bin/tool");
        mkfile(&src, "#!bin");
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(src.to_str().unwrap(), "/usr/bin/tool", false)
            .unwrap();

        let copied = jail.join("usr/bin/tool");
        assert_eq!(std::fs::read_to_string(&copied).unwrap(), "#!bin");
        let src_meta = std::fs::metadata(&src).unwrap();
        let dst_meta = std::fs::metadata(&copied).unwrap();
        assert_eq!(src_meta.mode(), dst_meta.mode());
        assert_eq!(src_meta.mtime(), dst_meta.mtime());
    }

    #[test]
    fn duplicate_entries_copied_once() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("host/f");
        mkfile(&src, "x");
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(src.to_str().unwrap(), "/f", false).unwrap();
        let ino1 = std::fs::metadata(jail.join("f")).unwrap().ino();
        b.handle_copy(src.to_str().unwrap(), "/f", false).unwrap();
        let ino2 = std::fs::metadata(jail.join("f")).unwrap().ino();
        assert_eq!(ino1, ino2);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("host/etc/conf");
        mkfile(&src, "k=v");
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(src.to_str().unwrap(), "/etc/conf", false)
            .unwrap();
        let first = std::fs::metadata(jail.join("etc/conf")).unwrap();

        // fresh builder: same manifest, unchanged source
        let mut b = builder(&jail, "");
        b.handle_copy(src.to_str().unwrap(), "/etc/conf", false)
            .unwrap();
        let second = std::fs::metadata(jail.join("etc/conf")).unwrap();
        assert_eq!(first.ino(), second.ino(), "file was recopied");
    }

    #[test]
    fn skeleton_hard_link_reuse() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("host/lib/libx.so");
        mkfile(&src, "ELF");
        let skel = tmp.path().join("skel");
        std::fs::create_dir(&skel).unwrap();
        for jail_name in ["jail1", "jail2"] {
            let jail = tmp.path().join(jail_name);
            std::fs::create_dir(&jail).unwrap();
            let mut b = builder(&jail, skel.to_str().unwrap());
            b.handle_copy(src.to_str().unwrap(), "/lib/libx.so", false)
                .unwrap();
        }

        let skel_meta = std::fs::metadata(skel.join("lib/libx.so")).unwrap();
        for jail_name in ["jail1", "jail2"] {
            let meta = std::fs::metadata(tmp.path().join(jail_name).join("lib/libx.so")).unwrap();
            assert_eq!(meta.ino(), skel_meta.ino());
            assert_eq!(meta.dev(), skel_meta.dev());
            assert!(meta.nlink() >= 2);
        }
    }

    #[test]
    fn symlink_targets_pulled_in_transitively() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host");
        mkfile(&host.join("real/ls"), "REAL");
        std::fs::create_dir_all(host.join("bin")).unwrap();
        symlink("../real/ls", host.join("bin/ls")).unwrap();
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(host.join("bin/ls").to_str().unwrap(), "/bin/ls", false)
            .unwrap();

        let link = jail.join("bin/ls");
        let link_meta = std::fs::symlink_metadata(&link).unwrap();
        assert!(link_meta.file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(&link).unwrap().to_str().unwrap(),
            "../real/ls"
        );
        assert_eq!(
            std::fs::read_to_string(jail.join("real/ls")).unwrap(),
            "REAL"
        );
    }

    #[test]
    fn symlink_chain_of_two() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host");
        mkfile(&host.join("a/target"), "END");
        std::fs::create_dir_all(host.join("b")).unwrap();
        symlink("../a/middle", host.join("b/start")).unwrap();
        symlink("target", host.join("a/middle")).unwrap();
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(host.join("b/start").to_str().unwrap(), "/b/start", false)
            .unwrap();

        assert!(std::fs::symlink_metadata(jail.join("b/start"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert!(std::fs::symlink_metadata(jail.join("a/middle"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read_to_string(jail.join("a/target")).unwrap(), "END");
    }

    #[test]
    fn escaping_symlink_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host");
        std::fs::create_dir_all(host.join("bin")).unwrap();
        symlink("../../../outside", host.join("bin/esc")).unwrap();
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(host.join("bin/esc").to_str().unwrap(), "/bin/esc", false)
            .unwrap();
        // the link itself is present, its unreachable target is not
        assert!(std::fs::symlink_metadata(jail.join("bin/esc")).is_ok());
        assert!(std::fs::symlink_metadata(jail.join("outside")).is_err());
    }

    #[test]
    fn directory_modes_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host/opt");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(0o750)).unwrap();
        let jail = tmp.path().join("jail");
        std::fs::create_dir(&jail).unwrap();

        let mut b = builder(&jail, "");
        b.handle_copy(host.to_str().unwrap(), "/opt", false).unwrap();
        let mode = std::fs::metadata(jail.join("opt")).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }
}
