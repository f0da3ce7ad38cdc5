//! Integration tests for jail construction.
//!
//! These run without privileges: they exercise manifest interpretation
//! and file replication on temporary trees. Scenarios that need real
//! root (policy file, pivot_root, pty relay) are marked `#[ignore]` and
//! only make sense on a throwaway machine.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use pa_jail::builder::JailBuilder;
use pa_jail::fsops::FsOps;
use pa_jail::manifest::ManifestParser;
use pa_jail::mounts::{MountPhase, MountTable};
use pa_jail::policy::JailPolicy;

fn copy_all(builder: &mut JailBuilder, manifest: &str) {
    let mut parser = ManifestParser::new();
    for line in manifest.lines() {
        if let Some(entry) = parser.parse_line(line) {
            assert!(
                !entry.flags.binds() && !entry.flags.mount,
                "test manifests only copy"
            );
            builder
                .handle_copy(&entry.src, &entry.dst, entry.flags.cp)
                .unwrap();
        }
    }
}

fn new_builder(jail: &Path, skel: &str) -> JailBuilder {
    JailBuilder::new(
        FsOps::new(false, false),
        MountTable::new(MountPhase::Manifest),
        jail.to_str().unwrap(),
        skel,
    )
}

#[test]
fn manifest_header_and_arrow_land_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let host = tmp.path().join("host");
    std::fs::create_dir_all(host.join("payload")).unwrap();
    std::fs::write(host.join("payload/tool"), "T").unwrap();
    std::fs::write(host.join("payload/extra"), "E").unwrap();
    let jail = tmp.path().join("jail");
    std::fs::create_dir(&jail).unwrap();

    let manifest = format!(
        "# test\n{h}/payload:\ntool\nrenamed <- {h}/payload/extra\n",
        h = host.display()
    );
    let mut b = new_builder(&jail, "");
    copy_all(&mut b, &manifest);

    // absolute manifest paths mirror the host layout inside the jail
    let tool = format!("{}{}/payload/tool", jail.display(), host.display());
    let renamed = format!("{}{}/payload/renamed", jail.display(), host.display());
    assert_eq!(std::fs::read_to_string(tool).unwrap(), "T");
    assert_eq!(std::fs::read_to_string(renamed).unwrap(), "E");
}

#[test]
fn two_jails_share_skeleton_inodes() {
    let tmp = tempfile::tempdir().unwrap();
    let host = tmp.path().join("host");
    std::fs::create_dir_all(host.join("bin")).unwrap();
    std::fs::write(host.join("bin/prog"), "binary contents").unwrap();
    let skel = tmp.path().join("skel");
    std::fs::create_dir(&skel).unwrap();

    let manifest = format!("/bin/prog <- {}/bin/prog\n", host.display());

    let mut inodes = Vec::new();
    for name in ["a", "b", "c"] {
        let jail = tmp.path().join(name);
        std::fs::create_dir(&jail).unwrap();
        let mut b = new_builder(&jail, skel.to_str().unwrap());
        copy_all(&mut b, &manifest);
        let meta = std::fs::metadata(jail.join("bin/prog")).unwrap();
        assert!(meta.nlink() >= 2, "expected a hard link into the skeleton");
        inodes.push((meta.dev(), meta.ino()));
    }
    inodes.dedup();
    assert_eq!(inodes.len(), 1, "all jails share one inode");
}

#[test]
fn rerun_with_unchanged_source_changes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let host = tmp.path().join("host");
    std::fs::create_dir_all(host.join("etc")).unwrap();
    std::fs::write(host.join("etc/passwd"), "root:x:0:0::/:/bin/sh\n").unwrap();
    std::fs::create_dir_all(host.join("lib")).unwrap();
    std::os::unix::fs::symlink("../etc/passwd", host.join("lib/alias")).unwrap();
    let jail = tmp.path().join("jail");
    std::fs::create_dir(&jail).unwrap();

    let manifest = format!("/etc/passwd <- {h}/etc/passwd\n/lib/alias <- {h}/lib/alias\n",
        h = host.display());

    let mut b = new_builder(&jail, "");
    copy_all(&mut b, &manifest);
    let snapshot = |p: &Path| {
        let m = std::fs::symlink_metadata(p).unwrap();
        (m.ino(), m.mtime(), m.mtime_nsec())
    };
    let before = (
        snapshot(&jail.join("etc/passwd")),
        snapshot(&jail.join("lib/alias")),
    );

    let mut b = new_builder(&jail, "");
    copy_all(&mut b, &manifest);
    let after = (
        snapshot(&jail.join("etc/passwd")),
        snapshot(&jail.join("lib/alias")),
    );
    assert_eq!(before, after);
}

#[test]
fn policy_and_builder_agree_on_tree_layout() {
    // the policy names a tree of jails; builders operate below it
    let policy = JailPolicy::from_text("enablejail /var/jails/*/\ntreedir /var/jails\n");
    let q = policy.allow_jail("/var/jails/cs61");
    assert!(q.allowed);
    assert_eq!(q.treedir, "/var/jails/");
    assert!(!policy.allow_jail("/var/other/cs61").allowed);
}

// The scenarios below require real root, a configured
// /etc/pa-jail.conf, and a disposable filesystem.

#[test]
#[ignore = "requires root and /etc/pa-jail.conf"]
fn add_then_run_true_exits_zero() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_pa-jail"))
        .args(["add", "-F", "/bin/ls\n", "/var/jails/pa-test", "nobody"])
        .status()
        .unwrap();
    assert!(status.success());

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_pa-jail"))
        .args(["run", "--fg", "/var/jails/pa-test", "nobody", "/bin/true"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
#[ignore = "requires root and /etc/pa-jail.conf"]
fn run_sleep_times_out_with_124() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_pa-jail"))
        .args([
            "run",
            "--fg",
            "-T",
            "0.1",
            "/var/jails/pa-test",
            "nobody",
            "/bin/sleep",
            "5",
        ])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(124));
}

#[test]
#[ignore = "requires root and /etc/pa-jail.conf"]
fn rm_erases_the_tree() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_pa-jail"))
        .args(["rm", "--fg", "-f", "/var/jails/pa-test"])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(!std::path::Path::new("/var/jails/pa-test").exists());
}
