//! Manifest parsing.
//!
//! A manifest is a tiny declarative program listing files to copy into
//! the jail, host directories to bind, and filesystems to mount:
//!
//! ```text
//! # comment
//! /etc/passwd
//! /usr/bin:
//! cc1 <- /usr/lib/gcc/cc1
//! /home/shared [bind-ro v3 /etc/pa-share.manifest]
//! /tmp [mount tmpfs size=16m,nosuid]
//! /bin/sh [cp]
//! ```
//!
//! The parser keeps two cursors, the current source directory and the
//! current destination subdirectory, both updated by `PATH:` headers.
//! Execution lives in `builder`.

/// Per-entry flags from the `[ … ]` suffix.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EntryFlags {
    /// Deep-copy even when the source is a symlink.
    pub cp: bool,
    pub bind: bool,
    pub bind_ro: bool,
    pub mount: bool,
}

impl EntryFlags {
    pub fn binds(&self) -> bool {
        self.bind || self.bind_ro
    }
}

/// `[bind TAG FILES]`: rebuild the bind source from FILES when its
/// recorded tag differs from TAG.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindTag {
    pub tag: String,
    pub files: String,
}

/// `[mount TYPE OPTS]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountSpec {
    pub fstype: String,
    pub options: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    /// Host path to read from. Absolute.
    pub src: String,
    /// Destination below the jail root. Absolute within the jail.
    pub dst: String,
    pub flags: EntryFlags,
    pub bind_tag: Option<BindTag>,
    pub mount_spec: Option<MountSpec>,
}

#[derive(Debug)]
pub struct ManifestParser {
    cur_src_dir: String,
    cur_dst_subdir: String,
}

impl Default for ManifestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestParser {
    pub fn new() -> Self {
        Self {
            cur_src_dir: "/".to_string(),
            cur_dst_subdir: "/".to_string(),
        }
    }

    /// Process one manifest line. Headers and blanks update state and
    /// yield nothing.
    pub fn parse_line(&mut self, raw: &str) -> Option<ManifestEntry> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(header) = line.strip_suffix(':') {
            self.set_dirs(header);
            return None;
        }

        let (name_part, flags, bind_tag, mount_spec) = match line.strip_suffix(']') {
            Some(inner) => {
                let open = inner.rfind('[')?;
                let (flags, bind_tag, mount_spec) = parse_flags(&inner[open + 1..]);
                (inner[..open].trim_end(), flags, bind_tag, mount_spec)
            }
            None => (line, EntryFlags::default(), None, None),
        };
        if name_part.is_empty() {
            return None;
        }

        let (left, src) = match name_part.split_once(" <- ") {
            Some((left, right)) => (left, right.to_string()),
            None => {
                let src = if name_part.starts_with('/') {
                    name_part.to_string()
                } else {
                    format!("{}{}", self.cur_src_dir, name_part)
                };
                (name_part, src)
            }
        };
        let dst = format!(
            "{}{}",
            self.cur_dst_subdir,
            left.strip_prefix('/').unwrap_or(left)
        );

        Some(ManifestEntry {
            src,
            dst,
            flags,
            bind_tag,
            mount_spec,
        })
    }

    fn set_dirs(&mut self, header: &str) {
        let mut dir = if header == "." {
            "/".to_string()
        } else if let Some(rest) = header.strip_prefix("./") {
            format!("/{}", rest)
        } else if header.starts_with('/') {
            header.to_string()
        } else {
            format!("/{}", header)
        };
        while dir.len() > 1 && dir.ends_with("//") {
            dir.pop();
        }
        if !dir.ends_with('/') {
            dir.push('/');
        }
        self.cur_src_dir = dir.clone();
        self.cur_dst_subdir = dir;
    }
}

/// Parse the inside of a `[ … ]` flag block: `;`-separated groups whose
/// first word is the flag; `bind`/`bind-ro` consume two more words,
/// `mount` consumes a type word and the group remainder; everything else
/// in a group is ignored.
fn parse_flags(text: &str) -> (EntryFlags, Option<BindTag>, Option<MountSpec>) {
    let mut flags = EntryFlags::default();
    let mut bind_tag = None;
    let mut mount_spec = None;

    for group in text.split(';') {
        let group = group.trim_start();
        let mut words = group.split_whitespace();
        let Some(word) = words.next() else {
            continue;
        };
        match word {
            "cp" => flags.cp = true,
            "bind" | "bind-ro" => {
                if word == "bind" {
                    flags.bind = true;
                } else {
                    flags.bind_ro = true;
                }
                let tag = words.next().unwrap_or("").to_string();
                let files = words.next().unwrap_or("").to_string();
                if !tag.is_empty() && !files.is_empty() {
                    bind_tag = Some(BindTag { tag, files });
                }
            }
            "mount" => {
                flags.mount = true;
                // options run to the end of the group and may contain
                // spaces
                let rest = group.strip_prefix("mount").unwrap_or("").trim_start();
                let (fstype, options) = match rest.split_once(char::is_whitespace) {
                    Some((t, o)) => (t.to_string(), o.trim_start().to_string()),
                    None => (rest.to_string(), String::new()),
                };
                mount_spec = Some(MountSpec { fstype, options });
            }
            _ => {}
        }
    }
    (flags, bind_tag, mount_spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(text: &str) -> Vec<ManifestEntry> {
        let mut parser = ManifestParser::new();
        text.lines().filter_map(|l| parser.parse_line(l)).collect()
    }

    #[test]
    fn comments_and_blanks_skipped() {
        assert!(entries("# nothing\n\n   \n").is_empty());
    }

    #[test]
    fn plain_absolute_entry() {
        let e = &entries("/bin/ls\n")[0];
        assert_eq!(e.src, "/bin/ls");
        assert_eq!(e.dst, "/bin/ls");
        assert_eq!(e.flags, EntryFlags::default());
    }

    #[test]
    fn headers_set_both_cursors() {
        let es = entries("/usr/bin:\nls\ncat\n");
        assert_eq!(es[0].src, "/usr/bin/ls");
        assert_eq!(es[0].dst, "/usr/bin/ls");
        assert_eq!(es[1].src, "/usr/bin/cat");
    }

    #[test]
    fn dot_headers_normalize() {
        let es = entries(".:\n/etc/passwd\n");
        assert_eq!(es[0].dst, "/etc/passwd");
        let es = entries("./opt:\nx\n");
        assert_eq!(es[0].src, "/opt/x");
        let es = entries("opt//:\nx\n");
        assert_eq!(es[0].src, "/opt/x");
    }

    #[test]
    fn arrow_renames() {
        let es = entries("/usr/lib:\ncc1 <- /usr/libexec/gcc/cc1\n");
        assert_eq!(es[0].src, "/usr/libexec/gcc/cc1");
        assert_eq!(es[0].dst, "/usr/lib/cc1");
    }

    #[test]
    fn cp_flag() {
        let e = &entries("/bin/sh [cp]\n")[0];
        assert!(e.flags.cp);
        assert!(!e.flags.binds());
    }

    #[test]
    fn bind_with_tag() {
        let e = &entries("/home/shared [bind-ro v3 /etc/share.manifest]\n")[0];
        assert!(e.flags.bind_ro);
        assert!(!e.flags.bind);
        let tag = e.bind_tag.as_ref().unwrap();
        assert_eq!(tag.tag, "v3");
        assert_eq!(tag.files, "/etc/share.manifest");
        assert_eq!(e.src, "/home/shared");
        assert_eq!(e.dst, "/home/shared");
    }

    #[test]
    fn bind_without_tag() {
        let e = &entries("/data [bind]\n")[0];
        assert!(e.flags.bind);
        assert!(e.bind_tag.is_none());
    }

    #[test]
    fn mount_spec_keeps_options() {
        let e = &entries("/tmp [mount tmpfs size=16m,nosuid]\n")[0];
        assert!(e.flags.mount);
        let spec = e.mount_spec.as_ref().unwrap();
        assert_eq!(spec.fstype, "tmpfs");
        assert_eq!(spec.options, "size=16m,nosuid");
    }

    #[test]
    fn combined_flags_in_groups() {
        let e = &entries("/x [cp; mount tmpfs size=1m]\n")[0];
        assert!(e.flags.cp);
        assert!(e.flags.mount);
    }

    #[test]
    fn unknown_flags_ignored() {
        let e = &entries("/x [frobnicate; cp]\n")[0];
        assert!(e.flags.cp);
    }

    #[test]
    fn missing_open_bracket_skips_line() {
        assert!(entries("/x cp]\n").is_empty());
    }
}
