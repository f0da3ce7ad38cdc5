//! Jail policy configuration.
//!
//! `/etc/pa-jail.conf` is a small root-owned rule list deciding which
//! directories may become jails or skeletons, and where the shared tree of
//! jails lives. One rule per line:
//!
//! ```text
//! (enable|allow|disable|no)(jail|skeleton)  [PATTERN]
//! treedir PATTERN
//! ```
//!
//! Patterns are absolute-path globs matched with pathname/period
//! semantics. Evaluation is last-match-wins within each scope: the last
//! global rule decides the global bit, the last matching pattern rule
//! decides the local bit, and a `disable` anywhere wins over allows.

use std::io::Read;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

use crate::glob::dirmatch;
use crate::paths::endslash;
use crate::types::{JailError, Result, ROOT};

pub const POLICY_PATH: &str = "/etc/pa-jail.conf";
const POLICY_MAX: usize = 8192;

/// What a policy rule can allow or deny.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PolicyKind {
    Jail,
    Skeleton,
}

impl PolicyKind {
    fn suffix(self) -> &'static str {
        match self {
            PolicyKind::Jail => "jail",
            PolicyKind::Skeleton => "skeleton",
        }
    }
}

/// Outcome of evaluating a directory against the policy.
#[derive(Clone, Debug, Default)]
pub struct PolicyQuery {
    pub allowed: bool,
    /// The shared ancestor under which related jails live, derived from
    /// the matching allow pattern or an explicit `treedir` rule.
    pub treedir: String,
    /// The pattern of the rule that decided the local bit; used to explain
    /// refusals.
    pub pattern: String,
}

impl PolicyQuery {
    /// Second line of a refusal message, naming the deciding pattern.
    pub fn disable_message(&self) -> String {
        if self.pattern.is_empty() {
            String::new()
        } else {
            format!("  (disabled by {})\n", self.pattern)
        }
    }
}

pub struct JailPolicy {
    text: String,
}

impl JailPolicy {
    /// Read the system policy. The file must be a root-owned regular file,
    /// not writable by group (unless the group is root) or other, and no
    /// larger than 8 KiB.
    pub fn open_system() -> Result<Self> {
        Self::open_at(POLICY_PATH)
    }

    fn open_at(path: &str) -> Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(path)
            .map_err(JailError::io(path))?;
        let meta = file.metadata().map_err(JailError::io(path))?;
        if !writable_only_by_root(&meta) {
            return Err(JailError::Policy(format!("{}: Writable by non-root", path)));
        }

        let mut buf = Vec::with_capacity(POLICY_MAX + 1);
        file.by_ref()
            .take(POLICY_MAX as u64 + 1)
            .read_to_end(&mut buf)
            .map_err(JailError::io(path))?;
        if buf.is_empty() {
            return Err(JailError::Policy(format!("{}: Empty file", path)));
        }
        if buf.len() > POLICY_MAX {
            return Err(JailError::Policy(format!(
                "{}: Too big, max {} bytes",
                path, POLICY_MAX
            )));
        }
        Ok(Self {
            text: String::from_utf8_lossy(&buf).into_owned(),
        })
    }

    /// Build a policy from text, bypassing file checks.
    pub fn from_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }

    pub fn allow_jail(&self, dir: &str) -> PolicyQuery {
        self.evaluate(PolicyKind::Jail, dir, false)
    }

    /// Like `allow_jail`, but `dir` may also be a descendant of an allowed
    /// jail directory (used for `--chown-user` targets).
    pub fn allow_jail_subdir(&self, dir: &str) -> PolicyQuery {
        self.evaluate(PolicyKind::Jail, dir, true)
    }

    pub fn allow_skeleton(&self, dir: &str) -> PolicyQuery {
        self.evaluate(PolicyKind::Skeleton, dir, false)
    }

    fn evaluate(&self, kind: PolicyKind, dir: &str, superdir: bool) -> PolicyQuery {
        let dir = endslash(dir);
        let mut allowed_globally: Option<bool> = None;
        let mut allowed_locally: Option<bool> = None;
        let mut query = PolicyQuery::default();

        for line in self.text.lines() {
            let mut words = line.split_whitespace();
            let Some(action) = words.next() else {
                continue;
            };
            let arg = words.next(); // extra words are ignored

            if action == "treedir" {
                if let Some(pattern) = arg.filter(|a| a.starts_with('/')) {
                    set_treedir(&mut query.treedir, &endslash(pattern), &dir, true);
                }
                continue;
            }

            let allowed = if let Some(rest) = action
                .strip_prefix("disable")
                .or_else(|| action.strip_prefix("no"))
            {
                if rest != kind.suffix() {
                    continue;
                }
                false
            } else if let Some(rest) = action
                .strip_prefix("enable")
                .or_else(|| action.strip_prefix("allow"))
            {
                if rest != kind.suffix() {
                    continue;
                }
                true
            } else {
                continue;
            };

            match arg {
                None => {
                    allowed_globally = Some(allowed);
                    if !allowed {
                        allowed_locally = Some(false);
                    }
                    query.pattern.clear();
                }
                Some(pattern) if pattern.starts_with('/') => {
                    let pattern = endslash(pattern);
                    // disables also match when `dir` is merely a prefix of
                    // the pattern's depth
                    if check_dirmatch(&pattern, &dir, superdir || !allowed).is_some() {
                        allowed_locally = Some(allowed);
                        query.pattern = pattern.clone();
                        if allowed {
                            set_treedir(&mut query.treedir, &pattern, &dir, false);
                        }
                    }
                }
                Some(_) => {}
            }
        }

        query.allowed = allowed_globally != Some(false) && allowed_locally == Some(true);
        query
    }
}

fn writable_only_by_root(meta: &std::fs::Metadata) -> bool {
    meta.is_file()
        && meta.uid() == ROOT
        && (meta.gid() == ROOT as libc::gid_t || meta.mode() & 0o020 == 0)
        && meta.mode() & 0o002 == 0
}

/// Match `dir` against `pattern`. With `superdir`, `dir` is first
/// truncated to the same number of slash-separated components as the
/// pattern, so deeper paths match rules written for their ancestors.
/// Returns the (possibly truncated) matched directory.
fn check_dirmatch(pattern: &str, dir: &str, superdir: bool) -> Option<String> {
    let candidate = if superdir {
        let depth = pattern.matches('/').count();
        let mut end = 0;
        let mut seen = 0;
        for (i, ch) in dir.char_indices() {
            if ch == '/' {
                seen += 1;
                end = i + 1;
                if seen == depth {
                    break;
                }
            }
        }
        if seen < depth {
            return None;
        }
        dir[..end].to_string()
    } else {
        dir.to_string()
    };
    if dirmatch(pattern, &candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Derive a tree directory from an allow pattern: an implicit pattern
/// ending in `/*/` is chopped to the segment above, then matched as a
/// superdirectory of `dir`. The shortest candidate wins.
fn set_treedir(treedir: &mut String, pattern: &str, dir: &str, explicit: bool) {
    let mut pattern = pattern.to_string();
    if !explicit && pattern.len() > 3 && pattern.ends_with("/*/") {
        pattern.truncate(pattern.len() - 2);
    }
    if let Some(superdir) = check_dirmatch(&pattern, dir, true) {
        if treedir.is_empty() || treedir.len() > superdir.len() {
            *treedir = superdir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_patterns_and_treedir() {
        let jc = JailPolicy::from_text("enablejail /jails/run*\nenablejail /jails/~*\n");
        let q = jc.allow_jail("/jails/run");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/run/");
        let q = jc.allow_jail("/jails/run/");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/run/");
        assert!(!jc.allow_jail("/jails").allowed);
        assert!(!jc.allow_jail("/jails/").allowed);
        assert!(!jc.allow_jail("/jails/runa/runb").allowed);
        assert!(!jc.allow_jail("/jails/runa/runb/").allowed);
        assert!(jc.allow_jail_subdir("/jails/runa/runb").allowed);
        assert!(jc.allow_jail_subdir("/jails/runa/runb/").allowed);
        let q = jc.allow_jail("/jails/runa");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/runa/");
        let q = jc.allow_jail("/jails/~runa");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/~runa/");
    }

    #[test]
    fn global_disable_wins() {
        let jc =
            JailPolicy::from_text("enablejail /jails/run*\nenablejail /jails/~*\ndisablejail /\n");
        for dir in [
            "/jails/run",
            "/jails/run/",
            "/jails",
            "/jails/",
            "/jails/runa/runb",
            "/jails/runa",
            "/jails/~runa",
        ] {
            assert!(!jc.allow_jail(dir).allowed, "{dir}");
        }
    }

    #[test]
    fn specific_disable_beats_allow() {
        let jc = JailPolicy::from_text(
            "enablejail /jails/run*\nenablejail /jails/~*\ndisablejail /jails/runa\n",
        );
        assert!(jc.allow_jail("/jails/run").allowed);
        assert!(jc.allow_jail("/jails/run/").allowed);
        assert!(!jc.allow_jail("/jails").allowed);
        assert!(!jc.allow_jail("/jails/runa").allowed);
        assert!(!jc.allow_jail("/jails/runa/").allowed);
        assert!(!jc.allow_jail("/jails/runa/runb").allowed);
        assert!(jc.allow_jail("/jails/~runa").allowed);
        let q = jc.allow_jail("/jails/runa");
        assert_eq!(q.disable_message(), "  (disabled by /jails/runa/)\n");
    }

    #[test]
    fn explicit_treedir_overrides() {
        let jc = JailPolicy::from_text(
            "enablejail /jails/run*\nenablejail /jails/~*\ntreedir /jails\n",
        );
        let q = jc.allow_jail("/jails/run");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/");
        let q = jc.allow_jail("/jails/runa");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/");
        let q = jc.allow_jail("/jails/~runa");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/");
        assert!(!jc.allow_jail("/jails").allowed);
    }

    #[test]
    fn non_matching_treedir_falls_back_to_pattern() {
        let jc = JailPolicy::from_text(
            "enablejail /jails/run*\nenablejail /jails/~*\ntreedir /hails\n",
        );
        let q = jc.allow_jail("/jails/run");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/run/");
        let q = jc.allow_jail("/jails/~runa");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/~runa/");
    }

    #[test]
    fn star_slash_pattern_derives_parent_treedir() {
        let jc = JailPolicy::from_text("enablejail /jails/*/\n");
        let q = jc.allow_jail("/jails/x");
        assert!(q.allowed);
        assert_eq!(q.treedir, "/jails/");
    }

    #[test]
    fn last_global_rule_wins() {
        let jc = JailPolicy::from_text("disablejail\nenablejail\nenablejail /j/*\n");
        assert!(jc.allow_jail("/j/a").allowed);
        let jc = JailPolicy::from_text("enablejail\ndisablejail\nenablejail /j/*\n");
        assert!(!jc.allow_jail("/j/a").allowed);
    }

    #[test]
    fn skeleton_rules_are_separate() {
        let jc = JailPolicy::from_text("enablejail /j/*\nenableskeleton /skel/*\n");
        assert!(jc.allow_jail("/j/a").allowed);
        assert!(!jc.allow_skeleton("/j/a").allowed);
        assert!(jc.allow_skeleton("/skel/a").allowed);
        assert!(!jc.allow_jail("/skel/a").allowed);
    }

    #[test]
    fn no_prefix_is_disable() {
        let jc = JailPolicy::from_text("enablejail /j/*\nnojail /j/bad\n");
        assert!(jc.allow_jail("/j/a").allowed);
        assert!(!jc.allow_jail("/j/bad").allowed);
    }

    #[test]
    fn extra_words_ignored() {
        let jc = JailPolicy::from_text("enablejail /j/* trailing words here\n");
        assert!(jc.allow_jail("/j/a").allowed);
    }
}
